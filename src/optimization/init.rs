//! Closed-form starting point for the joint refinement.
//!
//! Each view contributes a board-to-image homography. With the principal
//! point fixed at the image centre, every homography gives two linear
//! constraints on `1/fx²` and `1/fy²` from the orthogonality of the board
//! axes; their least-squares solution seeds the focal lengths. Per-view poses
//! are then decomposed from the homographies under that intrinsic guess.

use crate::camera::{Intrinsics, Resolution};
use crate::geometry::Pose;
use crate::optimization::EstimationError;
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};

/// Hartley normalisation: centroid to the origin, mean distance `sqrt(2)`.
fn normalization(points: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let scale = 2.0_f64.sqrt() / mean_dist;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let h = t * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(h.x / h.z, h.y / h.z)
}

/// Estimates `H` with `image ~ H (x, y, 1)` by the normalised DLT.
pub fn homography(
    board: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, EstimationError> {
    let n = board.len();
    if n < 4 || image.len() != n {
        return Err(EstimationError::Degenerate(format!(
            "homography needs at least 4 matched points, got {n}"
        )));
    }
    let degenerate = || EstimationError::Degenerate("points are coincident".to_string());
    let t_board = normalization(board).ok_or_else(degenerate)?;
    let t_image = normalization(image).ok_or_else(degenerate)?;

    // at least 9 rows so the SVD keeps the full right null space
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (pw, pi)) in board.iter().zip(image).enumerate() {
        let w = apply(&t_board, pw);
        let m = apply(&t_image, pi);
        let (x, y, u, v) = (w.x, w.y, m.x, m.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| EstimationError::Degenerate("homography SVD failed".to_string()))?;
    let h = v_t.row(svd.singular_values.imin());
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| EstimationError::Degenerate("singular normalisation".to_string()))?;
    let mut hmat = t_image_inv * normalized * t_board;
    let scale = hmat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hmat /= scale;
    }
    Ok(hmat)
}

/// Initial intrinsic matrix from per-view homographies.
///
/// The principal point is placed at `((w - 1) / 2, (h - 1) / 2)`.
pub fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    resolution: Resolution,
) -> Result<Intrinsics, EstimationError> {
    if homographies.is_empty() {
        return Err(EstimationError::TooFewViews { views: 0, minimum: 1 });
    }
    let cx = (resolution.width as f64 - 1.0) * 0.5;
    let cy = (resolution.height as f64 - 1.0) * 0.5;

    let mut a = DMatrix::<f64>::zeros(2 * homographies.len(), 2);
    let mut b = DVector::<f64>::zeros(2 * homographies.len());

    for (i, h) in homographies.iter().enumerate() {
        let mut shifted = *h;
        for col in 0..3 {
            shifted[(0, col)] -= h[(2, col)] * cx;
            shifted[(1, col)] -= h[(2, col)] * cy;
        }

        let h1: Vector3<f64> = shifted.column(0).into_owned();
        let h2: Vector3<f64> = shifted.column(1).into_owned();
        let d1 = (h1 + h2) * 0.5;
        let d2 = (h1 - h2) * 0.5;
        let (Some(h1), Some(h2), Some(d1), Some(d2)) = (
            h1.try_normalize(f64::EPSILON),
            h2.try_normalize(f64::EPSILON),
            d1.try_normalize(f64::EPSILON),
            d2.try_normalize(f64::EPSILON),
        ) else {
            return Err(EstimationError::Degenerate(format!(
                "homography of view {i} has a vanishing column"
            )));
        };

        a[(2 * i, 0)] = h1.x * h2.x;
        a[(2 * i, 1)] = h1.y * h2.y;
        a[(2 * i + 1, 0)] = d1.x * d2.x;
        a[(2 * i + 1, 1)] = d1.y * d2.y;
        b[2 * i] = -h1.z * h2.z;
        b[2 * i + 1] = -d1.z * d2.z;
    }

    let f = a
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|e| EstimationError::Degenerate(format!("focal length system: {e}")))?;

    let fx = (1.0 / f[0].abs()).sqrt();
    let fy = (1.0 / f[1].abs()).sqrt();
    if !fx.is_finite() || !fy.is_finite() {
        return Err(EstimationError::Degenerate(
            "views do not constrain the focal length".to_string(),
        ));
    }
    Ok(Intrinsics { fx, fy, cx, cy })
}

/// Board pose from a homography and intrinsics, board plane at `z = 0`.
pub fn pose_from_homography(
    intrinsics: &Intrinsics,
    h: &Matrix3<f64>,
) -> Result<Pose, EstimationError> {
    let degenerate = || EstimationError::Degenerate("homography cannot be decomposed".to_string());
    let k_inv = intrinsics.to_matrix().try_inverse().ok_or_else(degenerate)?;

    let k_inv_h1: Vector3<f64> = k_inv * h.column(0);
    let k_inv_h2: Vector3<f64> = k_inv * h.column(1);
    let k_inv_h3: Vector3<f64> = k_inv * h.column(2);
    let denom = (k_inv_h1.norm() + k_inv_h2.norm()) * 0.5;
    if denom <= 1e-12 {
        return Err(degenerate());
    }
    let mut lambda = 1.0 / denom;
    // board in front of the camera
    if k_inv_h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = k_inv_h1 * lambda;
    let r2 = k_inv_h2 * lambda;
    let r3 = r1.cross(&r2);
    let translation = k_inv_h3 * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(degenerate());
    };
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        rotation = u * v_t;
    }

    Ok(Pose::from_rotation_matrix(&rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 600.0,
            fy: 590.0,
            cx: 319.5,
            cy: 239.5,
        }
    }

    fn board_points() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for r in 0..6 {
            for c in 0..9 {
                points.push(Vector2::new(c as f64 * 23.0, r as f64 * 23.0));
            }
        }
        points
    }

    fn project(intrinsics: &Intrinsics, pose: &Pose, board: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        board
            .iter()
            .map(|p| {
                let c = pose.transform(&Vector3::new(p.x, p.y, 0.0));
                Vector2::new(
                    intrinsics.fx * c.x / c.z + intrinsics.cx,
                    intrinsics.fy * c.y / c.z + intrinsics.cy,
                )
            })
            .collect()
    }

    fn poses() -> Vec<Pose> {
        vec![
            Pose::new(Vector3::new(0.3, 0.0, 0.0), Vector3::new(-90.0, -60.0, 450.0)),
            Pose::new(Vector3::new(0.0, -0.35, 0.1), Vector3::new(-100.0, -50.0, 420.0)),
            Pose::new(Vector3::new(-0.25, 0.25, -0.05), Vector3::new(-80.0, -70.0, 500.0)),
        ]
    }

    #[test]
    fn test_homography_maps_points() {
        let board = board_points();
        let pose = poses()[0];
        let image = project(&intrinsics(), &pose, &board);
        let h = homography(&board, &image).unwrap();
        for (b, i) in board.iter().zip(&image) {
            assert_relative_eq!(apply(&h, b), *i, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_homography_rejects_too_few_points() {
        let board = board_points();
        assert!(matches!(
            homography(&board[..3], &board[..3]),
            Err(EstimationError::Degenerate(_))
        ));
    }

    #[test]
    fn test_initial_intrinsics_recovers_focal_lengths() {
        let board = board_points();
        let truth = intrinsics();
        let hs: Vec<Matrix3<f64>> = poses()
            .iter()
            .map(|pose| homography(&board, &project(&truth, pose, &board)).unwrap())
            .collect();

        let guess = initial_intrinsics(&hs, Resolution::new(640, 480)).unwrap();
        assert_relative_eq!(guess.cx, 319.5);
        assert_relative_eq!(guess.cy, 239.5);
        assert_relative_eq!(guess.fx, truth.fx, max_relative = 1e-3);
        assert_relative_eq!(guess.fy, truth.fy, max_relative = 1e-3);
    }

    #[test]
    fn test_pose_from_homography() {
        let board = board_points();
        let truth = intrinsics();
        for pose in poses() {
            let h = homography(&board, &project(&truth, &pose, &board)).unwrap();
            let recovered = pose_from_homography(&truth, &h).unwrap();
            assert_relative_eq!(recovered.rotation, pose.rotation, epsilon = 1e-6);
            assert_relative_eq!(recovered.translation, pose.translation, epsilon = 1e-4);
        }
    }
}
