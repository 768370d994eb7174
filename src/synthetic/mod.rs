//! Renders chessboard views through a known camera.
//!
//! Each output pixel is traced back through the lens model onto the board
//! plane and shaded by square parity, with 4x4 supersampling for
//! anti-aliasing. Used to exercise the pipeline without recorded images.

use crate::board::BoardGeometry;
use crate::camera::{Intrinsics, RationalModel, Resolution};
use crate::geometry::Pose;
use image::{GrayImage, Luma};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::f64::consts::PI;

const DARK: f64 = 25.0;
const LIGHT: f64 = 235.0;
const BACKGROUND: f64 = 140.0;
const SUPERSAMPLE: usize = 4;
/// White border around the squares, in squares.
const MARGIN: f64 = 0.5;

/// Shade of a point on the board plane, in board units.
fn board_shade(board: &BoardGeometry, u: f64, v: f64) -> f64 {
    let s = board.square_size();
    let min = -s;
    let max_u = board.columns() as f64 * s;
    let max_v = board.rows() as f64 * s;

    if u >= min && u < max_u && v >= min && v < max_v {
        let parity = (u / s).floor() as i64 + (v / s).floor() as i64;
        if parity.rem_euclid(2) == 0 {
            DARK
        } else {
            LIGHT
        }
    } else if u >= min - MARGIN * s
        && u < max_u + MARGIN * s
        && v >= min - MARGIN * s
        && v < max_v + MARGIN * s
    {
        LIGHT
    } else {
        BACKGROUND
    }
}

/// Renders `board` seen from `pose` by `model`, at the model's resolution.
pub fn render_board(model: &RationalModel, board: &BoardGeometry, pose: &Pose) -> GrayImage {
    let width = model.resolution.width;
    let height = model.resolution.height;

    // normalized image point ~ [r1 r2 t] (u, v, 1)
    let rotation = pose.rotation_matrix();
    let homography = Matrix3::from_columns(&[
        rotation.column(0).into_owned(),
        rotation.column(1).into_owned(),
        pose.translation,
    ]);
    let Some(inverse) = homography.try_inverse() else {
        return GrayImage::from_pixel(width, height, Luma([BACKGROUND as u8]));
    };

    // undistorted rays at pixel corners; samples interpolate between them
    let stride = width as usize + 1;
    let rays: Vec<Option<Vector2<f64>>> = (0..=height)
        .flat_map(|y| (0..=width).map(move |x| (x, y)))
        .map(|(x, y)| {
            model
                .undistort_pixel(&Vector2::new(x as f64 - 0.5, y as f64 - 0.5))
                .ok()
        })
        .collect();

    GrayImage::from_fn(width, height, |x, y| {
        let corner = |dx: usize, dy: usize| rays[(y as usize + dy) * stride + x as usize + dx];
        let (Some(r00), Some(r10), Some(r01), Some(r11)) =
            (corner(0, 0), corner(1, 0), corner(0, 1), corner(1, 1))
        else {
            return Luma([BACKGROUND as u8]);
        };

        let mut total = 0.0;
        for sy in 0..SUPERSAMPLE {
            let fy = (sy as f64 + 0.5) / SUPERSAMPLE as f64;
            for sx in 0..SUPERSAMPLE {
                let fx = (sx as f64 + 0.5) / SUPERSAMPLE as f64;
                let ray = r00 * (1.0 - fx) * (1.0 - fy)
                    + r10 * fx * (1.0 - fy)
                    + r01 * (1.0 - fx) * fy
                    + r11 * fx * fy;
                let plane = inverse * Vector3::new(ray.x, ray.y, 1.0);
                // a negative scale means the ray meets the plane behind the camera
                total += if plane.z.abs() > f64::EPSILON && plane.z > 0.0 {
                    board_shade(board, plane.x / plane.z, plane.y / plane.z)
                } else {
                    BACKGROUND
                };
            }
        }
        let mean = total / (SUPERSAMPLE * SUPERSAMPLE) as f64;
        Luma([mean.round().clamp(0.0, 255.0) as u8])
    })
}

/// A deterministic spread of `count` board poses filling roughly half the
/// image width, with tilts of up to about 20 degrees.
pub fn standard_poses(model: &RationalModel, board: &BoardGeometry, count: usize) -> Vec<Pose> {
    let s = board.square_size();
    let center = Vector3::new(
        (board.columns() - 1) as f64 * s / 2.0,
        (board.rows() - 1) as f64 * s / 2.0,
        0.0,
    );
    let board_width = (board.columns() + 1) as f64 * s;
    let depth = model.intrinsics.fx * board_width / (0.55 * model.resolution.width as f64);

    (0..count)
        .map(|i| {
            let a = 2.0 * PI * i as f64 / count.max(1) as f64;
            let rotation = Vector3::new(0.35 * a.cos(), 0.35 * a.sin(), 0.1 * (3.0 * a).sin());
            let z = depth * (1.0 + 0.12 * (5.0 * a).sin());
            let offset = Vector3::new(0.06 * z * (2.0 * a).cos(), 0.05 * z * (3.0 * a).sin(), z);
            let pose = Pose::new(rotation, Vector3::zeros());
            // place the board centre at `offset`
            let translation = offset - pose.transform(&center);
            Pose::new(rotation, translation)
        })
        .collect()
}

/// 640x480 camera with moderate barrel distortion used for demo runs.
pub fn reference_camera() -> RationalModel {
    RationalModel {
        intrinsics: Intrinsics {
            fx: 560.0,
            fy: 555.0,
            cx: 322.5,
            cy: 241.0,
        },
        resolution: Resolution::new(640, 480),
        distortions: [-0.22, 0.06, 0.0, 0.0, -0.01, 0.0, 0.0, 0.0],
    }
}

/// Renders `count` views of `board` from [`standard_poses`], returning the
/// images together with the poses they were rendered at.
pub fn render_views(
    model: &RationalModel,
    board: &BoardGeometry,
    count: usize,
) -> (Vec<GrayImage>, Vec<Pose>) {
    let poses = standard_poses(model, board, count);
    let images = poses
        .iter()
        .map(|pose| render_board(model, board, pose))
        .collect();
    (images, poses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::project_world_point;

    fn model() -> RationalModel {
        RationalModel {
            intrinsics: Intrinsics {
                fx: 560.0,
                fy: 560.0,
                cx: 322.0,
                cy: 236.0,
            },
            resolution: Resolution::new(640, 480),
            distortions: [-0.12, 0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        }
    }

    #[test]
    fn test_standard_poses_keep_board_in_view() {
        let model = model();
        let board = BoardGeometry::new(9, 6, 23.0).unwrap();
        let poses = standard_poses(&model, &board, 25);
        assert_eq!(poses.len(), 25);

        for pose in &poses {
            for point in board.world_points() {
                let pixel = project_world_point(&model, pose, &point).unwrap();
                assert!(pixel.x > 20.0 && pixel.x < 620.0, "{pixel:?}");
                assert!(pixel.y > 20.0 && pixel.y < 460.0, "{pixel:?}");
            }
        }
    }

    #[test]
    fn test_render_shades_squares() {
        let model = model();
        let board = BoardGeometry::new(9, 6, 23.0).unwrap();
        let pose = standard_poses(&model, &board, 1)[0];
        let image = render_board(&model, &board, &pose);
        assert_eq!(image.dimensions(), (640, 480));

        // centre of the first square (between corners 0, 1, 9 and 10)
        let s = board.square_size();
        let dark_center = project_world_point(&model, &pose, &Vector3::new(s / 2.0, s / 2.0, 0.0)).unwrap();
        let light_center =
            project_world_point(&model, &pose, &Vector3::new(1.5 * s, s / 2.0, 0.0)).unwrap();
        let at = |p: Vector2<f64>| image.get_pixel(p.x.round() as u32, p.y.round() as u32)[0];
        assert!(at(dark_center) < 60);
        assert!(at(light_center) > 200);
        assert_eq!(image.get_pixel(0, 0)[0], BACKGROUND as u8);
    }
}
