//! Implements the rational radial-tangential camera model.
//!
//! This is the model a chessboard calibration estimates: a pinhole intrinsic
//! matrix combined with the rational distortion polynomial
//!
//! ```text
//! radial = (1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)
//! x_d    = x radial + 2 p1 x y + p2 (r² + 2 x²)
//! y_d    = y radial + p1 (r² + 2 y²) + 2 p2 x y
//! ```
//!
//! Coefficients are stored in the OpenCV order `[k1, k2, p1, p2, k3, k4, k5, k6]`
//! so that persisted records are interchangeable with other calibration tools.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distortion coefficients of the rational model.
pub const NUM_DISTORTION: usize = 8;

/// Represents a camera with rational radial and tangential lens distortion.
///
/// # Examples
///
/// ```rust
/// use nalgebra::{DVector, Vector3};
/// use chessboard_calib::camera::{CameraModel, RationalModel, Resolution};
///
/// // fx, fy, cx, cy, k1, k2, p1, p2, k3, k4, k5, k6
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0,
///     -0.1, 0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
/// ]);
/// let mut model = RationalModel::new(&params).unwrap();
/// model.resolution = Resolution::new(640, 480);
///
/// let pixel = model.project(&Vector3::new(0.1, -0.05, 1.0)).unwrap();
/// assert!(pixel.x > 320.0 && pixel.y < 240.0);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RationalModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the calibrated images.
    pub resolution: Resolution,
    /// `[k1, k2, p1, p2, k3, k4, k5, k6]`
    pub distortions: [f64; NUM_DISTORTION],
}

/// Applies the rational distortion to a point on the normalized image plane.
///
/// Generic over [`RealField`] so the same expression is used for plain `f64`
/// evaluation and for the automatically differentiated solver residuals.
pub fn distort_normalized<T: RealField>(x: T, y: T, coeffs: &[T]) -> (T, T) {
    debug_assert!(coeffs.len() >= NUM_DISTORTION);

    let k1 = coeffs[0].clone();
    let k2 = coeffs[1].clone();
    let p1 = coeffs[2].clone();
    let p2 = coeffs[3].clone();
    let k3 = coeffs[4].clone();
    let k4 = coeffs[5].clone();
    let k5 = coeffs[6].clone();
    let k6 = coeffs[7].clone();

    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();

    let numerator = T::one() + k1 * r2.clone() + k2 * r4.clone() + k3 * r6.clone();
    let denominator = T::one() + k4 * r2.clone() + k5 * r4 + k6 * r6;
    let radial = numerator / denominator;

    let two = T::one() + T::one();
    let xy = x.clone() * y.clone();
    let x_tan = two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
    let y_tan = p1 * (r2 + two.clone() * y.clone() * y.clone()) + two * p2 * xy;

    (x * radial.clone() + x_tan, y * radial + y_tan)
}

impl RationalModel {
    /// Creates a model from `[fx, fy, cx, cy, k1, k2, p1, p2, k3, k4, k5, k6]`.
    ///
    /// The resolution is initialized to 0x0 and should be set by the caller.
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() != 4 + NUM_DISTORTION {
            return Err(CameraModelError::InvalidParams(format!(
                "Rational model expects {} parameters, got {}",
                4 + NUM_DISTORTION,
                parameters.len()
            )));
        }

        let mut distortions = [0.0; NUM_DISTORTION];
        distortions.copy_from_slice(&parameters.as_slice()[4..]);

        let model = RationalModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution::new(0, 0),
            distortions,
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from an intrinsic matrix and a coefficient list.
    ///
    /// Shorter coefficient lists (4, 5 or 8 entries, as written by other tools)
    /// are zero-padded to the full rational set.
    pub fn from_matrix(
        camera_matrix: &Matrix3<f64>,
        coeffs: &[f64],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        if coeffs.len() > NUM_DISTORTION {
            return Err(CameraModelError::InvalidParams(format!(
                "at most {NUM_DISTORTION} distortion coefficients are supported, got {}",
                coeffs.len()
            )));
        }
        let mut distortions = [0.0; NUM_DISTORTION];
        distortions[..coeffs.len()].copy_from_slice(coeffs);

        let model = RationalModel {
            intrinsics: Intrinsics::from_matrix(camera_matrix),
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.to_matrix()
    }

    /// Distorts a normalized point and maps it through the intrinsic matrix.
    pub fn normalized_to_pixel(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let (xd, yd) = distort_normalized(normalized.x, normalized.y, &self.distortions);
        Vector2::new(
            self.intrinsics.fx * xd + self.intrinsics.cx,
            self.intrinsics.fy * yd + self.intrinsics.cy,
        )
    }

    /// Whether the numerator and the denominator of the radial factor are both
    /// positive at the undistorted normalized point.
    ///
    /// Past the first zero of either, the fitted polynomial no longer
    /// describes the lens, so undistorted points found there are rejected.
    pub fn radial_is_regular(&self, normalized: &Vector2<f64>) -> bool {
        let [k1, k2, _, _, k3, k4, k5, k6] = self.distortions;
        let r2 = normalized.norm_squared();
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        1.0 + k1 * r2 + k2 * r4 + k3 * r6 > 0.0 && 1.0 + k4 * r2 + k5 * r4 + k6 * r6 > 0.0
    }

    /// Removes the distortion from a pixel, returning undistorted normalized coordinates.
    ///
    /// Solves `distort(p) = target` with Newton's method, starting from the
    /// distorted normalized point.
    pub fn undistort_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let target = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        self.undistort_normalized(&target)
    }

    fn undistort_normalized(&self, target: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let [k1, k2, p1, p2, k3, k4, k5, k6] = self.distortions;
        let mut point = *target;

        for _ in 0..MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let numerator = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let denominator = 1.0 + k4 * r2 + k5 * r4 + k6 * r6;
            if denominator.abs() < f64::EPSILON {
                return Err(CameraModelError::NumericalError(
                    "rational distortion denominator vanished".to_string(),
                ));
            }
            let radial = numerator / denominator;

            let estimate = Vector2::new(
                x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
            );
            let error = estimate - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            // d(radial)/d(r²), then chain through r² = x² + y²
            let d_num = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
            let d_den = k4 + 2.0 * k5 * r2 + 3.0 * k6 * r4;
            let d_radial = (d_num * denominator - numerator * d_den) / (denominator * denominator);
            let d_radial_dx = d_radial * 2.0 * x;
            let d_radial_dy = d_radial * 2.0 * y;

            let jacobian = Matrix2::new(
                radial + x * d_radial_dx + 2.0 * p1 * y + 6.0 * p2 * x,
                x * d_radial_dy + 2.0 * p1 * x + 2.0 * p2 * y,
                y * d_radial_dx + 2.0 * p1 * x + 2.0 * p2 * y,
                radial + y * d_radial_dy + 6.0 * p1 * y + 2.0 * p2 * x,
            );

            let delta = jacobian
                .try_inverse()
                .ok_or_else(|| CameraModelError::NumericalError("Jacobian is singular".to_string()))?
                * error;
            point -= delta;

            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {MAX_ITERATIONS} iterations."
        )))
    }
}

impl fmt::Debug for RationalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RationalModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RationalModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        Ok(self.normalized_to_pixel(&normalized))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let undistorted = self.undistort_pixel(point_2d)?;
        Ok(Vector3::new(undistorted.x, undistorted.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}
