//! Camera models used by the calibration pipeline.
//!
//! The estimated model is [`RationalModel`]: a pinhole intrinsic matrix plus
//! the 8-coefficient rational distortion polynomial (`k1 k2 p1 p2 k3 k4 k5 k6`).
//! [`PinholeModel`] is the distortion-free camera an undistorted image is
//! rendered into.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod pinhole;
pub mod rational;

pub use pinhole::PinholeModel;
pub use rational::RationalModel;

/// Focal lengths and principal point, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Builds the 3×3 intrinsic matrix `[fx 0 cx; 0 fy cy; 0 0 1]`.
    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Reads fx, fy, cx, cy back out of an intrinsic matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }
}

/// Image dimensions in pixels.
///
/// The calibration run latches this from the first accepted frame; every
/// later frame must match it exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    pub fn contains(&self, point: &Vector2<f64>) -> bool {
        point.x >= 0.0
            && point.x < self.width as f64
            && point.y >= 0.0
            && point.y < self.height as f64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
///
/// Reprojection scoring and the undistortion maps work through this trait, so
/// both the estimated [`RationalModel`] and the distortion-free
/// [`PinholeModel`] plug into them.
pub trait CameraModel {
    /// Projects a point given in camera coordinates to pixel coordinates.
    ///
    /// Points that land outside the image are still projected; only points at
    /// or behind the camera centre fail.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Back-projects a pixel to a unit-length ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn resolution(&self) -> Resolution;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(coeffs: &[f64]) -> Result<(), CameraModelError> {
        if let Some(idx) = coeffs.iter().position(|c| !c.is_finite()) {
            return Err(CameraModelError::InvalidParams(format!(
                "distortion coefficient {idx} is not finite"
            )));
        }
        Ok(())
    }
}
