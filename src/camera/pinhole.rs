//! Distortion-free pinhole camera.
//!
//! An undistorted image is rendered as if it were taken by a [`PinholeModel`]
//! whose intrinsic matrix is chosen by
//! [`optimal_new_camera_matrix`](crate::undistort::optimal_new_camera_matrix).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
}

impl PinholeModel {
    pub fn new(intrinsics: Intrinsics, resolution: Resolution) -> Result<Self, CameraModelError> {
        let model = PinholeModel {
            intrinsics,
            resolution,
        };
        model.validate_params()?;
        Ok(model)
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.to_matrix()
    }

    /// Pixel to normalized image plane coordinates; never fails for a valid model.
    pub fn pixel_to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        )
    }

    pub fn normalized_to_pixel(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.intrinsics.fx * normalized.x + self.intrinsics.cx,
            self.intrinsics.fy * normalized.y + self.intrinsics.cy,
        )
    }
}

impl CameraModel for PinholeModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(self.normalized_to_pixel(&Vector2::new(
            point_3d.x / point_3d.z,
            point_3d.y / point_3d.z,
        )))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let normalized = self.pixel_to_normalized(point_2d);
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}
