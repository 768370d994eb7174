//! Board-to-camera poses in axis-angle form.

use nalgebra::{Matrix3, RealField, Rotation3, Vector3};

/// Rigid transform taking board coordinates into the camera frame.
///
/// `rotation` is an axis-angle (Rodrigues) vector whose norm is the angle in
/// radians, matching the `R` vectors written to the calibration record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    /// Builds a pose from a rotation matrix, which must already be orthonormal.
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = Rotation3::from_matrix_unchecked(*rotation).scaled_axis();
        Pose {
            rotation,
            translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Rotation3::new(self.rotation).into_inner()
    }

    /// Maps a board point into camera coordinates.
    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        rotate_axis_angle(&self.rotation, point) + self.translation
    }

    /// `[rx, ry, rz, tx, ty, tz]`, the layout used by the bundle adjustment.
    pub fn to_params(&self) -> [f64; 6] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn from_params(params: &[f64]) -> Self {
        Pose {
            rotation: Vector3::new(params[0], params[1], params[2]),
            translation: Vector3::new(params[3], params[4], params[5]),
        }
    }
}

/// Rotates `point` by the axis-angle vector `rotation` (Rodrigues' formula).
///
/// Near zero angle the first-order expansion `p + r × p` is used so the
/// expression stays differentiable for the dual numbers of the solver.
pub fn rotate_axis_angle<T: RealField>(rotation: &Vector3<T>, point: &Vector3<T>) -> Vector3<T> {
    let theta2 = rotation.dot(rotation);
    let small: T = nalgebra::convert(1e-16);
    if theta2 > small {
        let theta = theta2.sqrt();
        let axis = rotation / theta.clone();
        let cos_theta = theta.clone().cos();
        let sin_theta = theta.sin();
        let axis_dot = axis.dot(point);
        point * cos_theta.clone()
            + axis.cross(point) * sin_theta
            + axis * (axis_dot * (T::one() - cos_theta))
    } else {
        point + rotation.cross(point)
    }
}
