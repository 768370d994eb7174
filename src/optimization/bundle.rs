//! Joint refinement of intrinsics, distortion and every view's pose.
//!
//! One residual block per view ties three parameter blocks together:
//! `"intrinsics"` `[fx, fy, cx, cy]`, `"distortion"` (only the free rational
//! coefficients, the fixed ones stay zero) and `"pose/<i>"`
//! `[rx, ry, rz, tx, ty, tz]`. Residuals are projected minus observed pixels.

use crate::camera::rational::{distort_normalized, NUM_DISTORTION};
use crate::geometry::{rotate_axis_angle, Pose};
use nalgebra::{DVector, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

pub const INTRINSICS_KEY: &str = "intrinsics";
pub const DISTORTION_KEY: &str = "distortion";

pub fn pose_key(view: usize) -> String {
    format!("pose/{view}")
}

/// Reprojection residuals of one view.
#[derive(Debug, Clone)]
pub struct ViewReprojectionFactor {
    world: Vec<Vector3<f64>>,
    observed: Vec<Vector2<f64>>,
    /// Positions of the optimised coefficients inside the full rational set.
    free: Vec<usize>,
}

impl ViewReprojectionFactor {
    pub fn new(world: &[Vector3<f64>], observed: &[Vector2<f64>], free: &[usize]) -> Self {
        ViewReprojectionFactor {
            world: world.to_vec(),
            observed: observed.to_vec(),
            free: free.to_vec(),
        }
    }

    pub fn residual_count(&self) -> usize {
        self.observed.len() * 2
    }
}

/// Expands the free coefficients into the full `[k1 k2 p1 p2 k3 k4 k5 k6]` set.
pub fn expand_distortion<T: RealField>(free_values: &[T], free: &[usize]) -> Vec<T> {
    let mut full = vec![T::zero(); NUM_DISTORTION];
    for (value, &index) in free_values.iter().zip(free) {
        full[index] = value.clone();
    }
    full
}

impl<T: RealField> Factor<T> for ViewReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let intrinsics = &params[0];
        let fx = intrinsics[0].clone();
        let fy = intrinsics[1].clone();
        let cx = intrinsics[2].clone();
        let cy = intrinsics[3].clone();

        let free_values: Vec<T> = params[1].iter().cloned().collect();
        let coeffs = expand_distortion(&free_values, &self.free);

        let pose = &params[2];
        let rotation = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let translation = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let mut residuals = DVector::zeros(self.residual_count());
        for (i, (world, observed)) in self.world.iter().zip(&self.observed).enumerate() {
            let point: Vector3<T> = world.map(|v| nalgebra::convert::<f64, T>(v));
            let camera = rotate_axis_angle(&rotation, &point) + &translation;

            let x = camera.x.clone() / camera.z.clone();
            let y = camera.y.clone() / camera.z.clone();
            let (xd, yd) = distort_normalized(x, y, &coeffs);

            let u = fx.clone() * xd + cx.clone();
            let v = fy.clone() * yd + cy.clone();
            residuals[2 * i] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[2 * i + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

/// Sum of squared residuals of a view at the given parameter values.
pub fn view_squared_error(
    factor: &ViewReprojectionFactor,
    intrinsics: &DVector<f64>,
    distortion: &DVector<f64>,
    pose: &Pose,
) -> f64 {
    let pose = DVector::from_row_slice(&pose.to_params());
    let params = [intrinsics.clone(), distortion.clone(), pose];
    Factor::<f64>::residual_func(factor, &params).norm_squared()
}
