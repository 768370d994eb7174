//! The `optimization` module estimates the camera model from calibration views.
//!
//! Estimation runs in two stages:
//! 1. A closed-form initial guess ([`init`]): principal point at the image
//!    centre, focal lengths from the per-view homographies, poses decomposed
//!    from the same homographies.
//! 2. A joint Levenberg-Marquardt refinement ([`bundle`]) over the intrinsics,
//!    the free distortion coefficients and every view's pose, minimizing the
//!    reprojection error.
//!
//! Degenerate input (too few views, views that do not constrain the focal
//! length) and solver failures surface as [`EstimationError`]; a model that
//! comes out non-physical is never returned as a success.

use crate::acquisition::CalibrationSample;
use crate::camera::rational::NUM_DISTORTION;
use crate::camera::{validation, Intrinsics, RationalModel, Resolution};
use crate::geometry::Pose;

use log::{debug, info};
use nalgebra::{DVector, Matrix3, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

pub mod bundle;
pub mod init;

use bundle::{pose_key, ViewReprojectionFactor, DISTORTION_KEY, INTRINSICS_KEY};

#[derive(thiserror::Error, Debug)]
pub enum EstimationError {
    #[error("{views} views given, at least {minimum} required")]
    TooFewViews { views: usize, minimum: usize },
    #[error("Degenerate view geometry: {0}")]
    Degenerate(String),
    #[error("Solver diverged: {0}")]
    SolverDivergence(String),
    #[error("Non-physical calibration: {0}")]
    NonPhysical(String),
}

/// Which rational distortion coefficients the solver may change.
///
/// Fixed coefficients stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistortionFlags {
    /// Enables the denominator terms `k4 k5 k6`.
    pub rational_model: bool,
    /// Keeps `p1 p2` at zero.
    pub zero_tangent: bool,
    pub fix_k3: bool,
    pub fix_k4: bool,
    pub fix_k5: bool,
}

impl Default for DistortionFlags {
    /// Rational model, no tangential terms, `k4` and `k5` fixed: the solver
    /// optimises `k1 k2 k3 k6`.
    fn default() -> Self {
        DistortionFlags {
            rational_model: true,
            zero_tangent: true,
            fix_k3: false,
            fix_k4: true,
            fix_k5: true,
        }
    }
}

impl DistortionFlags {
    /// Indices into `[k1 k2 p1 p2 k3 k4 k5 k6]` of the optimised coefficients.
    pub fn free_indices(&self) -> Vec<usize> {
        let mut free = vec![0, 1];
        if !self.zero_tangent {
            free.extend([2, 3]);
        }
        if !self.fix_k3 {
            free.push(4);
        }
        if self.rational_model {
            if !self.fix_k4 {
                free.push(5);
            }
            if !self.fix_k5 {
                free.push(6);
            }
            free.push(7);
        }
        free
    }
}

/// Result of a calibration: the camera model plus one pose per view.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub model: RationalModel,
    /// Board-to-camera pose of each sample, in sample order.
    pub extrinsics: Vec<Pose>,
    /// RMS of the solver's final residuals, in pixels.
    pub solver_rms: f64,
}

#[derive(Debug, Clone)]
pub struct IntrinsicEstimator {
    pub flags: DistortionFlags,
    pub max_iterations: usize,
}

impl Default for IntrinsicEstimator {
    fn default() -> Self {
        IntrinsicEstimator {
            flags: DistortionFlags::default(),
            max_iterations: 100,
        }
    }
}

impl IntrinsicEstimator {
    /// Fewer views leave the intrinsics under-determined.
    pub const MIN_VIEWS: usize = 3;

    pub fn new(flags: DistortionFlags, max_iterations: usize) -> Self {
        IntrinsicEstimator {
            flags,
            max_iterations,
        }
    }

    /// Closed-form intrinsics and per-view poses used to seed the solver.
    pub fn initial_guess(
        &self,
        samples: &[CalibrationSample],
        resolution: Resolution,
    ) -> Result<(Intrinsics, Vec<Pose>), EstimationError> {
        let homographies = samples
            .iter()
            .map(|sample| {
                let board: Vec<Vector2<f64>> = sample
                    .world_points()
                    .iter()
                    .map(|p| Vector2::new(p.x, p.y))
                    .collect();
                init::homography(&board, sample.corners().points())
            })
            .collect::<Result<Vec<Matrix3<f64>>, _>>()?;

        let intrinsics = init::initial_intrinsics(&homographies, resolution)?;
        let poses = homographies
            .iter()
            .map(|h| init::pose_from_homography(&intrinsics, h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((intrinsics, poses))
    }

    /// Estimates the camera model and the pose of every view.
    pub fn estimate(
        &self,
        samples: &[CalibrationSample],
        resolution: Resolution,
    ) -> Result<Calibration, EstimationError> {
        if samples.len() < Self::MIN_VIEWS {
            return Err(EstimationError::TooFewViews {
                views: samples.len(),
                minimum: Self::MIN_VIEWS,
            });
        }
        if resolution.width == 0 || resolution.height == 0 {
            return Err(EstimationError::Degenerate(format!(
                "invalid image size {resolution}"
            )));
        }

        let (guess, poses) = self.initial_guess(samples, resolution)?;
        debug!(
            "initial intrinsics: fx {:.3} fy {:.3} cx {:.3} cy {:.3}",
            guess.fx, guess.fy, guess.cx, guess.cy
        );

        let free = self.flags.free_indices();
        let mut problem = tiny_solver::Problem::new();
        let mut factors = Vec::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            let factor = ViewReprojectionFactor::new(
                sample.world_points(),
                sample.corners().points(),
                &free,
            );
            let key = pose_key(i);
            problem.add_residual_block(
                factor.residual_count(),
                &[INTRINSICS_KEY, DISTORTION_KEY, key.as_str()],
                Box::new(factor.clone()),
                None,
            );
            factors.push(factor);
        }

        let mut initial_values = HashMap::new();
        initial_values.insert(
            INTRINSICS_KEY.to_string(),
            DVector::from_vec(vec![guess.fx, guess.fy, guess.cx, guess.cy]),
        );
        initial_values.insert(DISTORTION_KEY.to_string(), DVector::zeros(free.len()));
        for (i, pose) in poses.iter().enumerate() {
            initial_values.insert(pose_key(i), DVector::from_row_slice(&pose.to_params()));
        }

        info!(
            "refining {} intrinsic, {} distortion and {} pose parameters over {} views",
            4,
            free.len(),
            6 * samples.len(),
            samples.len()
        );
        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            ..OptimizerOptions::default()
        };
        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| {
                EstimationError::SolverDivergence("Levenberg-Marquardt did not converge".to_string())
            })?;

        let missing = |key: &str| EstimationError::SolverDivergence(format!("solver dropped {key}"));
        let intrinsics_values = result
            .get(INTRINSICS_KEY)
            .ok_or_else(|| missing(INTRINSICS_KEY))?;
        let distortion_values = result
            .get(DISTORTION_KEY)
            .ok_or_else(|| missing(DISTORTION_KEY))?;
        let extrinsics = (0..samples.len())
            .map(|i| {
                let key = pose_key(i);
                result
                    .get(&key)
                    .map(|values| Pose::from_params(values.as_slice()))
                    .ok_or_else(|| missing(&key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let intrinsics = Intrinsics {
            fx: intrinsics_values[0],
            fy: intrinsics_values[1],
            cx: intrinsics_values[2],
            cy: intrinsics_values[3],
        };
        let full = bundle::expand_distortion(distortion_values.as_slice(), &free);
        let mut distortions = [0.0; NUM_DISTORTION];
        distortions.copy_from_slice(&full);

        check_physical(&intrinsics, &distortions, &extrinsics, resolution)?;

        let squared: f64 = factors
            .iter()
            .zip(&extrinsics)
            .map(|(factor, pose)| {
                bundle::view_squared_error(factor, intrinsics_values, distortion_values, pose)
            })
            .sum();
        let points: usize = samples.iter().map(|s| s.corners().len()).sum();
        let solver_rms = (squared / points as f64).sqrt();

        let model = RationalModel {
            intrinsics,
            resolution,
            distortions,
        };
        info!("calibrated {model:?}, solver rms {solver_rms:.4} px");

        Ok(Calibration {
            model,
            extrinsics,
            solver_rms,
        })
    }
}

fn check_physical(
    intrinsics: &Intrinsics,
    distortions: &[f64],
    extrinsics: &[Pose],
    resolution: Resolution,
) -> Result<(), EstimationError> {
    let all_finite = [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy]
        .iter()
        .chain(distortions)
        .all(|v| v.is_finite());
    if !all_finite {
        return Err(EstimationError::SolverDivergence(
            "parameters are not finite".to_string(),
        ));
    }
    validation::validate_intrinsics(intrinsics)
        .map_err(|e| EstimationError::NonPhysical(e.to_string()))?;

    let (w, h) = (resolution.width as f64, resolution.height as f64);
    if intrinsics.cx < 0.0 || intrinsics.cx >= w || intrinsics.cy < 0.0 || intrinsics.cy >= h {
        return Err(EstimationError::NonPhysical(format!(
            "principal point ({:.1}, {:.1}) outside the {resolution} image",
            intrinsics.cx, intrinsics.cy
        )));
    }
    if let Some(i) = extrinsics.iter().position(|pose| pose.translation.z <= 0.0) {
        return Err(EstimationError::NonPhysical(format!(
            "board of view {i} ends up behind the camera"
        )));
    }
    Ok(())
}
