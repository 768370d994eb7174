//! Reprojection of board points and error scoring.
//!
//! The score of a calibration is the global RMS pixel distance between every
//! observed corner and its reprojection, pooled over all views:
//! `sqrt(Σ‖e‖² / Σ points)`. Views with more points weigh more.

use crate::acquisition::CalibrationSample;
use crate::camera::{CameraModel, CameraModelError, RationalModel};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub mod pose;

pub use pose::{rotate_axis_angle, Pose};

#[derive(thiserror::Error, Debug)]
pub enum ScoreError {
    #[error("{samples} samples but {poses} poses")]
    LengthMismatch { samples: usize, poses: usize },
    #[error("No points to score")]
    NoPoints,
    #[error("Projection failed in view {view}: {source}")]
    Projection {
        view: usize,
        #[source]
        source: CameraModelError,
    },
    #[error("Failed to export report: {0}")]
    Export(String),
}

/// Summary statistics over per-point reprojection distances, in pixels.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Statistics of a set of distances. `None` when `errors` is empty.
    pub fn from_distances(errors: &[f64]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Error summary of a single view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewError {
    pub view: usize,
    pub points: usize,
    pub rms: f64,
    pub max: f64,
}

/// Global score plus per-view breakdown of a calibration.
#[derive(Debug, Clone)]
pub struct ReprojectionReport {
    pub global_rms: f64,
    pub per_view: Vec<ViewError>,
    pub stats: ProjectionError,
}

impl ReprojectionReport {
    /// Writes one CSV row per view: `view,points,rms,max`.
    pub fn export_csv(&self, path: &Path) -> Result<(), ScoreError> {
        let mut writer =
            csv::Writer::from_path(path).map_err(|e| ScoreError::Export(e.to_string()))?;
        for row in &self.per_view {
            writer
                .serialize(row)
                .map_err(|e| ScoreError::Export(e.to_string()))?;
        }
        writer.flush().map_err(|e| ScoreError::Export(e.to_string()))?;
        Ok(())
    }
}

/// Projects a board point through a view's pose and the camera model.
///
/// No image bounds check: corners near the border may reproject just outside.
pub fn project_world_point<M: CameraModel>(
    model: &M,
    pose: &Pose,
    world: &Vector3<f64>,
) -> Result<Vector2<f64>, CameraModelError> {
    model.project(&pose.transform(world))
}

fn view_distances(
    sample: &CalibrationSample,
    pose: &Pose,
    model: &RationalModel,
) -> Result<Vec<f64>, ScoreError> {
    sample
        .world_points()
        .iter()
        .zip(sample.corners().points())
        .map(|(world, observed)| {
            project_world_point(model, pose, world)
                .map(|predicted| (predicted - observed).norm())
                .map_err(|source| ScoreError::Projection {
                    view: sample.id(),
                    source,
                })
        })
        .collect()
}

/// Global RMS reprojection error over all views and all points.
pub fn score(
    samples: &[CalibrationSample],
    extrinsics: &[Pose],
    model: &RationalModel,
) -> Result<f64, ScoreError> {
    Ok(report(samples, extrinsics, model)?.global_rms)
}

/// Full reprojection report: global RMS, per-view RMS and point statistics.
pub fn report(
    samples: &[CalibrationSample],
    extrinsics: &[Pose],
    model: &RationalModel,
) -> Result<ReprojectionReport, ScoreError> {
    if samples.len() != extrinsics.len() {
        return Err(ScoreError::LengthMismatch {
            samples: samples.len(),
            poses: extrinsics.len(),
        });
    }

    let mut all = Vec::new();
    let mut per_view = Vec::with_capacity(samples.len());
    for (sample, pose) in samples.iter().zip(extrinsics) {
        let distances = view_distances(sample, pose, model)?;
        if let Some(stats) = ProjectionError::from_distances(&distances) {
            per_view.push(ViewError {
                view: sample.id(),
                points: distances.len(),
                rms: stats.rmse,
                max: stats.max,
            });
        }
        all.extend(distances);
    }

    let stats = ProjectionError::from_distances(&all).ok_or(ScoreError::NoPoints)?;
    Ok(ReprojectionReport {
        global_rms: stats.rmse,
        per_view,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardGeometry;
    use crate::camera::{Intrinsics, Resolution};
    use crate::detection::CornerSet;
    use approx::assert_relative_eq;

    fn model() -> RationalModel {
        RationalModel {
            intrinsics: Intrinsics {
                fx: 600.0,
                fy: 600.0,
                cx: 319.5,
                cy: 239.5,
            },
            resolution: Resolution::new(640, 480),
            distortions: [-0.1, 0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        }
    }

    fn perfect_sample(id: usize, board: &BoardGeometry, pose: &Pose) -> CalibrationSample {
        let model = model();
        let corners = board
            .world_points()
            .iter()
            .map(|p| project_world_point(&model, pose, p).unwrap())
            .collect();
        CalibrationSample::new(id, CornerSet::new(corners), board).unwrap()
    }

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_distances(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert!(ProjectionError::from_distances(&[]).is_none());
    }

    #[test]
    fn test_score_is_zero_for_exact_observations() {
        let board = BoardGeometry::new(4, 3, 20.0).unwrap();
        let pose = Pose::new(Vector3::new(0.1, -0.05, 0.02), Vector3::new(-30.0, -20.0, 400.0));
        let sample = perfect_sample(0, &board, &pose);
        let rms = score(&[sample], &[pose], &model()).unwrap();
        assert!(rms < 1e-9);
    }

    #[test]
    fn test_score_is_global_rms_not_mean_of_views() {
        let model = model();
        let pose = Pose::new(Vector3::zeros(), Vector3::new(-20.0, -10.0, 400.0));

        // view 0: 12 points each off by 1 px; view 1: 4 points each off by 3 px
        let big = BoardGeometry::new(4, 3, 10.0).unwrap();
        let small = BoardGeometry::new(2, 2, 10.0).unwrap();
        let shifted = |board: &BoardGeometry, id: usize, dx: f64| {
            let corners = board
                .world_points()
                .iter()
                .map(|p| project_world_point(&model, &pose, p).unwrap() + Vector2::new(dx, 0.0))
                .collect();
            CalibrationSample::new(id, CornerSet::new(corners), board).unwrap()
        };
        let samples = [shifted(&big, 0, 1.0), shifted(&small, 1, 3.0)];

        let report = report(&samples, &[pose, pose], &model).unwrap();
        let expected = ((12.0 * 1.0 + 4.0 * 9.0) / 16.0f64).sqrt();
        assert_relative_eq!(report.global_rms, expected, epsilon = 1e-9);
        assert_relative_eq!(report.per_view[0].rms, 1.0, epsilon = 1e-9);
        assert_relative_eq!(report.per_view[1].rms, 3.0, epsilon = 1e-9);
        assert_eq!(report.per_view[1].points, 4);
    }

    #[test]
    fn test_score_rejects_mismatched_extrinsics() {
        let board = BoardGeometry::new(3, 3, 10.0).unwrap();
        let pose = Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 300.0));
        let sample = perfect_sample(0, &board, &pose);
        assert!(matches!(
            score(&[sample], &[], &model()),
            Err(ScoreError::LengthMismatch { samples: 1, poses: 0 })
        ));
    }

    #[test]
    fn test_report_csv_export() {
        let board = BoardGeometry::new(3, 3, 10.0).unwrap();
        let pose = Pose::new(Vector3::zeros(), Vector3::new(-10.0, -10.0, 300.0));
        let sample = perfect_sample(7, &board, &pose);
        let report = report(&[sample], &[pose], &model()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.csv");
        report.export_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("view,points,rms,max"));
        assert!(lines.next().unwrap().starts_with("7,9,"));
    }
}
