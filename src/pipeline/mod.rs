//! One calibration run, from frame source to persisted record.
//!
//! Per-frame problems are absorbed by the collector. Everything that reaches
//! this level is either fatal to the run ([`CalibrationError`]) or, for
//! output files, logged and ignored so the in-memory model stays usable.

use crate::acquisition::{
    CancelFlag, CollectError, Collection, Collector, CollectorOptions, FrameSource, SkipCounts,
    SourceError,
};
use crate::camera::Resolution;
use crate::config::{CalibrationConfig, ConfigError};
use crate::detection::{ChessboardDetector, CornerDetector};
use crate::geometry::{self, ReprojectionReport, ScoreError};
use crate::optimization::{Calibration, DistortionFlags, EstimationError, IntrinsicEstimator};
use crate::store::{CalibrationStore, StoreError};
use crate::undistort::{UndistortError, UndistortionVerifier};
use crate::util::ensure_dir;
use log::{debug, info, warn};

/// File the per-view reprojection statistics are exported to, in `output_dir`.
pub const REPORT_FILE: &str = "reprojection_errors.csv";

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Frame source unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Calibration failed: {0}")]
    SolverDivergence(String),
    #[error("Calibration record unavailable: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("Cancelled by operator after {accepted} views")]
    Cancelled { accepted: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<CollectError> for CalibrationError {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::Source(SourceError::DeviceUnavailable(reason)) => {
                CalibrationError::DeviceUnavailable(reason)
            }
            CollectError::Source(e) => CalibrationError::DeviceUnavailable(e.to_string()),
            e @ CollectError::EndOfStream { .. } => CalibrationError::DeviceUnavailable(e.to_string()),
            CollectError::Cancelled { accepted } => CalibrationError::Cancelled { accepted },
        }
    }
}

impl From<SourceError> for CalibrationError {
    fn from(err: SourceError) -> Self {
        CollectError::Source(err).into()
    }
}

impl From<EstimationError> for CalibrationError {
    fn from(err: EstimationError) -> Self {
        CalibrationError::SolverDivergence(err.to_string())
    }
}

impl From<ScoreError> for CalibrationError {
    fn from(err: ScoreError) -> Self {
        CalibrationError::SolverDivergence(err.to_string())
    }
}

/// Everything a finished run produced.
///
/// Frames with a diverging size or without a detectable board are not
/// errors at this level; they show up in `skipped`.
#[derive(Debug)]
pub struct CalibrationOutcome {
    pub calibration: Calibration,
    pub report: ReprojectionReport,
    pub resolution: Resolution,
    pub skipped: SkipCounts,
    /// Whether the record was written to `record_path`.
    pub saved: bool,
}

impl CalibrationOutcome {
    pub fn reprojection_error(&self) -> f64 {
        self.report.global_rms
    }
}

/// Runs a full calibration with the chessboard detector configured by `config`.
pub fn run_calibration(
    config: &CalibrationConfig,
    source: &mut dyn FrameSource,
    cancel: CancelFlag,
) -> Result<CalibrationOutcome, CalibrationError> {
    let detector = ChessboardDetector::with_max_scale(config.max_scale);
    run_with_detector(config, source, &detector, cancel)
}

/// [`run_calibration`] with a caller-provided corner detector.
pub fn run_with_detector(
    config: &CalibrationConfig,
    source: &mut dyn FrameSource,
    detector: &dyn CornerDetector,
    cancel: CancelFlag,
) -> Result<CalibrationOutcome, CalibrationError> {
    config.validate()?;
    let board = config.board().map_err(ConfigError::from)?;

    let options = CollectorOptions {
        sample_count: config.sample_count,
        persist_dir: (!config.use_existing_images).then(|| config.image_dir.clone()),
        overlay_dir: config.display_corners.then(|| config.output_dir.clone()),
    };
    let Collection {
        samples,
        images,
        resolution,
        skipped,
    } = Collector::new(board, detector, options, cancel).collect(source)?;
    debug!("skipped frames: {skipped:?}");

    info!("running calibration ...");
    let estimator = IntrinsicEstimator::new(DistortionFlags::default(), config.max_iterations);
    let calibration = estimator.estimate(&samples, resolution)?;
    info!("estimated {:?}", calibration.model);

    let report = geometry::report(&samples, &calibration.extrinsics, &calibration.model)?;
    info!("reprojection error = {:.6}", report.global_rms);
    info!("{:?}", report.stats);
    for view in &report.per_view {
        debug!(
            "view {}: rms {:.4} px, max {:.4} px over {} points",
            view.view, view.rms, view.max, view.points
        );
    }
    export_report(config, &report);

    info!("applying distortion correction");
    if let Err(e) = write_undistorted(config, &calibration, &images) {
        warn!("distortion correction failed: {e}");
    }

    let store = CalibrationStore::new(&config.record_path);
    let saved = match store.save(&calibration.model, &calibration.extrinsics) {
        Ok(()) => {
            info!("camera calibration params saved.");
            true
        }
        Err(e) => {
            warn!("failed to save calibration params: {e}");
            false
        }
    };

    Ok(CalibrationOutcome {
        calibration,
        report,
        resolution,
        skipped,
        saved,
    })
}

fn export_report(config: &CalibrationConfig, report: &ReprojectionReport) {
    let path = config.output_dir.join(REPORT_FILE);
    let result = ensure_dir(&config.output_dir)
        .map_err(|e| ScoreError::Export(e.to_string()))
        .and_then(|_| report.export_csv(&path));
    match result {
        Ok(()) => debug!("per-view errors written to {}", path.display()),
        Err(e) => warn!("could not export reprojection report: {e}"),
    }
}

fn write_undistorted(
    config: &CalibrationConfig,
    calibration: &Calibration,
    images: &[image::GrayImage],
) -> Result<(), UndistortError> {
    let verifier = UndistortionVerifier::new(&calibration.model, config.undistort_alpha)?;
    verifier.write_canvases(images, &config.output_dir)?;
    Ok(())
}
