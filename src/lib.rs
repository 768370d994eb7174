//! Chessboard Camera Calibration Library
//!
//! Estimates the intrinsic matrix and rational lens distortion of a single
//! camera from views of a planar chessboard:
//! - Chessboard corner detection with a scale ladder and sub-pixel refinement
//! - Collection of a fixed number of views from live or replayed frames
//! - Closed-form initialization followed by a joint Levenberg-Marquardt
//!   refinement with the tiny-solver optimization framework
//! - Reprojection scoring, undistortion previews and a persisted YAML record
//!   (`M`, `D`, `R`, `T`) readable by downstream consumers

pub mod acquisition;
pub mod board;
pub mod camera;
pub mod config;
pub mod detection;
pub mod geometry;
pub mod optimization;
pub mod pipeline;
pub mod store;
pub mod synthetic;
pub mod undistort;
pub mod util;

// Re-export commonly used types
pub use acquisition::{CalibrationSample, CancelFlag, Collector, FrameSource};
pub use board::BoardGeometry;
pub use camera::{CameraModel, CameraModelError, Intrinsics, PinholeModel, RationalModel, Resolution};
pub use config::CalibrationConfig;
pub use detection::{ChessboardDetector, CornerDetector, CornerSet};
pub use geometry::Pose;
pub use optimization::{Calibration, IntrinsicEstimator};
pub use pipeline::{run_calibration, CalibrationError, CalibrationOutcome};
pub use store::CalibrationStore;
pub use undistort::UndistortionVerifier;
