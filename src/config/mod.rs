//! Run configuration.

use crate::board::{BoardError, BoardGeometry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error("Invalid option {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

/// Every option of a calibration run. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Inner corners per board row.
    pub board_columns: usize,
    /// Inner corners per board column.
    pub board_rows: usize,
    /// Edge length of one square, in the unit the extrinsics are reported in.
    pub square_size: f64,
    pub sample_count: usize,
    /// Highest upscale factor the detector tries.
    pub max_scale: u32,
    /// Write a corner overlay for every accepted view.
    pub display_corners: bool,
    /// Replay `cameraCalib_<i>.png` from `image_dir` instead of acquiring.
    pub use_existing_images: bool,
    pub image_dir: PathBuf,
    /// Frames are acquired from here when not replaying.
    pub capture_dir: PathBuf,
    pub record_path: PathBuf,
    pub output_dir: PathBuf,
    pub max_iterations: usize,
    /// Free scaling of the undistorted view, 0 crops to valid pixels.
    pub undistort_alpha: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            board_columns: 9,
            board_rows: 6,
            square_size: 23.0,
            sample_count: 25,
            max_scale: 2,
            display_corners: true,
            use_existing_images: true,
            image_dir: PathBuf::from("."),
            capture_dir: PathBuf::from("capture"),
            record_path: PathBuf::from("calib_param.yml"),
            output_dir: PathBuf::from("output"),
            max_iterations: 100,
            undistort_alpha: 0.0,
        }
    }
}

impl CalibrationConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn board(&self) -> Result<BoardGeometry, BoardError> {
        BoardGeometry::new(self.board_columns, self.board_rows, self.square_size)
    }

    /// Highest upscale factor the detection ladder may be configured with.
    pub const MAX_SCALE_LIMIT: u32 = 8;

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.board()?;
        if self.sample_count == 0 {
            return Err(ConfigError::Invalid {
                option: "sample_count",
                reason: "at least one view is required".to_string(),
            });
        }
        if !(1..=Self::MAX_SCALE_LIMIT).contains(&self.max_scale) {
            return Err(ConfigError::Invalid {
                option: "max_scale",
                reason: format!(
                    "{} is outside [1, {}]",
                    self.max_scale,
                    Self::MAX_SCALE_LIMIT
                ),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                option: "max_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.undistort_alpha) {
            return Err(ConfigError::Invalid {
                option: "undistort_alpha",
                reason: format!("{} is outside [0, 1]", self.undistort_alpha),
            });
        }
        Ok(())
    }
}
