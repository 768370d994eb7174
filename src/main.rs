//! Chessboard camera calibration tool
//!
//! Collects chessboard views, estimates the camera model and writes the
//! calibration record (`calib_param.yml` by default).
//!
//! Usage:
//! ```bash
//! # replay cameraCalib_0.png .. cameraCalib_24.png from the current directory
//! chessboard-calib
//!
//! # fresh acquisition from a directory of captured frames, 7x5 board
//! chessboard-calib --use-existing-images false --capture-dir frames \
//!   --board-columns 7 --board-rows 5 --square-size 30
//!
//! # self-contained run on rendered views
//! chessboard-calib --synthetic
//!
//! # live capture from device 0 (build with `--features opencv`)
//! chessboard-calib --device 0
//! ```
//!
//! Type `q` followed by enter to cancel while views are being collected.

use chessboard_calib::acquisition::{
    open_device, DirectorySource, FrameSource, ImageListSource, MemorySource,
};
use chessboard_calib::config::{CalibrationConfig, ConfigError};
use chessboard_calib::synthetic::{reference_camera, render_views};
use chessboard_calib::{run_calibration, CalibrationError, CancelFlag};
use clap::Parser;
use log::{error, info};
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-camera chessboard calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML file with calibration options; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inner corners per board row
    #[arg(long)]
    board_columns: Option<usize>,

    /// Inner corners per board column
    #[arg(long)]
    board_rows: Option<usize>,

    /// Edge length of one board square
    #[arg(long)]
    square_size: Option<f64>,

    /// Number of views to collect
    #[arg(short = 'n', long)]
    sample_count: Option<usize>,

    /// Highest detection upscale factor
    #[arg(long)]
    max_scale: Option<u32>,

    /// Write corner overlays for accepted views (true/false)
    #[arg(long)]
    display_corners: Option<bool>,

    /// Replay stored cameraCalib_<i>.png frames (true/false)
    #[arg(long)]
    use_existing_images: Option<bool>,

    /// Directory of replayed (or newly stored) frames
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Directory frames are acquired from when not replaying
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Calibration record to write
    #[arg(short, long)]
    record_path: Option<PathBuf>,

    /// Directory for overlays, undistortion canvases and the error report
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Solver iteration limit
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Free scaling of the undistorted previews in [0, 1]
    #[arg(long)]
    alpha: Option<f64>,

    /// Capture from the live device with this index (needs the opencv feature)
    #[arg(short, long, conflicts_with = "synthetic")]
    device: Option<i32>,

    /// Calibrate on views rendered through a built-in reference camera
    #[arg(long, default_value_t = false)]
    synthetic: bool,
}

/// Where frames come from, before the configured file sources.
#[derive(Debug, Clone, Copy)]
enum Input {
    Configured,
    Device(i32),
    Synthetic,
}

impl Cli {
    fn into_config(self) -> Result<(CalibrationConfig, Input), CalibrationError> {
        let mut config = match &self.config {
            Some(path) => CalibrationConfig::from_yaml_file(path)?,
            None => CalibrationConfig::default(),
        };

        if let Some(v) = self.board_columns {
            config.board_columns = v;
        }
        if let Some(v) = self.board_rows {
            config.board_rows = v;
        }
        if let Some(v) = self.square_size {
            config.square_size = v;
        }
        if let Some(v) = self.sample_count {
            config.sample_count = v;
        }
        if let Some(v) = self.max_scale {
            config.max_scale = v;
        }
        if let Some(v) = self.display_corners {
            config.display_corners = v;
        }
        if let Some(v) = self.use_existing_images {
            config.use_existing_images = v;
        }
        if let Some(v) = self.image_dir {
            config.image_dir = v;
        }
        if let Some(v) = self.capture_dir {
            config.capture_dir = v;
        }
        if let Some(v) = self.record_path {
            config.record_path = v;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        if let Some(v) = self.max_iterations {
            config.max_iterations = v;
        }
        if let Some(v) = self.alpha {
            config.undistort_alpha = v;
        }
        config.validate()?;
        let input = match (self.device, self.synthetic) {
            (_, true) => Input::Synthetic,
            (Some(index), false) => Input::Device(index),
            (None, false) => Input::Configured,
        };
        Ok((config, input))
    }
}

fn open_source(
    config: &CalibrationConfig,
    input: Input,
) -> Result<Box<dyn FrameSource>, CalibrationError> {
    match input {
        Input::Synthetic => {
            let board = config.board().map_err(ConfigError::from)?;
            let camera = reference_camera();
            info!("rendering {} synthetic views through {camera:?}", config.sample_count);
            let (images, _) = render_views(&camera, &board, config.sample_count);
            return Ok(Box::new(MemorySource::from_gray(images)));
        }
        Input::Device(index) => return Ok(open_device(index)?),
        Input::Configured => {}
    }
    if config.use_existing_images {
        Ok(Box::new(ImageListSource::open(
            &config.image_dir,
            config.sample_count,
        )?))
    } else {
        Ok(Box::new(DirectorySource::open(&config.capture_dir)?))
    }
}

/// Raises `cancel` when the operator types `q`.
fn watch_stdin(cancel: CancelFlag) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    cancel.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn run(cli: Cli) -> Result<(), CalibrationError> {
    let (mut config, input) = cli.into_config()?;
    if let Input::Device(_) = input {
        // live frames are kept for later replays
        config.use_existing_images = false;
    }
    let mut source = open_source(&config, input)?;

    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    watch_stdin(cancel.clone());

    let outcome = run_calibration(&config, source.as_mut(), cancel)?;
    info!(
        "calibrated {} from {} views, reprojection error {:.4} px",
        outcome.resolution,
        outcome.calibration.extrinsics.len(),
        outcome.reprojection_error()
    );
    if !outcome.saved {
        error!(
            "calibration record {} was not written",
            config.record_path.display()
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CalibrationError::Cancelled { accepted }) => {
            info!("cancelled after {accepted} views, nothing was saved");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
