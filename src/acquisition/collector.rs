//! Accumulates calibration views from a frame source.

use crate::acquisition::{replay_file_name, CalibrationSample, FrameSource, SourceError};
use crate::board::BoardGeometry;
use crate::camera::Resolution;
use crate::detection::CornerDetector;
use crate::undistort::render_corner_overlay;
use crate::util::{ensure_dir, save_image};
use image::GrayImage;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from any thread to abort collection before the next frame.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(thiserror::Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Frame source ended after {accepted} of {required} views")]
    EndOfStream { accepted: usize, required: usize },
    #[error("Collection cancelled after {accepted} views")]
    Cancelled { accepted: usize },
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Number of views to accept before stopping.
    pub sample_count: usize,
    /// Accepted frames are written here as `cameraCalib_<i>.png`.
    pub persist_dir: Option<PathBuf>,
    /// Corner overlays are written here as `corners_<i>.png`.
    pub overlay_dir: Option<PathBuf>,
}

impl CollectorOptions {
    pub fn new(sample_count: usize) -> Self {
        CollectorOptions {
            sample_count,
            persist_dir: None,
            overlay_dir: None,
        }
    }
}

/// Frames rejected during collection, by reason.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SkipCounts {
    pub size_mismatch: usize,
    pub not_found: usize,
    pub unreadable: usize,
}

/// Output of a completed collection.
#[derive(Debug)]
pub struct Collection {
    pub samples: Vec<CalibrationSample>,
    /// Grayscale frame of each sample, same order as `samples`.
    pub images: Vec<GrayImage>,
    pub resolution: Resolution,
    pub skipped: SkipCounts,
}

pub struct Collector<'a> {
    board: BoardGeometry,
    detector: &'a dyn CornerDetector,
    options: CollectorOptions,
    cancel: CancelFlag,
}

impl<'a> Collector<'a> {
    pub fn new(
        board: BoardGeometry,
        detector: &'a dyn CornerDetector,
        options: CollectorOptions,
        cancel: CancelFlag,
    ) -> Self {
        Collector {
            board,
            detector,
            options,
            cancel,
        }
    }

    /// Pulls frames until `sample_count` views are accepted.
    ///
    /// The first frame examined fixes the image size; frames of another size,
    /// undecodable frames and frames without a detectable board are logged
    /// and skipped. Running out of frames first is an error, as is the cancel
    /// flag being raised.
    pub fn collect(&self, source: &mut dyn FrameSource) -> Result<Collection, CollectError> {
        let required = self.options.sample_count;
        let mut samples = Vec::with_capacity(required);
        let mut images = Vec::with_capacity(required);
        let mut resolution: Option<Resolution> = None;
        let mut skipped = SkipCounts::default();

        info!("collecting {required} views from {}", source.describe());

        while samples.len() < required {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(CollectError::Cancelled {
                    accepted: samples.len(),
                });
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(CollectError::EndOfStream {
                        accepted: samples.len(),
                        required,
                    })
                }
                Err(SourceError::Decode { path, reason }) => {
                    warn!("skipping unreadable frame {path}: {reason}");
                    skipped.unreadable += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let gray = frame.image.to_luma8();
            let size = Resolution::new(gray.width(), gray.height());
            match resolution {
                None => resolution = Some(size),
                Some(expected) if expected != size => {
                    warn!(
                        "frame {}: inconsistent image size {size}, expected {expected}; skipping",
                        frame.index
                    );
                    skipped.size_mismatch += 1;
                    continue;
                }
                Some(_) => {}
            }

            let corners = match self.detector.detect(&gray, &self.board) {
                Ok(corners) => corners,
                Err(e) => {
                    warn!("frame {}: chessboard pattern not found ({e})", frame.index);
                    skipped.not_found += 1;
                    continue;
                }
            };

            let accepted = samples.len();
            if let Some(dir) = &self.options.overlay_dir {
                let overlay = render_corner_overlay(&gray, &corners, self.board.columns());
                let path = dir.join(format!("corners_{accepted}.png"));
                if let Err(e) = ensure_dir(dir).and_then(|_| save_image(&overlay, &path)) {
                    warn!("could not write corner overlay: {e}");
                }
            }
            if let Some(dir) = &self.options.persist_dir {
                let path = dir.join(replay_file_name(accepted));
                if let Err(e) = ensure_dir(dir).and_then(|_| save_image(&gray, &path)) {
                    warn!("could not store frame for replay: {e}");
                }
            }

            let sample = match CalibrationSample::new(frame.index, corners, &self.board) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("frame {}: {e}; skipping", frame.index);
                    skipped.not_found += 1;
                    continue;
                }
            };
            samples.push(sample);
            images.push(gray);
            info!("accepted view {}/{required} (frame {})", samples.len(), frame.index);
        }

        let resolution = resolution.unwrap_or(Resolution::new(0, 0));
        Ok(Collection {
            samples,
            images,
            resolution,
            skipped,
        })
    }
}
