//! Chessboard corner detection.
//!
//! [`ChessboardDetector`] looks for the board at native resolution first and,
//! failing that, on integer upscaled copies of the image up to
//! [`DetectorParams::max_scale`]. A rung only counts when the board squares
//! are large enough for the ChESS ring at that scale. The corners are refined
//! to sub-pixel accuracy on the image they were found in, with the window
//! narrowed to the grid spacing, and then mapped back to original pixel
//! coordinates.

use crate::board::BoardGeometry;
use image::imageops::{self, FilterType};
use image::GrayImage;
use log::debug;
use nalgebra::Vector2;
use std::borrow::Cow;

pub mod chess;
pub mod grid;
pub mod subpix;

pub use chess::ResponseParams;
pub use subpix::SubPixParams;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Chessboard not found at any scale up to {attempted_scales}")]
    NotFound { attempted_scales: u32 },
    #[error("Image of {width}x{height} is too small for detection")]
    InvalidImage { width: u32, height: u32 },
    #[error("Image of {width}x{height} cannot be upscaled by {scale}")]
    ScaleTooLarge { width: u32, height: u32, scale: u32 },
}

/// Detected inner corners of one view, row-major over the board grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CornerSet {
    points: Vec<Vector2<f64>>,
}

impl CornerSet {
    pub fn new(points: Vec<Vector2<f64>>) -> Self {
        CornerSet { points }
    }

    pub fn points(&self) -> &[Vector2<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Locates the inner corner grid of a chessboard in a grayscale image.
pub trait CornerDetector {
    fn detect(&self, image: &GrayImage, board: &BoardGeometry) -> Result<CornerSet, DetectionError>;
}

#[derive(Debug, Clone)]
pub struct DetectorParams {
    /// Largest integer upscale factor tried. `1` disables the retry ladder.
    pub max_scale: u32,
    /// Gaussian pre-blur applied before computing the corner response.
    pub blur_sigma: f32,
    pub response: ResponseParams,
    pub subpix: SubPixParams,
}

impl Default for DetectorParams {
    fn default() -> Self {
        DetectorParams {
            max_scale: 2,
            blur_sigma: 1.0,
            response: ResponseParams::default(),
            subpix: SubPixParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChessboardDetector {
    pub params: DetectorParams,
}

// pixel centres map as (x + 0.5) / s - 0.5 under resampling
fn to_original(point: &Vector2<f64>, scale: u32) -> Vector2<f64> {
    let s = scale as f64;
    point.map(|v| (v + 0.5) / s - 0.5)
}

impl ChessboardDetector {
    pub fn new(params: DetectorParams) -> Self {
        ChessboardDetector { params }
    }

    /// Convenience constructor keeping every default but the scale ceiling.
    pub fn with_max_scale(max_scale: u32) -> Self {
        ChessboardDetector {
            params: DetectorParams {
                max_scale,
                ..DetectorParams::default()
            },
        }
    }

    fn upscaled<'a>(&self, image: &'a GrayImage, scale: u32) -> Result<Cow<'a, GrayImage>, DetectionError> {
        let (width, height) = image.dimensions();
        let min_side = 2 * chess::RING_RADIUS + 3;
        if width < min_side || height < min_side || scale == 0 {
            return Err(DetectionError::InvalidImage { width, height });
        }
        if scale == 1 {
            return Ok(Cow::Borrowed(image));
        }
        let too_large = DetectionError::ScaleTooLarge {
            width,
            height,
            scale,
        };
        let scaled_width = width.checked_mul(scale).ok_or_else(|| too_large.clone())?;
        let scaled_height = height.checked_mul(scale).ok_or_else(|| too_large.clone())?;
        if (scaled_width as u64) * (scaled_height as u64) > u32::MAX as u64 {
            return Err(too_large);
        }
        Ok(Cow::Owned(imageops::resize(
            image,
            scaled_width,
            scaled_height,
            FilterType::Triangle,
        )))
    }

    /// Finds the ordered corner grid in `working` coordinates.
    fn locate(&self, working: &GrayImage, board: &BoardGeometry, scale: u32) -> Option<Vec<Vector2<f64>>> {
        let blurred = imageops::blur(working, self.params.blur_sigma);
        let candidates = chess::find_candidates(&blurred, &self.params.response);
        debug!("scale {scale}: {} corner candidates", candidates.len());

        let ordered = grid::assemble_grid(&candidates, board.columns(), board.rows())?;
        let spacing = subpix::corner_spacing(&ordered);
        if spacing < chess::MIN_SQUARE_PX {
            debug!("scale {scale}: squares of {spacing:.1} px are below the ring size");
            return None;
        }
        Some(ordered)
    }

    /// Runs one rung of the ladder: detects on `image` upscaled by `scale`
    /// and returns unrefined corners in original image coordinates.
    pub fn detect_at_scale(
        &self,
        image: &GrayImage,
        board: &BoardGeometry,
        scale: u32,
    ) -> Result<CornerSet, DetectionError> {
        let working = self.upscaled(image, scale)?;
        let ordered = self
            .locate(&working, board, scale)
            .ok_or(DetectionError::NotFound {
                attempted_scales: scale,
            })?;
        Ok(CornerSet::new(
            ordered.iter().map(|p| to_original(p, scale)).collect(),
        ))
    }

    /// Sub-pixel refinement of corners on `image`, with the window narrowed
    /// to the spacing of the corners.
    pub fn refine(&self, image: &GrayImage, corners: CornerSet) -> CornerSet {
        let mut points = corners.points;
        let params = self.params.subpix.for_spacing(subpix::corner_spacing(&points));
        subpix::refine_corners(image, &mut points, &params);
        CornerSet::new(points)
    }
}

impl CornerDetector for ChessboardDetector {
    fn detect(&self, image: &GrayImage, board: &BoardGeometry) -> Result<CornerSet, DetectionError> {
        let max_scale = self.params.max_scale.max(1);
        for scale in 1..=max_scale {
            let working = self.upscaled(image, scale)?;
            let Some(ordered) = self.locate(&working, board, scale) else {
                continue;
            };
            debug!("board found at scale {scale}");
            let refined = self.refine(&working, CornerSet::new(ordered));
            return Ok(CornerSet::new(
                refined.points().iter().map(|p| to_original(p, scale)).collect(),
            ));
        }
        Err(DetectionError::NotFound {
            attempted_scales: max_scale,
        })
    }
}
