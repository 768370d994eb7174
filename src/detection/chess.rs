//! X-junction candidates from the `chess-corners` ChESS detector.
//!
//! The detector scores every pixel from 16 samples on a ring around it and
//! keeps the local maxima. Only candidates with a positive response are
//! passed on; edges and flat regions never score above zero.

use chess_corners::{find_chess_corners_image, ChessConfig};
use image::GrayImage;
use nalgebra::Vector2;

/// Radius of the ChESS sampling ring.
pub const RING_RADIUS: u32 = 5;

/// Smallest board square, in working pixels, the ring resolves reliably.
///
/// Below this the ring reaches past the four squares around a junction.
pub const MIN_SQUARE_PX: f64 = (RING_RADIUS + 2) as f64;

#[derive(Debug, Clone)]
pub struct ResponseParams {
    /// Fraction of the strongest response a candidate must reach.
    pub threshold_rel: f32,
    pub nms_radius: u32,
}

impl Default for ResponseParams {
    fn default() -> Self {
        ResponseParams {
            threshold_rel: 0.1,
            nms_radius: 3,
        }
    }
}

impl ResponseParams {
    pub fn chess_config(&self) -> ChessConfig {
        let mut cfg = ChessConfig::single_scale();
        cfg.params.threshold_rel = self.threshold_rel;
        cfg.params.nms_radius = self.nms_radius;
        cfg
    }
}

/// Corner candidates of `image`, in pixel coordinates.
pub fn find_candidates(image: &GrayImage, params: &ResponseParams) -> Vec<Vector2<f64>> {
    let (width, height) = image.dimensions();
    if width <= 2 * RING_RADIUS || height <= 2 * RING_RADIUS {
        return Vec::new();
    }
    find_chess_corners_image(image, &params.chess_config())
        .iter()
        .filter(|c| c.response > 0.0)
        .map(|c| Vector2::new(f64::from(c.x), f64::from(c.y)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checker_corner(size: u32, cx: u32, cy: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let dark = (x < cx) == (y < cy);
            Luma([if dark { 20 } else { 230 }])
        })
    }

    #[test]
    fn test_candidate_at_x_junction() {
        let img = checker_corner(40, 20, 20);
        let candidates = find_candidates(&img, &ResponseParams::default());

        assert!(!candidates.is_empty());
        // the junction lies between pixels 19 and 20
        let nearest = candidates
            .iter()
            .map(|c| (c - Vector2::new(19.5, 19.5)).norm())
            .fold(f64::INFINITY, f64::min);
        assert!(nearest < 1.0, "{candidates:?}");
    }

    #[test]
    fn test_blank_and_tiny_images_have_no_candidates() {
        let blank = GrayImage::from_pixel(64, 48, Luma([128]));
        assert!(find_candidates(&blank, &ResponseParams::default()).is_empty());

        let tiny = GrayImage::from_pixel(8, 8, Luma([0]));
        assert!(find_candidates(&tiny, &ResponseParams::default()).is_empty());
    }
}
