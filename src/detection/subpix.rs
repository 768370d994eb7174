//! Iterative sub-pixel corner refinement.
//!
//! At the true corner `q` every image gradient `g(p)` in the neighbourhood is
//! orthogonal to `p - q`. Summing `g gᵀ (p - q) = 0` over a Gaussian-weighted
//! window gives a 2x2 linear system for `q`, solved repeatedly with the
//! window re-centred on the last estimate.
//!
//! The window must not reach the neighbouring junctions of the grid, so it is
//! narrowed for small boards with [`SubPixParams::for_spacing`].

use crate::util::sample_bilinear;
use image::GrayImage;
use nalgebra::Vector2;

#[derive(Debug, Clone)]
pub struct SubPixParams {
    /// Half window size; the search window is `2 * half_window + 1` pixels wide.
    pub half_window: usize,
    pub max_iterations: usize,
    /// Stop when an update moves the corner by less than this many pixels.
    pub epsilon: f64,
    /// A corner that ends up further than this from its start keeps the start.
    pub max_shift: f64,
}

impl Default for SubPixParams {
    fn default() -> Self {
        SubPixParams {
            half_window: 5,
            max_iterations: 30,
            epsilon: 0.01,
            max_shift: 5.0,
        }
    }
}

impl SubPixParams {
    /// Largest shift accepted, as a fraction of the corner spacing.
    pub const MAX_SHIFT_FRACTION: f64 = 0.25;

    /// Narrows the window below half of `spacing`, the distance between
    /// neighbouring corners, and bounds the accepted shift accordingly.
    pub fn for_spacing(&self, spacing: f64) -> SubPixParams {
        if !spacing.is_finite() {
            return self.clone();
        }
        let limit = ((spacing / 2.0).ceil() as usize).saturating_sub(1).max(1);
        SubPixParams {
            half_window: self.half_window.min(limit),
            max_shift: self.max_shift.min(Self::MAX_SHIFT_FRACTION * spacing),
            ..self.clone()
        }
    }
}

/// Smallest distance between any two corners; infinite for fewer than two.
pub fn corner_spacing(corners: &[Vector2<f64>]) -> f64 {
    let mut spacing = f64::INFINITY;
    for (i, a) in corners.iter().enumerate() {
        for b in &corners[i + 1..] {
            spacing = spacing.min((a - b).norm());
        }
    }
    spacing
}

fn gaussian_mask(half_window: usize) -> Vec<f64> {
    let size = 2 * half_window + 1;
    let weights: Vec<f64> = (0..size)
        .map(|i| {
            let x = (i as f64 - half_window as f64) / half_window as f64;
            (-x * x).exp()
        })
        .collect();
    let mut mask = Vec::with_capacity(size * size);
    for wy in &weights {
        for wx in &weights {
            mask.push(wy * wx);
        }
    }
    mask
}

/// Refines each corner in place.
///
/// A corner whose estimate wanders further than the half window or
/// `max_shift` from its starting point keeps its starting position.
pub fn refine_corners(image: &GrayImage, corners: &mut [Vector2<f64>], params: &SubPixParams) {
    let half = params.half_window;
    let size = 2 * half + 1;
    let patch_size = size + 2;
    let mask = gaussian_mask(half);
    let eps2 = params.epsilon * params.epsilon;
    let (width, height) = image.dimensions();
    let mut patch = vec![0.0f64; patch_size * patch_size];

    for corner in corners.iter_mut() {
        let start = *corner;
        let mut current = start;

        for _ in 0..params.max_iterations {
            // patch[i][j] holds the intensity at offset (j - half - 1, i - half - 1)
            for i in 0..patch_size {
                for j in 0..patch_size {
                    patch[i * patch_size + j] = sample_bilinear(
                        image,
                        current.x + j as f64 - half as f64 - 1.0,
                        current.y + i as f64 - half as f64 - 1.0,
                    );
                }
            }

            let (mut a, mut b, mut c, mut bb1, mut bb2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for i in 0..size {
                let py = i as f64 - half as f64;
                for j in 0..size {
                    let px = j as f64 - half as f64;
                    let m = mask[i * size + j];
                    let gx = patch[(i + 1) * patch_size + j + 2] - patch[(i + 1) * patch_size + j];
                    let gy = patch[(i + 2) * patch_size + j + 1] - patch[i * patch_size + j + 1];
                    let gxx = gx * gx * m;
                    let gxy = gx * gy * m;
                    let gyy = gy * gy * m;
                    a += gxx;
                    b += gxy;
                    c += gyy;
                    bb1 += gxx * px + gxy * py;
                    bb2 += gxy * px + gyy * py;
                }
            }

            let det = a * c - b * b;
            if det.abs() <= f64::EPSILON * f64::EPSILON {
                break;
            }
            let next = Vector2::new(
                current.x + (c * bb1 - b * bb2) / det,
                current.y + (a * bb2 - b * bb1) / det,
            );
            let step2 = (next - current).norm_squared();
            current = next;

            if current.x < 0.0
                || current.y < 0.0
                || current.x >= width as f64
                || current.y >= height as f64
                || step2 <= eps2
            {
                break;
            }
        }

        let moved = current - start;
        if moved.x.abs() > half as f64
            || moved.y.abs() > half as f64
            || moved.norm() > params.max_shift
            || !current.iter().all(|v| v.is_finite())
        {
            current = start;
        }
        *corner = current;
    }
}
