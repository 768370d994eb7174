//! Undistortion maps and visual verification output.
//!
//! The corrected image is rendered through a distortion-free camera whose
//! intrinsic matrix is chosen by [`optimal_new_camera_matrix`]. With
//! `alpha = 0` it is zoomed so every output pixel has a valid source pixel
//! (no black border); `alpha = 1` keeps every source pixel instead.
//!
//! A fitted model is only trustworthy where it was observed. Border pixels the
//! model cannot invert are replaced by the outermost invertible point on the
//! way to the principal point, so the corrected view shrinks to the usable
//! field instead of failing.

use crate::camera::{
    CameraModel, CameraModelError, Intrinsics, PinholeModel, RationalModel, Resolution,
};
use crate::detection::CornerSet;
use crate::util::{draw_circle, draw_line, ensure_dir, sample_bilinear, save_image, UtilError};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::{info, warn};
use nalgebra::Vector2;
use std::path::{Path, PathBuf};

/// Longest side of each half of a verification canvas, in pixels.
pub const CANVAS_SIDE: f64 = 600.0;

/// Samples per image side when searching the valid undistorted region.
const REGION_GRID: usize = 9;
/// Steps from a border sample towards the principal point.
const PULL_IN_STEPS: usize = 50;
/// Map entry of a target pixel with no source pixel.
const NO_SOURCE: f32 = -1.0;

#[derive(thiserror::Error, Debug)]
pub enum UndistortError {
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error("Undistorted region is empty")]
    EmptyRegion,
    #[error("Image is {found}, map expects {expected}")]
    SizeMismatch {
        expected: Resolution,
        found: Resolution,
    },
    #[error(transparent)]
    Output(#[from] UtilError),
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Undistorted normalized point of `pixel`, or of the outermost point between
/// it and the principal point the model can invert onto its regular field.
/// The flag is set when the sample had to be pulled in.
fn invertible_sample(model: &RationalModel, pixel: &Vector2<f64>) -> Option<(Vector2<f64>, bool)> {
    let center = Vector2::new(model.intrinsics.cx, model.intrinsics.cy);
    (0..PULL_IN_STEPS).find_map(|k| {
        let t = 1.0 - k as f64 / PULL_IN_STEPS as f64;
        let moved = center + (pixel - center) * t;
        let ray = model.unproject(&moved).ok()?;
        if ray.z <= f64::EPSILON {
            return None;
        }
        let normalized = Vector2::new(ray.x / ray.z, ray.y / ray.z);
        model
            .radial_is_regular(&normalized)
            .then_some((normalized, k > 0))
    })
}

/// Inner (fully valid) and outer (all pixels) rectangles of the undistorted
/// image on the normalized plane.
fn undistorted_rectangles(model: &RationalModel) -> Result<(Rect, Rect), UndistortError> {
    let w = model.resolution.width as f64;
    let h = model.resolution.height as f64;
    let step = (REGION_GRID - 1) as f64;

    let (mut inner_x0, mut inner_x1) = (f64::NEG_INFINITY, f64::INFINITY);
    let (mut inner_y0, mut inner_y1) = (f64::NEG_INFINITY, f64::INFINITY);
    let (mut outer_x0, mut outer_x1) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut outer_y0, mut outer_y1) = (f64::INFINITY, f64::NEG_INFINITY);
    let mut pulled_in = 0;

    for i in 0..REGION_GRID {
        for j in 0..REGION_GRID {
            let pixel = Vector2::new(j as f64 * (w - 1.0) / step, i as f64 * (h - 1.0) / step);
            let Some((p, pulled)) = invertible_sample(model, &pixel) else {
                continue;
            };
            if pulled {
                pulled_in += 1;
            }

            outer_x0 = outer_x0.min(p.x);
            outer_x1 = outer_x1.max(p.x);
            outer_y0 = outer_y0.min(p.y);
            outer_y1 = outer_y1.max(p.y);

            if j == 0 {
                inner_x0 = inner_x0.max(p.x);
            }
            if j == REGION_GRID - 1 {
                inner_x1 = inner_x1.min(p.x);
            }
            if i == 0 {
                inner_y0 = inner_y0.max(p.y);
            }
            if i == REGION_GRID - 1 {
                inner_y1 = inner_y1.min(p.y);
            }
        }
    }
    if pulled_in > 0 {
        warn!(
            "{pulled_in} of {} border samples lie outside the invertible field of the model",
            REGION_GRID * REGION_GRID
        );
    }

    let bounds = [
        inner_x0, inner_x1, inner_y0, inner_y1, outer_x0, outer_x1, outer_y0, outer_y1,
    ];
    if !bounds.iter().all(|v| v.is_finite()) || inner_x1 <= inner_x0 || inner_y1 <= inner_y0 {
        return Err(UndistortError::EmptyRegion);
    }
    Ok((
        Rect {
            x: inner_x0,
            y: inner_y0,
            width: inner_x1 - inner_x0,
            height: inner_y1 - inner_y0,
        },
        Rect {
            x: outer_x0,
            y: outer_y0,
            width: outer_x1 - outer_x0,
            height: outer_y1 - outer_y0,
        },
    ))
}

/// Intrinsics of the distortion-free camera an undistorted image is rendered with.
///
/// `alpha` in `[0, 1]` blends between cropping to valid pixels (0) and keeping
/// all source pixels (1).
pub fn optimal_new_camera_matrix(
    model: &RationalModel,
    alpha: f64,
    new_size: Resolution,
) -> Result<Intrinsics, UndistortError> {
    let alpha = alpha.clamp(0.0, 1.0);
    let (inner, outer) = undistorted_rectangles(model)?;
    let new_w = new_size.width as f64 - 1.0;
    let new_h = new_size.height as f64 - 1.0;

    let fit = |rect: &Rect| {
        let fx = new_w / rect.width;
        let fy = new_h / rect.height;
        (fx, fy, -fx * rect.x, -fy * rect.y)
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);

    let blend = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
    Ok(Intrinsics {
        fx: blend(fx0, fx1),
        fy: blend(fy0, fy1),
        cx: blend(cx0, cx1),
        cy: blend(cy0, cy1),
    })
}

/// Per-pixel source coordinates for undistortion.
#[derive(Debug, Clone)]
pub struct UndistortMap {
    pub resolution: Resolution,
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
}

/// For every pixel of `target`, the pixel of `source` it is sampled from.
pub fn init_undistort_map<S: CameraModel, T: CameraModel>(source: &S, target: &T) -> UndistortMap {
    let resolution = target.resolution();
    let count = resolution.width as usize * resolution.height as usize;
    let mut map_x = Vec::with_capacity(count);
    let mut map_y = Vec::with_capacity(count);

    for v in 0..resolution.height {
        for u in 0..resolution.width {
            let pixel = target
                .unproject(&Vector2::new(u as f64, v as f64))
                .and_then(|ray| source.project(&ray));
            match pixel {
                Ok(p) => {
                    map_x.push(p.x as f32);
                    map_y.push(p.y as f32);
                }
                Err(_) => {
                    map_x.push(NO_SOURCE);
                    map_y.push(NO_SOURCE);
                }
            }
        }
    }

    UndistortMap {
        resolution,
        map_x,
        map_y,
    }
}

/// Bilinear remap; pixels whose source falls outside the image are black.
pub fn remap(image: &GrayImage, map: &UndistortMap) -> GrayImage {
    let max_x = image.width() as f32 - 1.0;
    let max_y = image.height() as f32 - 1.0;
    let width = map.resolution.width;

    GrayImage::from_fn(width, map.resolution.height, |u, v| {
        let index = v as usize * width as usize + u as usize;
        let x = map.map_x[index];
        let y = map.map_y[index];
        if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
            return Luma([0]);
        }
        let value = sample_bilinear(image, x as f64, y as f64);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Original and corrected image side by side, each scaled so its longest
/// side is [`CANVAS_SIDE`] pixels.
pub fn side_by_side(original: &GrayImage, corrected: &GrayImage) -> GrayImage {
    let (w, h) = original.dimensions();
    let scale = CANVAS_SIDE / w.max(h) as f64;
    let half_w = ((w as f64 * scale).round() as u32).max(1);
    let half_h = ((h as f64 * scale).round() as u32).max(1);

    let left = imageops::resize(original, half_w, half_h, FilterType::Triangle);
    let right = imageops::resize(corrected, half_w, half_h, FilterType::Triangle);
    let mut canvas = GrayImage::new(half_w * 2, half_h);
    imageops::replace(&mut canvas, &left, 0, 0);
    imageops::replace(&mut canvas, &right, half_w as i64, 0);
    canvas
}

/// Row colours for corner overlays, cycling for boards with more rows.
const ROW_COLORS: [Rgb<u8>; 7] = [
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([200, 200, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 200, 200]),
    Rgb([0, 0, 255]),
    Rgb([255, 0, 255]),
];

/// Draws detected corners on a colour copy of `image`: one colour per board
/// row, joined in detection order.
pub fn render_corner_overlay(image: &GrayImage, corners: &CornerSet, columns: usize) -> RgbImage {
    let mut overlay = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let value = image.get_pixel(x, y)[0];
        Rgb([value, value, value])
    });

    let points = corners.points();
    let columns = columns.max(1);
    for (i, pair) in points.windows(2).enumerate() {
        let color = ROW_COLORS[((i + 1) / columns) % ROW_COLORS.len()];
        draw_line(&mut overlay, &pair[0], &pair[1], color);
    }
    for (i, point) in points.iter().enumerate() {
        let color = ROW_COLORS[(i / columns) % ROW_COLORS.len()];
        draw_circle(&mut overlay, point, 3, color);
    }
    overlay
}

/// Corrects images of a calibrated camera and writes inspection canvases.
#[derive(Debug, Clone)]
pub struct UndistortionVerifier {
    target: PinholeModel,
    map: UndistortMap,
}

impl UndistortionVerifier {
    pub fn new(model: &RationalModel, alpha: f64) -> Result<Self, UndistortError> {
        let intrinsics = optimal_new_camera_matrix(model, alpha, model.resolution)?;
        let target = PinholeModel::new(intrinsics, model.resolution)?;
        let map = init_undistort_map(model, &target);
        Ok(UndistortionVerifier { target, map })
    }

    /// The distortion-free camera corrected images are rendered with.
    pub fn target(&self) -> &PinholeModel {
        &self.target
    }

    pub fn undistort(&self, image: &GrayImage) -> Result<GrayImage, UndistortError> {
        let found = Resolution::new(image.width(), image.height());
        if found != self.map.resolution {
            return Err(UndistortError::SizeMismatch {
                expected: self.map.resolution,
                found,
            });
        }
        Ok(remap(image, &self.map))
    }

    /// Writes `undistorted_<i>.png` canvases into `output_dir`.
    pub fn write_canvases(
        &self,
        images: &[GrayImage],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, UndistortError> {
        ensure_dir(output_dir)?;
        let mut written = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let corrected = self.undistort(image)?;
            let path = output_dir.join(format!("undistorted_{i}.png"));
            save_image(&side_by_side(image, &corrected), &path)?;
            info!("applying distortion correction on image {}/{}", i + 1, images.len());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardGeometry;
    use crate::detection::{ChessboardDetector, CornerDetector};
    use crate::geometry::Pose;
    use crate::synthetic::render_board;
    use nalgebra::Vector3;

    fn model() -> RationalModel {
        RationalModel {
            intrinsics: Intrinsics {
                fx: 540.0,
                fy: 540.0,
                cx: 321.0,
                cy: 238.0,
            },
            resolution: Resolution::new(640, 480),
            distortions: [-0.25, 0.08, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        }
    }

    #[test]
    fn test_identity_for_distortion_free_camera() {
        let mut model = model();
        model.distortions = [0.0; 8];
        let k = optimal_new_camera_matrix(&model, 0.0, model.resolution).unwrap();
        assert!((k.fx - 540.0).abs() < 1e-6);
        assert!((k.cx - 321.0).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_zero_has_no_black_border() {
        let model = model();
        let verifier = UndistortionVerifier::new(&model, 0.0).unwrap();
        let map = &verifier.map;
        let (w, h) = (model.resolution.width as usize, model.resolution.height as usize);
        for &(u, v) in &[(0, 0), (w - 1, 0), (0, h - 1), (w - 1, h - 1), (w / 2, 0), (0, h / 2)] {
            let x = map.map_x[v * w + u];
            let y = map.map_y[v * w + u];
            assert!(x > -1.0 && x < w as f32, "({u}, {v}) -> {x}");
            assert!(y > -1.0 && y < h as f32, "({u}, {v}) -> {y}");
        }

        // barrel distortion widens the field of view once corrected
        assert!(verifier.target().intrinsics.fx < model.intrinsics.fx);
        let wide = optimal_new_camera_matrix(&model, 1.0, model.resolution).unwrap();
        assert!(wide.fx < verifier.target().intrinsics.fx);
    }

    #[test]
    fn test_undistorted_corners_follow_pinhole_projection() {
        let model = model();
        let board = BoardGeometry::new(9, 6, 23.0).unwrap();
        let pose = Pose::new(Vector3::new(0.2, -0.1, 0.05), Vector3::new(-92.0, -57.5, 480.0));
        let image = render_board(&model, &board, &pose);

        let verifier = UndistortionVerifier::new(&model, 0.0).unwrap();
        let corrected = verifier.undistort(&image).unwrap();
        let corners = ChessboardDetector::default().detect(&corrected, &board).unwrap();

        let target = verifier.target();
        let expected: Vec<Vector2<f64>> = board
            .world_points()
            .iter()
            .map(|p| {
                let c = pose.transform(p);
                target.normalized_to_pixel(&Vector2::new(c.x / c.z, c.y / c.z))
            })
            .collect();
        for observed in corners.points() {
            let nearest = expected
                .iter()
                .map(|e| (e - observed).norm())
                .fold(f64::INFINITY, f64::min);
            assert!(nearest < 0.5, "corner {observed:?} is {nearest} px off");
        }
    }

    #[test]
    fn test_model_with_pole_inside_the_frame_still_verifies() {
        // k3 and k6 nearly cancel in the observed field; the radial
        // denominator vanishes near the image corners
        let model = RationalModel {
            intrinsics: Intrinsics {
                fx: 560.0,
                fy: 555.0,
                cx: 322.5,
                cy: 241.0,
            },
            resolution: Resolution::new(640, 480),
            distortions: [-0.209, -0.143, 0.0, 0.0, -10.65, 0.0, 0.0, -11.92],
        };
        let corner = model.undistort_pixel(&Vector2::new(0.0, 0.0));
        assert!(corner.map_or(true, |p| !model.radial_is_regular(&p)));

        for alpha in [0.0, 1.0] {
            let verifier = UndistortionVerifier::new(&model, alpha).unwrap();
            let k = verifier.target().intrinsics;
            assert!(k.fx.is_finite() && k.fx > 0.0, "{k:?}");
            assert!(k.fy.is_finite() && k.fy > 0.0, "{k:?}");

            // the optical axis stays on the optical axis
            let centre = verifier
                .target()
                .project(&Vector3::new(0.0, 0.0, 1.0))
                .unwrap();
            let (u, v) = (centre.x.round() as usize, centre.y.round() as usize);
            let w = model.resolution.width as usize;
            assert!(u < w && v < model.resolution.height as usize, "{centre:?}");
            let source = Vector2::new(
                verifier.map.map_x[v * w + u] as f64,
                verifier.map.map_y[v * w + u] as f64,
            );
            assert!((source - Vector2::new(322.5, 241.0)).norm() < 2.0, "{source:?}");
        }

        let dir = tempfile::tempdir().unwrap();
        let verifier = UndistortionVerifier::new(&model, 0.0).unwrap();
        let image = GrayImage::from_pixel(640, 480, Luma([100]));
        let written = verifier.write_canvases(&[image], dir.path()).unwrap();
        assert!(written[0].is_file());
    }

    #[test]
    fn test_canvas_layout_and_output() {
        let model = model();
        let verifier = UndistortionVerifier::new(&model, 0.0).unwrap();
        let image = GrayImage::from_pixel(640, 480, Luma([100]));
        let canvas = side_by_side(&image, &verifier.undistort(&image).unwrap());
        assert_eq!(canvas.dimensions(), (1200, 450));

        let dir = tempfile::tempdir().unwrap();
        let written = verifier.write_canvases(&[image], dir.path()).unwrap();
        assert_eq!(written, vec![dir.path().join("undistorted_0.png")]);
        assert!(written[0].is_file());

        let wrong = GrayImage::new(320, 240);
        assert!(matches!(
            verifier.undistort(&wrong),
            Err(UndistortError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_corner_overlay_colours_rows() {
        let image = GrayImage::from_pixel(50, 50, Luma([0]));
        let corners = CornerSet::new(vec![
            Vector2::new(10.0, 10.0),
            Vector2::new(20.0, 10.0),
            Vector2::new(10.0, 30.0),
            Vector2::new(20.0, 30.0),
        ]);
        let overlay = render_corner_overlay(&image, &corners, 2);
        assert_eq!(*overlay.get_pixel(10, 10), ROW_COLORS[0]);
        assert_eq!(*overlay.get_pixel(20, 30), ROW_COLORS[1]);
    }
}
