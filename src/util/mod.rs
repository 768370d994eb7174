//! Raster helpers shared by detection, acquisition and undistortion.

use image::{EncodableLayout, GrayImage, ImageBuffer, PixelWithColorType, Rgb, RgbImage};
use nalgebra::Vector2;
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Failed to create directory {path}: {reason}")]
    CreateDir { path: String, reason: String },
    #[error("Failed to save image {path}: {reason}")]
    SaveImage { path: String, reason: String },
}

/// Ensure the output directory exists
pub fn ensure_dir(dir: &Path) -> Result<(), UtilError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| UtilError::CreateDir {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Saves an image, the format is chosen from the file extension.
pub fn save_image<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, path: &Path) -> Result<(), UtilError>
where
    P: PixelWithColorType,
    [P::Subpixel]: EncodableLayout,
{
    image.save(path).map_err(|e| UtilError::SaveImage {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Bilinear intensity lookup with border replication.
pub fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (width, height) = image.dimensions();
    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0 = x0 as u32;
    let y0 = y0 as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let at = |px: u32, py: u32| image.get_pixel(px, py)[0] as f64;
    let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
    let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Draws a filled circle, clipped to the image.
pub fn draw_circle(img: &mut RgbImage, center: &Vector2<f64>, radius: i32, color: Rgb<u8>) {
    let (width, height) = img.dimensions();
    let center_x = center.x.round() as i32;
    let center_y = center.y.round() as i32;

    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                let x = center_x + dx;
                let y = center_y + dy;

                if x >= 0 && x < width as i32 && y >= 0 && y < height as i32 {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

/// Draws a one pixel wide segment, clipped to the image.
pub fn draw_line(img: &mut RgbImage, from: &Vector2<f64>, to: &Vector2<f64>, color: Rgb<u8>) {
    let (width, height) = img.dimensions();
    let delta = to - from;
    let steps = delta.x.abs().max(delta.y.abs()).ceil().max(1.0) as usize;
    for step in 0..=steps {
        let p = from + delta * (step as f64 / steps as f64);
        let x = p.x.round() as i64;
        let y = p.y.round() as i64;
        if x >= 0 && x < width as i64 && y >= 0 && y < height as i64 {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}
