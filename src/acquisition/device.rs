//! Live capture through OpenCV's `videoio`, built with the `opencv` feature.

use super::{Frame, FrameSource, SourceError};
use image::{DynamicImage, GrayImage};
use log::{debug, info};
use opencv::core::{AlgorithmHint, Mat};
use opencv::prelude::*;
use opencv::{imgproc, videoio};

/// Frames grabbed from the capture device with the given index.
pub struct DeviceSource {
    index: i32,
    capture: videoio::VideoCapture,
    next: usize,
}

fn unavailable(index: i32, reason: impl std::fmt::Display) -> SourceError {
    SourceError::DeviceUnavailable(format!("capture device {index}: {reason}"))
}

impl DeviceSource {
    pub fn open(index: i32) -> Result<Self, SourceError> {
        let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)
            .map_err(|e| unavailable(index, e))?;
        if !capture.is_opened().map_err(|e| unavailable(index, e))? {
            return Err(unavailable(index, "cannot be opened"));
        }
        info!("capture device {index} opened");
        Ok(DeviceSource {
            index,
            capture,
            next: 0,
        })
    }

    fn grab_gray(&mut self) -> Result<GrayImage, SourceError> {
        let mut frame = Mat::default();
        let grabbed = self
            .capture
            .read(&mut frame)
            .map_err(|e| unavailable(self.index, e))?;
        if !grabbed || frame.empty() {
            return Err(unavailable(self.index, "no frame delivered"));
        }

        let mut gray = Mat::default();
        imgproc::cvt_color(
            &frame,
            &mut gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            AlgorithmHint::ALGO_HINT_ACCURATE,
        )
        .map_err(|e| unavailable(self.index, e))?;

        let (width, height) = (gray.cols() as u32, gray.rows() as u32);
        let data = gray
            .data_bytes()
            .map_err(|e| unavailable(self.index, e))?
            .to_vec();
        GrayImage::from_raw(width, height, data)
            .ok_or_else(|| unavailable(self.index, format!("short {width}x{height} frame buffer")))
    }
}

impl FrameSource for DeviceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let image = self.grab_gray()?;
        let index = self.next;
        self.next += 1;
        debug!("frame {index} from device {}", self.index);
        Ok(Some(Frame {
            index,
            image: DynamicImage::ImageLuma8(image),
        }))
    }

    fn describe(&self) -> String {
        format!("capture device {}", self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_unavailable() {
        assert!(matches!(
            DeviceSource::open(9999),
            Err(SourceError::DeviceUnavailable(_))
        ));
    }
}
