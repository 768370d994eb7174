//! Frame sources and calibration samples.
//!
//! A [`FrameSource`] yields images one at a time until it runs dry. The crate
//! ships sources for the replay list written by earlier runs
//! (`cameraCalib_<i>.png`), for an arbitrary image directory and for in-memory
//! images. Capture devices opened by index ([`open_device`]) need the `opencv`
//! feature.

use crate::board::{BoardError, BoardGeometry};
use crate::detection::CornerSet;
use image::{DynamicImage, GrayImage};
use log::debug;
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub mod collector;
#[cfg(feature = "opencv")]
pub mod device;

pub use collector::{CancelFlag, CollectError, Collection, Collector, CollectorOptions, SkipCounts};

/// File name under which accepted frame `index` is stored for replay.
pub fn replay_file_name(index: usize) -> String {
    format!("cameraCalib_{index}.png")
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Frame source unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// One image pulled from a source, in source order.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub image: DynamicImage,
}

pub trait FrameSource {
    /// The next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Short human readable name for log messages.
    fn describe(&self) -> String;
}

fn decode(path: &Path) -> Result<DynamicImage, SourceError> {
    image::open(path).map_err(|e| SourceError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Replays `cameraCalib_0.png .. cameraCalib_<count-1>.png` from a directory.
#[derive(Debug)]
pub struct ImageListSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageListSource {
    /// Fails with [`SourceError::DeviceUnavailable`] if any file of the list
    /// is missing.
    pub fn open(dir: &Path, count: usize) -> Result<Self, SourceError> {
        let paths: Vec<PathBuf> = (0..count).map(|i| dir.join(replay_file_name(i))).collect();
        let missing: Vec<String> = paths
            .iter()
            .filter(|p| !p.is_file())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(SourceError::DeviceUnavailable(format!(
                "missing calibration images: {}",
                missing.join(", ")
            )));
        }
        Ok(ImageListSource { paths, next: 0 })
    }
}

impl FrameSource for ImageListSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;
        debug!("reading {}", path.display());
        Ok(Some(Frame {
            index,
            image: decode(path)?,
        }))
    }

    fn describe(&self) -> String {
        format!("image list of {} files", self.paths.len())
    }
}

/// Every decodable image of a directory, in file name order.
#[derive(Debug)]
pub struct DirectorySource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    const EXTENSIONS: [&'static str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            SourceError::DeviceUnavailable(format!("cannot open {}: {e}", dir.display()))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .map(|ext| Self::EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::DeviceUnavailable(format!(
                "no images in {}",
                dir.display()
            )));
        }
        Ok(DirectorySource {
            dir: dir.to_path_buf(),
            paths,
            next: 0,
        })
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let index = self.next;
        self.next += 1;
        Ok(Some(Frame {
            index,
            image: decode(path)?,
        }))
    }

    fn describe(&self) -> String {
        format!("{} ({} images)", self.dir.display(), self.paths.len())
    }
}

/// Frames held in memory, handed out in insertion order.
#[derive(Debug, Default)]
pub struct MemorySource {
    frames: VecDeque<DynamicImage>,
    next: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        MemorySource {
            frames: frames.into(),
            next: 0,
        }
    }

    pub fn from_gray(frames: Vec<GrayImage>) -> Self {
        Self::new(frames.into_iter().map(DynamicImage::ImageLuma8).collect())
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(self.frames.pop_front().map(|image| {
            let index = self.next;
            self.next += 1;
            Frame { index, image }
        }))
    }

    fn describe(&self) -> String {
        format!("{} in-memory frames", self.frames.len())
    }
}

/// Opens the live capture device with the given index.
#[cfg(feature = "opencv")]
pub fn open_device(index: i32) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(device::DeviceSource::open(index)?))
}

/// Opens the live capture device with the given index.
#[cfg(not(feature = "opencv"))]
pub fn open_device(index: i32) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::DeviceUnavailable(format!(
        "capture device {index}: built without capture support, enable the opencv feature"
    )))
}

/// Corners of one accepted view paired with the board points they image.
///
/// Immutable once built; `world_points()[k]` is the board point seen at
/// `corners().points()[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSample {
    id: usize,
    corners: CornerSet,
    world_points: Vec<Vector3<f64>>,
}

impl CalibrationSample {
    pub fn new(id: usize, corners: CornerSet, board: &BoardGeometry) -> Result<Self, BoardError> {
        if corners.len() != board.corner_count() {
            return Err(BoardError::CornerCountMismatch {
                expected: board.corner_count(),
                found: corners.len(),
            });
        }
        Ok(CalibrationSample {
            id,
            corners,
            world_points: board.world_points(),
        })
    }

    /// Index of the source frame the sample was detected in.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn corners(&self) -> &CornerSet {
        &self.corners
    }

    pub fn world_points(&self) -> &[Vector3<f64>] {
        &self.world_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use nalgebra::Vector2;

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn test_device_needs_capture_support() {
        match open_device(0) {
            Err(SourceError::DeviceUnavailable(reason)) => assert!(reason.contains("opencv")),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("device opened without capture support"),
        }
    }

    #[test]
    fn test_sample_requires_full_grid() {
        let board = BoardGeometry::new(3, 2, 10.0).unwrap();
        let corners = CornerSet::new(vec![Vector2::new(0.0, 0.0); 5]);
        assert_eq!(
            CalibrationSample::new(0, corners, &board),
            Err(BoardError::CornerCountMismatch {
                expected: 6,
                found: 5
            })
        );

        let corners = CornerSet::new(vec![Vector2::new(1.0, 2.0); 6]);
        let sample = CalibrationSample::new(4, corners, &board).unwrap();
        assert_eq!(sample.id(), 4);
        assert_eq!(sample.world_points(), board.world_points().as_slice());
    }

    #[test]
    fn test_memory_source_yields_in_order() {
        let frames = vec![
            GrayImage::from_pixel(4, 4, Luma([1])),
            GrayImage::from_pixel(4, 4, Luma([2])),
        ];
        let mut source = MemorySource::from_gray(frames);
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!(second.image.to_luma8().get_pixel(0, 0)[0], 2);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_image_list_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::new(4, 4)
            .save(dir.path().join(replay_file_name(0)))
            .unwrap();
        assert!(matches!(
            ImageListSource::open(dir.path(), 2),
            Err(SourceError::DeviceUnavailable(msg)) if msg.contains("cameraCalib_1.png")
        ));

        let mut source = ImageListSource::open(dir.path(), 1).unwrap();
        assert_eq!(source.next_frame().unwrap().unwrap().index, 0);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_directory_source_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(2, 2, Luma([20])).save(dir.path().join("b.png")).unwrap();
        GrayImage::from_pixel(2, 2, Luma([10])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.image.to_luma8().get_pixel(0, 0)[0], 10);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectorySource::open(empty.path()),
            Err(SourceError::DeviceUnavailable(_))
        ));
    }
}
