//! Durable calibration record.
//!
//! The record is a YAML document with the keys `M` (3×3 intrinsic matrix),
//! `D` (distortion coefficients), `R`/`T` (per-view rotation and translation
//! vectors) and the image size. Matrices are stored as `rows`/`cols`/`dt`/
//! `data` mappings, the layout OpenCV's FileStorage uses, so records written
//! by OpenCV (`%YAML:1.0` header, `!!opencv-matrix` tags) load as well.

use crate::camera::rational::NUM_DISTORTION;
use crate::camera::{CameraModelError, RationalModel, Resolution};
use crate::geometry::Pose;
use log::info;
use nalgebra::Matrix3;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Calibration record {0} does not exist")]
    NotFound(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(String),
    #[error("Calibration record has no key {0}")]
    MissingKey(String),
    #[error("Malformed calibration record: {0}")]
    Malformed(String),
}

impl From<CameraModelError> for StoreError {
    fn from(err: CameraModelError) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Matrix node in FileStorage layout.
#[derive(Debug, Serialize)]
struct MatrixNode {
    rows: usize,
    cols: usize,
    dt: &'static str,
    data: Vec<f64>,
}

impl MatrixNode {
    fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        MatrixNode {
            rows,
            cols,
            dt: "d",
            data,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordFile {
    image_width: u32,
    image_height: u32,
    #[serde(rename = "M")]
    camera_matrix: MatrixNode,
    #[serde(rename = "D")]
    distortion: MatrixNode,
    #[serde(rename = "R")]
    rotations: Vec<MatrixNode>,
    #[serde(rename = "T")]
    translations: Vec<MatrixNode>,
}

/// Reads and writes the calibration record at a fixed path.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CalibrationStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the model and, for inspection, the per-view extrinsics.
    pub fn save(&self, model: &RationalModel, extrinsics: &[Pose]) -> Result<(), StoreError> {
        let k = model.camera_matrix();
        let record = RecordFile {
            image_width: model.resolution.width,
            image_height: model.resolution.height,
            camera_matrix: MatrixNode::new(3, 3, k.transpose().iter().copied().collect()),
            distortion: MatrixNode::new(1, NUM_DISTORTION, model.distortions.to_vec()),
            rotations: extrinsics
                .iter()
                .map(|pose| MatrixNode::new(3, 1, pose.rotation.iter().copied().collect()))
                .collect(),
            translations: extrinsics
                .iter()
                .map(|pose| MatrixNode::new(3, 1, pose.translation.iter().copied().collect()))
                .collect(),
        };

        let yaml = serde_yaml::to_string(&record).map_err(|e| StoreError::Yaml(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        fs::write(&self.path, yaml).map_err(|source| self.io_error(source))?;
        info!("calibration record saved to {}", self.path.display());
        Ok(())
    }

    /// Loads the camera model. A record without an image size yields a
    /// model with a 0×0 resolution.
    pub fn load(&self) -> Result<RationalModel, StoreError> {
        if !self.path.is_file() {
            return Err(StoreError::NotFound(self.path.display().to_string()));
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        parse_record(&contents)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Parses a record from YAML text.
pub fn parse_record(contents: &str) -> Result<RationalModel, StoreError> {
    // FileStorage writes `%YAML:1.0`, which is not a valid YAML directive
    let body = match contents.strip_prefix("%YAML") {
        Some(rest) => rest.split_once('\n').map_or("", |(_, tail)| tail),
        None => contents,
    };
    let docs = YamlLoader::load_from_str(body).map_err(|e| StoreError::Yaml(e.to_string()))?;
    let doc = docs
        .first()
        .ok_or_else(|| StoreError::Malformed("empty YAML document".to_string()))?;

    let m = matrix_values(doc, "M")?;
    if m.len() != 9 {
        return Err(StoreError::Malformed(format!(
            "M has {} entries, expected 9",
            m.len()
        )));
    }
    let k = Matrix3::from_row_slice(&m);

    let d = matrix_values(doc, "D")?;

    let resolution = Resolution::new(
        size_value(doc, "image_width")?,
        size_value(doc, "image_height")?,
    );
    Ok(RationalModel::from_matrix(&k, &d, resolution)?)
}

fn number(node: &Yaml) -> Option<f64> {
    node.as_f64().or_else(|| node.as_i64().map(|v| v as f64))
}

/// Values of a matrix node: either a `data` mapping or a plain list.
fn matrix_values(doc: &Yaml, key: &str) -> Result<Vec<f64>, StoreError> {
    let node = &doc[key];
    if node.is_badvalue() {
        return Err(StoreError::MissingKey(key.to_string()));
    }
    let list = match node {
        Yaml::Array(items) => items,
        Yaml::Hash(_) => node["data"]
            .as_vec()
            .ok_or_else(|| StoreError::Malformed(format!("{key} has no data list")))?,
        _ => return Err(StoreError::Malformed(format!("{key} is not a matrix"))),
    };
    list.iter()
        .map(|v| number(v).ok_or_else(|| StoreError::Malformed(format!("{key} has a non-numeric entry"))))
        .collect()
}

fn size_value(doc: &Yaml, key: &str) -> Result<u32, StoreError> {
    match &doc[key] {
        Yaml::BadValue => Ok(0),
        node => node
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| StoreError::Malformed(format!("{key} is not an image dimension"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use nalgebra::Vector3;

    fn model() -> RationalModel {
        RationalModel {
            intrinsics: Intrinsics {
                fx: 812.3456789012345,
                fy: 809.87654321,
                cx: 639.123,
                cy: 358.9,
            },
            resolution: Resolution::new(1280, 720),
            distortions: [-0.31, 0.12, 0.0, 0.0, -0.0213, 0.0, 0.0, 0.004],
        }
    }

    #[test]
    fn test_save_then_load_reproduces_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("nested/calib_param.yml"));
        let extrinsics = vec![
            Pose::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(-10.0, 5.0, 400.0)),
            Pose::new(Vector3::new(-0.1, 0.0, 0.05), Vector3::new(3.0, -4.0, 380.0)),
        ];
        store.save(&model(), &extrinsics).unwrap();

        let loaded = CalibrationStore::new(store.path()).load().unwrap();
        assert_eq!(loaded, model());

        let text = fs::read_to_string(store.path()).unwrap();
        for key in ["M:", "D:", "R:", "T:"] {
            assert!(text.contains(key), "missing {key}");
        }
    }

    #[test]
    fn test_load_opencv_file_storage() {
        let text = "%YAML:1.0
---
M: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 5.2e+02, 0., 3.195e+02, 0., 5.25e+02, 2.395e+02, 0., 0., 1. ]
D: !!opencv-matrix
   rows: 1
   cols: 5
   dt: d
   data: [ -2.5e-01, 8.0e-02, 0., 0., 1 ]
";
        let loaded = parse_record(text).unwrap();
        assert_eq!(loaded.intrinsics.fx, 520.0);
        assert_eq!(loaded.intrinsics.cy, 239.5);
        assert_eq!(loaded.distortions, [-0.25, 0.08, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(loaded.resolution, Resolution::new(0, 0));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CalibrationStore::new(dir.path().join("absent.yml"));
        assert!(matches!(missing.load(), Err(StoreError::NotFound(_))));

        assert!(matches!(
            parse_record("D: [0.1, 0.2]\n"),
            Err(StoreError::MissingKey(key)) if key == "M"
        ));
        assert!(matches!(
            parse_record("M: [1, 2, 3]\nD: []\n"),
            Err(StoreError::Malformed(_))
        ));
        assert!(matches!(
            parse_record("M: [0, 0, 320, 0, 500, 240, 0, 0, 1]\nD: []\n"),
            Err(StoreError::Malformed(_))
        ));
    }
}
