use approx::assert_relative_eq;
use chessboard_calib::acquisition::{
    CalibrationSample, CollectError, Collector, CollectorOptions, MemorySource,
};
use chessboard_calib::board::BoardGeometry;
use chessboard_calib::config::CalibrationConfig;
use chessboard_calib::detection::{ChessboardDetector, CornerDetector, DetectionError};
use chessboard_calib::optimization::IntrinsicEstimator;
use chessboard_calib::store::CalibrationStore;
use chessboard_calib::geometry::{project_world_point, Pose};
use chessboard_calib::synthetic::{reference_camera, render_board, render_views};
use chessboard_calib::{
    geometry, run_calibration, CalibrationError, CancelFlag, RationalModel, Resolution,
};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use nalgebra::{Vector2, Vector3};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn board() -> BoardGeometry {
    BoardGeometry::new(9, 6, 23.0).unwrap()
}

fn cancel() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// Pixel distance from the principal point, along x, of a ray at normalized
/// radius `r`.
fn radial_pixels(model: &RationalModel, r: f64) -> f64 {
    let d = &model.distortions;
    let r2 = r * r;
    let num = 1.0 + r2 * (d[0] + r2 * (d[1] + r2 * d[4]));
    let den = 1.0 + r2 * (d[5] + r2 * (d[6] + r2 * d[7]));
    model.intrinsics.fx * r * num / den
}

#[test]
fn test_end_to_end_synthetic_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let camera = reference_camera();
    let (images, _) = render_views(&camera, &board(), 25);

    let config = CalibrationConfig {
        record_path: dir.path().join("calib_param.yml"),
        output_dir: dir.path().join("output"),
        ..CalibrationConfig::default()
    };
    let mut source = MemorySource::from_gray(images);
    let outcome = run_calibration(&config, &mut source, cancel()).unwrap();

    assert_eq!(outcome.calibration.extrinsics.len(), 25);
    assert_eq!(outcome.resolution, Resolution::new(640, 480));
    assert_eq!(outcome.skipped.not_found, 0);
    assert!(outcome.reprojection_error() < 1.0);
    assert!(outcome.saved);

    let model = &outcome.calibration.model;
    assert_relative_eq!(model.intrinsics.fx, camera.intrinsics.fx, max_relative = 0.01);
    assert_relative_eq!(model.intrinsics.fy, camera.intrinsics.fy, max_relative = 0.01);

    let loaded = CalibrationStore::new(&config.record_path).load().unwrap();
    assert_eq!(&loaded, model);

    assert!(config.output_dir.join("corners_0.png").is_file());
    assert!(config.output_dir.join("undistorted_24.png").is_file());
}

#[test]
fn test_estimator_recovers_rendered_camera() {
    let camera = reference_camera();
    let board = board();
    let (images, _) = render_views(&camera, &board, 12);
    let detector = ChessboardDetector::default();

    let samples: Vec<CalibrationSample> = images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            let corners = detector.detect(image, &board).unwrap();
            CalibrationSample::new(i, corners, &board).unwrap()
        })
        .collect();

    let calibration = IntrinsicEstimator::default()
        .estimate(&samples, camera.resolution)
        .unwrap();
    let model = &calibration.model;
    assert_relative_eq!(model.intrinsics.fx, camera.intrinsics.fx, max_relative = 5e-3);
    assert_relative_eq!(model.intrinsics.fy, camera.intrinsics.fy, max_relative = 5e-3);
    assert!((model.intrinsics.cx - camera.intrinsics.cx).abs() < 2.0);
    assert!((model.intrinsics.cy - camera.intrinsics.cy).abs() < 2.0);

    let r_max = samples
        .iter()
        .flat_map(|s| s.corners().points())
        .map(|p| camera.undistort_pixel(p).unwrap().norm())
        .fold(0.0, f64::max);
    for step in 0..=40 {
        let r = r_max * step as f64 / 40.0;
        let error = (radial_pixels(model, r) - radial_pixels(&camera, r)).abs();
        assert!(error < 1.5, "radial error {error} px at r = {r}");
    }

    let rms = geometry::score(&samples, &calibration.extrinsics, model).unwrap();
    assert!(rms < 0.5, "rms {rms}");
}

#[test]
fn test_blank_frame_is_not_found_and_not_counted() {
    let board = board();
    let detector = ChessboardDetector::default();
    let blank = GrayImage::from_pixel(640, 480, Luma([128]));
    assert!(matches!(
        detector.detect(&blank, &board),
        Err(DetectionError::NotFound { attempted_scales: 2 })
    ));

    let (mut frames, _) = render_views(&reference_camera(), &board, 1);
    frames.insert(0, blank);
    let mut source = MemorySource::from_gray(frames);
    let collector = Collector::new(board, &detector, CollectorOptions::new(2), cancel());
    assert!(matches!(
        collector.collect(&mut source),
        Err(CollectError::EndOfStream {
            accepted: 1,
            required: 2
        })
    ));
}

#[test]
fn test_detection_agrees_on_upscaled_duplicate() {
    let board = board();
    let (images, _) = render_views(&reference_camera(), &board, 3);
    let image = &images[1];
    let detector = ChessboardDetector::default();

    let native = detector.detect(image, &board).unwrap();
    let upscaled = imageops::resize(image, image.width() * 2, image.height() * 2, FilterType::Triangle);
    let doubled = detector.detect(&upscaled, &board).unwrap();

    for (a, b) in native.points().iter().zip(doubled.points()) {
        let back = b.add_scalar(0.5) / 2.0 - Vector2::repeat(0.5);
        assert!((a - back).norm() < 0.3, "{a:?} vs {back:?}");
    }
}

#[test]
fn test_small_board_is_found_by_upscaling() {
    let camera = reference_camera();
    let board = board();
    let rotation = Vector3::new(0.1, -0.1, 0.05);
    let center = Vector3::new(4.0 * 23.0, 2.5 * 23.0, 0.0);
    let centered = Pose::new(rotation, Vector3::zeros()).transform(&center);
    let pose = Pose::new(rotation, Vector3::new(0.0, 0.0, 2100.0) - centered);
    let image = render_board(&camera, &board, &pose);
    let truth: Vec<Vector2<f64>> = board
        .world_points()
        .iter()
        .map(|p| project_world_point(&camera, &pose, p).unwrap())
        .collect();

    let detector = ChessboardDetector::default();
    assert!(detector.detect_at_scale(&image, &board, 1).is_err());
    let corners = detector.detect(&image, &board).unwrap();
    assert_eq!(corners.len(), 54);
    for corner in corners.points() {
        let nearest = truth
            .iter()
            .map(|t| (t - corner).norm())
            .fold(f64::INFINITY, f64::min);
        assert!(nearest < 0.3, "corner {corner:?} is {nearest} px from the board");
    }
}

#[test]
fn test_one_or_two_views_never_succeed() {
    let dir = tempfile::tempdir().unwrap();
    for count in [1, 2] {
        let (images, _) = render_views(&reference_camera(), &board(), count);
        let config = CalibrationConfig {
            sample_count: count,
            display_corners: false,
            record_path: dir.path().join("calib_param.yml"),
            output_dir: dir.path().join("output"),
            ..CalibrationConfig::default()
        };
        let mut source = MemorySource::from_gray(images);
        assert!(matches!(
            run_calibration(&config, &mut source, cancel()),
            Err(CalibrationError::SolverDivergence(_))
        ));
    }
    assert!(!dir.path().join("calib_param.yml").exists());
}

#[test]
fn test_world_points_are_stable() {
    let board = board();
    let first = board.world_points();
    assert_eq!(first.len(), 54);
    assert_eq!(first, board.world_points());
    assert_eq!(first[10], Vector3::new(23.0, 23.0, 0.0));
}
