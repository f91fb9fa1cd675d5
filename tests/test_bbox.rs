mod common;

use common::*;
use geo::BoundingRect;

#[test]
fn barrow_box_lands_on_expected_corners() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = write_detections(
        &dir.path().join("predictions_barrow"),
        "tile_r0000_c0000.txt",
        &[detection(0.0, 0.0, 100.0, 50.0, "barrow", 0.9)],
    );

    let tile = BBoxReconstructor::default()
        .reconstruct_file(&path, false)?
        .expect("non-empty file yields features");
    assert_eq!(tile.crs, Crs::from_epsg(TEST_EPSG));
    assert_eq!(tile.features.len(), 1);

    let feature = &tile.features[0];
    assert_eq!(feature.label, "barrow");
    assert_eq!(feature.score, Some(0.9));
    assert_eq!(feature.provenance, None);
    let bounds = feature.geometry.bounding_rect().unwrap();
    assert_eq!((bounds.min().x, bounds.max().y), (500000.0, 6000000.0));
    assert_eq!((bounds.max().x, bounds.min().y), (500050.0, 5999975.0));
    Ok(())
}

#[test]
fn box_corners_round_trip_to_pixels() -> anyhow::Result<()> {
    let raw = detection(12.0, 40.0, 30.0, 64.0, "enclosure", 0.7);
    let rect = raw.map_rect();
    let to_px = |x: f64, y: f64| ((x - raw.x_min) / raw.resolution, (raw.y_max - y) / raw.resolution);
    assert_eq!(to_px(rect.min().x, rect.max().y), (12.0, 40.0));
    assert_eq!(to_px(rect.max().x, rect.min().y), (30.0, 64.0));
    Ok(())
}

#[test]
fn threshold_boundary_is_exclusive() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = write_detections(
        dir.path(),
        "tile.txt",
        &[
            detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.5),
            detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.500001),
        ],
    );
    let tile = BBoxReconstructor::new(0.5)?.reconstruct_file(&path, false)?.unwrap();
    assert_eq!(tile.features.len(), 1);
    assert_eq!(tile.features[0].score, Some(0.500001));
    Ok(())
}

#[test]
fn zero_byte_file_is_skipped_silently() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("empty.txt");
    std::fs::write(&path, b"")?;
    assert!(BBoxReconstructor::default().reconstruct_file(&path, false)?.is_none());
    Ok(())
}

#[test]
fn float_epsg_and_blank_lines_are_accepted() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("tile.txt");
    std::fs::write(&path, "\n0 0 10 10 barrow 0.8 3794.0 0.5 500000 6000000\n\n")?;
    let tile = BBoxReconstructor::default().reconstruct_file(&path, false)?.unwrap();
    assert_eq!(tile.crs, Crs::from_epsg(3794));
    assert_eq!(tile.features.len(), 1);
    Ok(())
}

#[test]
fn provenance_is_last_three_path_components() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = write_detections(
        &dir.path().join("run_obj").join("predictions_barrow"),
        "tile_r0001_c0002.txt",
        &[detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.9)],
    );
    let tile = BBoxReconstructor::default().reconstruct_file(&path, true)?.unwrap();
    assert_eq!(
        tile.features[0].provenance.as_deref(),
        Some("run_obj/predictions_barrow/tile_r0001_c0002.txt")
    );
    Ok(())
}

#[tokio::test]
async fn malformed_and_empty_files_do_not_abort_vectorization() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let preds = dir.path().join("predictions_barrow");
    write_detections(&preds, "a.txt", &[detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.9)]);
    std::fs::write(preds.join("b.txt"), "not a record\n")?;
    std::fs::write(preds.join("c.txt"), "")?;
    std::fs::write(preds.join("notes.md"), "ignored")?;

    let vectorizer = Vectorizer::new(VectorizeOptions::new(DetectionKind::ObjectDetection).with_workers(2))?;
    let out = vectorizer
        .vectorize(&[("barrow".to_string(), preds.clone())], &PipelineContext::default())
        .await?;

    assert_eq!(out.files, 3);
    assert_eq!(out.skipped, vec![preds.join("b.txt")]);
    match out.aggregate {
        Aggregate::Features(collection) => assert_eq!(collection.len(), 1),
        Aggregate::Empty => panic!("expected one feature"),
    }
    Ok(())
}

#[tokio::test]
async fn crs_mismatch_across_tiles_fails_fast() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let preds = dir.path().join("predictions_barrow");
    write_detections(&preds, "a.txt", &[detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.9)]);
    let mut other = detection(0.0, 0.0, 10.0, 10.0, "barrow", 0.9);
    other.epsg = 32633;
    write_detections(&preds, "b.txt", &[other]);

    let vectorizer = Vectorizer::new(VectorizeOptions::new(DetectionKind::ObjectDetection))?;
    let err = vectorizer
        .vectorize(&[("barrow".to_string(), preds)], &PipelineContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<adaf::ConfigurationError>(),
        Some(adaf::ConfigurationError::CrsMismatch { .. })
    ));
    Ok(())
}

#[test]
fn nan_scores_never_pass_the_threshold() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("tile.txt");
    std::fs::write(
        &path,
        "0 0 10 10 barrow NaN 3794 0.5 500000 6000000\n0 0 10 10 barrow 0.8 3794 0.5 500000 6000000\n",
    )?;
    let tile = BBoxReconstructor::default().reconstruct_file(&path, false)?.unwrap();
    assert_eq!(tile.features.len(), 1);
    assert_eq!(tile.features[0].score, Some(0.8));
    Ok(())
}

#[test]
fn degenerate_boxes_are_skipped() -> anyhow::Result<()> {
    use geo::Area;

    let reconstructor = BBoxReconstructor::default();
    let (_, features) = reconstructor
        .reconstruct(
            &[
                detection(5.0, 0.0, 5.0, 10.0, "barrow", 0.9),
                detection(0.0, 3.0, 10.0, 3.0, "barrow", 0.9),
                detection(0.0, 0.0, f64::INFINITY, 10.0, "barrow", 0.9),
                detection(0.0, 0.0, 4.0, 10.0, "barrow", 0.9),
            ],
            None,
        )?
        .unwrap();
    assert_eq!(features.len(), 1);
    // 2 m x 5 m at 0.5 m pixels
    assert!((features[0].geometry.unsigned_area() - 10.0).abs() < 1e-9);
    Ok(())
}
