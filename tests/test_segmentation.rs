mod common;

use common::*;
use geo::{Area, BoundingRect};

#[test]
fn two_disjoint_regions_give_two_polygons() {
    let mask = mask_from_rows(&[
        &[0.9, 0.9, 0.0, 0.0, 0.0],
        &[0.9, 0.9, 0.0, 0.0, 0.0],
        &[0.0, 0.0, 0.0, 0.8, 0.8],
        &[0.0, 0.0, 0.0, 0.8, 0.8],
    ]);
    let features = MaskPolygonizer::default().polygonize(&mask, "charcoal_kiln", None);
    assert_eq!(features.len(), 2);
    for feature in &features {
        assert_eq!(feature.label, "charcoal_kiln");
        assert_eq!(feature.score, None);
        assert!((feature.geometry.unsigned_area() - 4.0).abs() < 1e-9);
    }

    let first = features[0].geometry.bounding_rect().unwrap();
    assert_eq!((first.min().x, first.max().y), (TEST_ORIGIN.0, TEST_ORIGIN.1));
    assert_eq!((first.max().x, first.min().y), (TEST_ORIGIN.0 + 2.0, TEST_ORIGIN.1 - 2.0));
}

#[test]
fn holes_survive_polygonization() {
    let mask = mask_from_rows(&[
        &[1.0, 1.0, 1.0],
        &[1.0, 0.0, 1.0],
        &[1.0, 1.0, 1.0],
    ]);
    let features = MaskPolygonizer::default().polygonize(&mask, "enclosure", None);
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].geometry.interiors().len(), 1);
    assert!((features[0].geometry.unsigned_area() - 8.0).abs() < 1e-9);
}

#[test]
fn diagonal_pixels_stay_separate() {
    let mask = mask_from_rows(&[&[1.0, 0.0], &[0.0, 1.0]]);
    let features = MaskPolygonizer::default().polygonize(&mask, "barrow", None);
    assert_eq!(features.len(), 2);
}

#[test]
fn threshold_includes_equal_probabilities() -> anyhow::Result<()> {
    let mask = mask_from_rows(&[&[0.7, 0.69]]);
    let features = MaskPolygonizer::new(0.7)?.polygonize(&mask, "barrow", None);
    assert_eq!(features.len(), 1);
    assert!((features[0].geometry.unsigned_area() - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn probability_rasters_are_read_from_disk() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = write_raster(&dir.path().join("tile_r0000_c0000_barrow.tif"), 8, 8, 0.5, None, |col, row| {
        if (2..5).contains(&col) && (1..3).contains(&row) { 0.95 } else { 0.05 }
    });
    let tile = MaskPolygonizer::default().polygonize_file(&path, "barrow", true)?;
    assert_eq!(tile.crs, Crs::from_epsg(TEST_EPSG));
    assert_eq!(tile.features.len(), 1);
    // 3 x 2 pixels of 0.5 m
    assert!((tile.features[0].geometry.unsigned_area() - 1.5).abs() < 1e-9);
    assert!(tile.features[0].provenance.as_deref().is_some_and(|p| p.ends_with("tile_r0000_c0000_barrow.tif")));
    Ok(())
}

#[tokio::test]
async fn unreadable_rasters_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let preds = dir.path().join("predictions_barrow");
    std::fs::create_dir_all(&preds)?;
    write_raster(&preds.join("a_barrow.tif"), 4, 4, 1.0, None, |col, _| if col < 2 { 1.0 } else { 0.0 });
    std::fs::write(preds.join("b_barrow.tif"), b"definitely not a tiff")?;

    let vectorizer = Vectorizer::new(VectorizeOptions::new(DetectionKind::Segmentation))?;
    let out = vectorizer
        .vectorize(&[("barrow".to_string(), preds.clone())], &PipelineContext::default())
        .await?;
    assert_eq!(out.skipped, vec![preds.join("b_barrow.tif")]);
    assert_eq!(out.aggregate.into_collection().len(), 1);
    Ok(())
}

#[test]
fn single_pixel_mask_is_one_square() {
    let features = MaskPolygonizer::default().polygonize(&mask_from_rows(&[&[0.9]]), "barrow", None);
    assert_eq!(features.len(), 1);
    assert!((features[0].geometry.unsigned_area() - 1.0).abs() < 1e-9);
}

#[test]
fn regions_touching_the_mask_edge_are_closed() {
    let mask = mask_from_rows(&[&[0.9, 0.0, 0.9], &[0.9, 0.0, 0.9]]);
    let features = MaskPolygonizer::default().polygonize(&mask, "barrow", None);
    assert_eq!(features.len(), 2);
    for feature in &features {
        assert!((feature.geometry.unsigned_area() - 2.0).abs() < 1e-9);
    }
}
