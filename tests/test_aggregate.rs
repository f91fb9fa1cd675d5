mod common;

use std::path::PathBuf;

use adaf::models::TileFeatures;
use common::*;
use geo::Area;

fn tile(epsg: u32, features: Vec<VectorFeature>) -> TileFeatures {
    TileFeatures {
        crs: Crs::from_epsg(epsg),
        source: PathBuf::from("tile.txt"),
        features,
    }
}

#[test]
fn no_features_anywhere_is_the_empty_marker() -> anyhow::Result<()> {
    let aggregate = FeatureAggregator::new().aggregate(vec![
        vec![tile(TEST_EPSG, vec![]), tile(TEST_EPSG, vec![])],
        vec![],
    ])?;
    assert!(aggregate.is_empty());
    assert!(matches!(aggregate, Aggregate::Empty));
    Ok(())
}

#[test]
fn concatenates_in_label_then_tile_order() -> anyhow::Result<()> {
    let barrows = vec![
        tile(TEST_EPSG, vec![feature(rect(0.0, 0.0, 1.0, 1.0), "barrow", Some(0.9))]),
        tile(TEST_EPSG, vec![feature(rect(5.0, 0.0, 6.0, 1.0), "barrow", Some(0.8))]),
    ];
    let kilns = vec![tile(TEST_EPSG, vec![feature(rect(9.0, 0.0, 10.0, 1.0), "charcoal_kiln", Some(0.7))])];

    let collection = match FeatureAggregator::new().aggregate(vec![barrows, kilns])? {
        Aggregate::Features(collection) => collection,
        Aggregate::Empty => panic!("expected features"),
    };
    let scores: Vec<_> = collection.iter().map(|f| f.score).collect();
    assert_eq!(scores, vec![Some(0.9), Some(0.8), Some(0.7)]);
    assert_eq!(collection.crs(), Some(Crs::from_epsg(TEST_EPSG)));
    Ok(())
}

#[test]
fn mixed_crs_fails_fast() {
    let err = FeatureAggregator::new()
        .aggregate(vec![
            vec![tile(TEST_EPSG, vec![feature(rect(0.0, 0.0, 1.0, 1.0), "barrow", None)])],
            vec![tile(32633, vec![feature(rect(0.0, 0.0, 1.0, 1.0), "barrow", None)])],
        ])
        .unwrap_err();
    assert_eq!(
        err,
        adaf::ConfigurationError::CrsMismatch {
            expected: Crs::from_epsg(TEST_EPSG),
            found: Crs::from_epsg(32633),
        }
    );
}

#[test]
fn overlapping_boxes_are_kept_apart_by_default() -> anyhow::Result<()> {
    let features = vec![
        feature(rect(0.0, 0.0, 4.0, 4.0), "barrow", Some(0.9)),
        feature(rect(2.0, 2.0, 6.0, 6.0), "barrow", Some(0.6)),
    ];
    let collection = FeatureAggregator::new()
        .aggregate(vec![vec![tile(TEST_EPSG, features)]])?
        .into_collection();
    assert_eq!(collection.len(), 2);
    Ok(())
}

#[test]
fn overlap_merge_averages_scores_per_label() -> anyhow::Result<()> {
    let mut a = feature(rect(0.0, 0.0, 4.0, 4.0), "barrow", Some(0.9));
    a.provenance = Some("run/predictions_barrow/b.txt".into());
    let mut b = feature(rect(2.0, 2.0, 6.0, 6.0), "barrow", Some(0.6));
    b.provenance = Some("run/predictions_barrow/a.txt".into());
    // transitively connected through b
    let c = feature(rect(5.0, 5.0, 8.0, 8.0), "barrow", Some(0.3));
    // same place, different label: untouched
    let kiln = feature(rect(0.0, 0.0, 4.0, 4.0), "charcoal_kiln", Some(0.5));
    // edge contact only: not an overlap
    let neighbour = feature(rect(20.0, 0.0, 22.0, 2.0), "barrow", Some(0.4));
    let touching = feature(rect(22.0, 0.0, 24.0, 2.0), "barrow", Some(0.2));

    let collection = FeatureAggregator::new()
        .with_merge_overlaps(true)
        .aggregate(vec![vec![tile(TEST_EPSG, vec![a, b, c, kiln, neighbour, touching])]])?
        .into_collection();

    assert_eq!(collection.len(), 4);
    let merged = &collection.features()[0];
    assert_eq!(merged.label, "barrow");
    assert!((merged.score.unwrap() - 0.6).abs() < 1e-12);
    assert_eq!(
        merged.provenance.as_deref(),
        Some("run/predictions_barrow/a.txt;run/predictions_barrow/b.txt")
    );
    // 16 + 16 - 4 + 9 - 1
    assert!((merged.geometry.unsigned_area() - 36.0).abs() < 1e-9);

    let labels: Vec<_> = collection.iter().map(|f| f.label.as_str()).collect();
    assert_eq!(labels, vec!["barrow", "charcoal_kiln", "barrow", "barrow"]);
    assert_eq!(collection.features()[1].score, Some(0.5));
    Ok(())
}
