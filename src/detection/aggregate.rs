use std::collections::BTreeMap;

use crate::error::ConfigurationError;
use crate::models::{FeatureCollection, TileFeatures, VectorFeature};

use super::shapes::{MergeRule, dissolve, interiors_overlap};

/// Result of aggregation: features, or the explicit "nothing found" marker.
#[derive(Debug, Clone)]
pub enum Aggregate {
    Features(FeatureCollection),
    Empty,
}

impl Aggregate {
    pub fn is_empty(&self) -> bool {
        matches!(self, Aggregate::Empty)
    }

    pub fn into_collection(self) -> FeatureCollection {
        match self {
            Aggregate::Features(collection) => collection,
            Aggregate::Empty => FeatureCollection::new(),
        }
    }
}

/// Concatenates per-tile outputs of every label into one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureAggregator {
    pub merge_overlaps: bool,
}

impl FeatureAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merge_overlaps(mut self, merge: bool) -> Self {
        self.merge_overlaps = merge;
        self
    }

    /// Label order first, then tile order. The first tile fixes the CRS.
    pub fn aggregate<I>(&self, per_label: I) -> Result<Aggregate, ConfigurationError>
    where
        I: IntoIterator<Item = Vec<TileFeatures>>,
    {
        let mut collection = FeatureCollection::new();
        for tiles in per_label {
            for tile in tiles {
                collection.extend(tile.crs, tile.features)?;
            }
        }
        if self.merge_overlaps {
            collection = merge_overlaps(collection);
        }
        if collection.is_empty() {
            Ok(Aggregate::Empty)
        } else {
            Ok(Aggregate::Features(collection))
        }
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Fuse same-label features whose interiors overlap. Every part of a fused
/// group carries the group's mean score and its sorted provenance paths.
pub fn merge_overlaps(collection: FeatureCollection) -> FeatureCollection {
    let crs = collection.crs();
    let features = collection.into_features();

    let mut by_label: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, feature) in features.iter().enumerate() {
        by_label.entry(feature.label.as_str()).or_default().push(i);
    }

    let mut parent: Vec<usize> = (0..features.len()).collect();
    for members in by_label.values() {
        for (n, &a) in members.iter().enumerate() {
            for &b in &members[n + 1..] {
                if find(&mut parent, a) != find(&mut parent, b)
                    && interiors_overlap(&features[a].geometry, &features[b].geometry)
                {
                    let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                    parent[rb.max(ra)] = rb.min(ra);
                }
            }
        }
    }

    // Groups keyed by root, visited in order of their first member
    let mut groups: BTreeMap<usize, Vec<VectorFeature>> = BTreeMap::new();
    for (i, feature) in features.into_iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(feature);
    }

    let mut merged = Vec::new();
    for (_, group) in groups {
        if group.len() == 1 {
            merged.extend(group);
            continue;
        }
        merged.extend(fuse_group(group));
    }

    let mut out = match crs {
        Some(crs) => FeatureCollection::with_crs(crs),
        None => FeatureCollection::new(),
    };
    out.replace_features(merged);
    out
}

fn fuse_group(group: Vec<VectorFeature>) -> Vec<VectorFeature> {
    let label = group[0].label.clone();
    let scores: Vec<f64> = group.iter().filter_map(|f| f.score).collect();
    let score = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

    let mut paths: Vec<String> = group.iter().filter_map(|f| f.provenance.clone()).collect();
    paths.sort();
    paths.dedup();
    let provenance = (!paths.is_empty()).then(|| paths.join(";"));

    dissolve(group.into_iter().map(|f| f.geometry), MergeRule::SharedArea)
        .into_iter()
        .map(|geometry| VectorFeature {
            geometry,
            label: label.clone(),
            score,
            provenance: provenance.clone(),
        })
        .collect()
}
