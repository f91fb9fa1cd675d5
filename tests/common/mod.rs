#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from adaf for tests
pub use adaf::models::{Crs, DetectionKind, FeatureCollection, GeoTransform, VectorFeature};
pub use adaf::{
    Aggregate, BBoxReconstructor, FeatureAggregator, MaskPolygonizer, PipelineContext, RunConfig, RunOutcome,
    ShapeFilter, VectorOutput, VectorWriter, VectorizeOptions, Vectorizer,
};
