pub mod core;
pub mod detection;
pub mod error;
pub mod grid;
pub mod models;
pub mod pipeline;
pub mod raster;
pub mod run;

pub use crate::core::gpkg::{VectorOutput, VectorWriter};
pub use detection::aggregate::{Aggregate, FeatureAggregator};
pub use detection::bbox::BBoxReconstructor;
pub use detection::mask::MaskPolygonizer;
pub use detection::model::{Prediction, PredictionRunner, Predictor};
pub use detection::steps::{MinAreaFilterStep, OverlapMergeStep, RoundnessFilterStep, ShapeFilter};
pub use detection::{VectorizeOptions, Vectorizer};
pub use error::ConfigurationError;
pub use grid::{GridBuilder, TileGrid};
pub use models::{
    Crs, DetectionKind, FeatureCollection, GeoTransform, ProbabilityMask, RawDetection, Tile, TileFeatures,
    TileImage, VectorFeature,
};
pub use pipeline::{Pipeline, PipelineContext, PipelineStep, TileExecutor, default_workers};
pub use run::{RunConfig, RunOutcome, RunReport, run, run_batch};
