pub mod aggregate;
pub mod bbox;
pub mod contours;
pub mod mask;
pub mod model;
pub mod shapes;
pub mod steps;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, check_unit_interval};
use crate::models::{DetectionKind, FeatureCollection, TileFeatures};
use crate::pipeline::{Pipeline, PipelineContext, TileExecutor, default_workers};

use aggregate::{Aggregate, FeatureAggregator};
use bbox::BBoxReconstructor;
use mask::MaskPolygonizer;
use steps::{OverlapMergeStep, ShapeFilter};

/// Last three components of `path`, joined with `/`.
pub fn provenance_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts[parts.len().saturating_sub(3)..].join("/")
}

/// Prediction files of `kind` in `dir`, sorted by file name.
pub fn prediction_files(dir: &Path, kind: DetectionKind) -> anyhow::Result<Vec<PathBuf>> {
    let extensions = kind.prediction_extensions();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list predictions in {:?}", dir))? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Tunables of the vectorization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorizeOptions {
    pub kind: DetectionKind,
    /// Score threshold (object detection, exclusive) or probability
    /// threshold (segmentation, inclusive).
    pub threshold: f64,
    pub roundness: Option<f64>,
    pub min_area: Option<f64>,
    pub keep_provenance: bool,
    pub merge_overlaps: bool,
    pub workers: usize,
}

impl VectorizeOptions {
    pub fn new(kind: DetectionKind) -> Self {
        Self {
            kind,
            threshold: 0.5,
            roundness: None,
            min_area: None,
            keep_provenance: false,
            merge_overlaps: false,
            workers: default_workers(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_roundness(mut self, roundness: Option<f64>) -> Self {
        self.roundness = roundness;
        self
    }

    pub fn with_min_area(mut self, min_area: Option<f64>) -> Self {
        self.min_area = min_area;
        self
    }

    pub fn with_provenance(mut self, keep: bool) -> Self {
        self.keep_provenance = keep;
        self
    }

    pub fn with_merge_overlaps(mut self, merge: bool) -> Self {
        self.merge_overlaps = merge;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_unit_interval("threshold", self.threshold)?;
        if let Some(roundness) = self.roundness {
            check_unit_interval("roundness", roundness)?;
        }
        Ok(())
    }

    /// Shape filtering only applies to segmentation output.
    pub fn shape_filter(&self) -> ShapeFilter {
        match self.kind {
            DetectionKind::Segmentation => ShapeFilter::new(self.roundness, self.min_area),
            DetectionKind::ObjectDetection => ShapeFilter::default(),
        }
    }
}

/// Vectorized output of every label plus bookkeeping.
#[derive(Debug, Clone)]
pub struct Vectorized {
    pub aggregate: Aggregate,
    pub files: usize,
    pub skipped: Vec<PathBuf>,
}

/// Turns directories of raw predictions into one feature collection.
pub struct Vectorizer {
    options: VectorizeOptions,
    executor: TileExecutor,
}

enum Extractor {
    Boxes(BBoxReconstructor),
    Masks(MaskPolygonizer),
}

impl Extractor {
    fn extract(&self, path: &Path, label: &str, keep_provenance: bool) -> anyhow::Result<Option<TileFeatures>> {
        match self {
            Extractor::Boxes(reconstructor) => reconstructor.reconstruct_file(path, keep_provenance),
            Extractor::Masks(polygonizer) => polygonizer.polygonize_file(path, label, keep_provenance).map(Some),
        }
    }
}

impl Vectorizer {
    pub fn new(options: VectorizeOptions) -> Result<Self, ConfigurationError> {
        options.validate()?;
        let executor = TileExecutor::new(options.workers);
        Ok(Self { options, executor })
    }

    pub fn options(&self) -> &VectorizeOptions {
        &self.options
    }

    /// Post-processing steps applied after aggregation
    pub fn build_pipeline(&self, context: &PipelineContext) -> Pipeline {
        let mut pipeline = Pipeline::new().with_context(context.clone());
        if self.options.merge_overlaps {
            pipeline = pipeline.add_step(Arc::new(OverlapMergeStep));
        }
        self.options.shape_filter().add_to(pipeline)
    }

    /// Vectorize `(label, directory)` pairs, in the given label order.
    ///
    /// Unreadable or malformed files are logged and skipped. A CRS
    /// disagreement anywhere aborts.
    pub async fn vectorize(
        &self,
        predictions: &[(String, PathBuf)],
        context: &PipelineContext,
    ) -> anyhow::Result<Vectorized> {
        let extractor = Arc::new(match self.options.kind {
            DetectionKind::ObjectDetection => Extractor::Boxes(BBoxReconstructor::new(self.options.threshold)?),
            DetectionKind::Segmentation => Extractor::Masks(MaskPolygonizer::new(self.options.threshold)?),
        });
        let keep_provenance = self.options.keep_provenance;

        let mut per_label = Vec::with_capacity(predictions.len());
        let mut skipped = Vec::new();
        let mut files = 0;
        {
            let _stage = context.stage("extract");
            for (label, dir) in predictions {
                let paths = prediction_files(dir, self.options.kind)?;
                files += paths.len();
                let extractor = extractor.clone();
                let label_owned = label.clone();
                let results = self
                    .executor
                    .map(paths.clone(), move |path| extractor.extract(&path, &label_owned, keep_provenance))
                    .await?;

                let mut tiles = Vec::new();
                for (path, outcome) in paths.into_iter().zip(results) {
                    match outcome.and_then(|extracted| extracted) {
                        Ok(Some(tile)) => tiles.push(tile),
                        Ok(None) => {}
                        Err(e) if matches!(
                            e.downcast_ref::<ConfigurationError>(),
                            Some(ConfigurationError::CrsMismatch { .. })
                        ) =>
                        {
                            return Err(e);
                        }
                        Err(e) => {
                            let cause = format!("{:#}", e);
                            tracing::warn!(parent: context.span(), path = ?path, error = %cause, "prediction file skipped");
                            skipped.push(path);
                        }
                    }
                }
                tracing::debug!(parent: context.span(), label = %label, tiles = tiles.len(), "label extracted");
                per_label.push(tiles);
            }
        }

        let aggregate = {
            let _stage = context.stage("aggregate");
            FeatureAggregator::new().aggregate(per_label)?
        };

        let aggregate = match aggregate {
            Aggregate::Empty => Aggregate::Empty,
            Aggregate::Features(collection) => {
                let pipeline = self.build_pipeline(context);
                let collection: FeatureCollection = pipeline.run(collection)?;
                if collection.is_empty() {
                    Aggregate::Empty
                } else {
                    Aggregate::Features(collection)
                }
            }
        };

        Ok(Vectorized {
            aggregate,
            files,
            skipped,
        })
    }
}
