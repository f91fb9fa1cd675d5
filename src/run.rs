use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::gpkg::{VectorOutput, VectorWriter};
use crate::core::workspace::create_run_dir;
use crate::detection::aggregate::Aggregate;
use crate::detection::model::{PredictionRunner, Predictor};
use crate::detection::{VectorizeOptions, Vectorizer, prediction_files};
use crate::error::{ConfigurationError, check_unit_interval};
use crate::grid::{DEFAULT_TILE_SIZE, GridBuilder};
use crate::models::DetectionKind;
use crate::pipeline::{PipelineContext, StageTiming, default_workers};
use crate::raster::build_vrt;

/// Everything that parameterizes one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub kind: DetectionKind,
    pub tile_size: u32,
    pub threshold: f64,
    pub roundness: Option<f64>,
    pub min_area: Option<f64>,
    /// Keep raw per-tile predictions (and record provenance paths)
    pub keep_ml_output: bool,
    pub merge_overlaps: bool,
    pub workers: usize,
    pub verbose: bool,
}

impl RunConfig {
    pub fn new(kind: DetectionKind) -> Self {
        Self {
            kind,
            tile_size: DEFAULT_TILE_SIZE,
            threshold: 0.5,
            roundness: None,
            min_area: None,
            keep_ml_output: false,
            merge_overlaps: false,
            workers: default_workers(),
            verbose: false,
        }
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
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

    pub fn with_keep_ml_output(mut self, keep: bool) -> Self {
        self.keep_ml_output = keep;
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

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn vectorize_options(&self) -> VectorizeOptions {
        VectorizeOptions::new(self.kind)
            .with_threshold(self.threshold)
            .with_roundness(self.roundness)
            .with_min_area(self.min_area)
            .with_provenance(self.keep_ml_output)
            .with_merge_overlaps(self.merge_overlaps)
            .with_workers(self.workers)
    }

    pub fn validate(&self, predictors: &[Arc<dyn Predictor>]) -> Result<(), ConfigurationError> {
        GridBuilder::new(self.tile_size)?;
        check_unit_interval("threshold", self.threshold)?;
        self.vectorize_options().validate()?;
        for predictor in predictors {
            if predictor.kind() != self.kind {
                return Err(ConfigurationError::PredictorKindMismatch {
                    label: predictor.label().to_string(),
                    expected: self.kind,
                    found: predictor.kind(),
                });
            }
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub raster: PathBuf,
    pub run_dir: PathBuf,
    /// Final vector file, `None` when nothing was found
    pub output: Option<PathBuf>,
    pub features: usize,
    pub tiles: usize,
    pub skipped_tiles: usize,
    pub skipped_files: Vec<PathBuf>,
    /// Prediction directories and VRTs left on disk
    pub retained: Vec<PathBuf>,
    pub stages: Vec<StageTiming>,
}

impl RunReport {
    pub const FILE_NAME: &'static str = "run_report.json";

    /// Write the report as JSON into the run directory.
    pub async fn save(&self) -> anyhow::Result<PathBuf> {
        let path = self.run_dir.join(Self::FILE_NAME);
        tokio::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .await
            .with_context(|| format!("Failed to write run report {:?}", path))?;
        Ok(path)
    }

    pub fn vector_output(&self) -> VectorOutput {
        match &self.output {
            Some(path) => VectorOutput::Written(path.clone()),
            None => VectorOutput::NoFeatures,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The raster holds no valid pixels; nothing was produced.
    NoValidData { raster: PathBuf },
    Completed(RunReport),
}

/// Tile a raster, predict every label, vectorize and write the result.
pub async fn run(raster_path: &Path, predictors: &[Arc<dyn Predictor>], config: &RunConfig) -> anyhow::Result<RunOutcome> {
    config.validate(predictors)?;
    let context = PipelineContext::new(config.verbose);
    tracing::info!(parent: context.span(), raster = ?raster_path, kind = %config.kind, "run started");

    let builder = GridBuilder::new(config.tile_size)?;
    let (raster, grid) = builder.build_from_path(raster_path, &context).await?;
    if grid.is_empty() {
        tracing::warn!(parent: context.span(), raster = ?raster_path, "no valid data in raster, no visualizations produced");
        return Ok(RunOutcome::NoValidData {
            raster: raster_path.to_path_buf(),
        });
    }

    let run_dir = create_run_dir(raster_path, config.kind).await?;
    let raster = Arc::new(raster);
    let runner = PredictionRunner::new(config.workers);
    let mut predictions = Vec::with_capacity(predictors.len());
    let mut skipped_tiles = 0;
    for predictor in predictors {
        let summary = runner
            .run(predictor.clone(), raster.clone(), &grid.tiles, &run_dir, &context)
            .await?;
        skipped_tiles += summary.failed;
        predictions.push((summary.label, summary.directory));
    }

    let vectorizer = Vectorizer::new(config.vectorize_options())?;
    let vectorized = vectorizer.vectorize(&predictions, &context).await?;

    let output = {
        let _stage = context.stage("write");
        match &vectorized.aggregate {
            Aggregate::Features(collection) => VectorWriter::write(collection, &run_dir, config.kind).await?,
            Aggregate::Empty => VectorOutput::NoFeatures,
        }
    };
    let features = match &vectorized.aggregate {
        Aggregate::Features(collection) => collection.len(),
        Aggregate::Empty => 0,
    };

    let retained = {
        let _stage = context.stage("raw outputs");
        finish_raw_outputs(&predictions, &run_dir, config).await?
    };

    let report = RunReport {
        raster: raster_path.to_path_buf(),
        run_dir,
        output: match output {
            VectorOutput::Written(path) => Some(path),
            VectorOutput::NoFeatures => None,
        },
        features,
        tiles: grid.tiles.len(),
        skipped_tiles,
        skipped_files: vectorized.skipped,
        retained,
        stages: context.timings(),
    };
    match &report.output {
        Some(path) => tracing::info!(
            parent: context.span(),
            output = ?path,
            features = report.features,
            tiles = report.tiles,
            skipped_tiles = report.skipped_tiles,
            "run finished"
        ),
        None => tracing::info!(parent: context.span(), tiles = report.tiles, "run finished, no features detected"),
    }
    report.save().await?;
    Ok(RunOutcome::Completed(report))
}

/// Build per-label VRTs (segmentation) or delete the raw outputs.
async fn finish_raw_outputs(
    predictions: &[(String, PathBuf)],
    run_dir: &Path,
    config: &RunConfig,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut retained = Vec::new();
    for (label, dir) in predictions {
        if !config.keep_ml_output {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("Failed to remove prediction directory {:?}", dir))?;
            continue;
        }
        retained.push(dir.clone());
        if config.kind == DetectionKind::Segmentation {
            let sources = prediction_files(dir, config.kind)?;
            if sources.is_empty() {
                continue;
            }
            let vrt = run_dir.join(format!("predictions_{}.vrt", label));
            let target = vrt.clone();
            tokio::task::spawn_blocking(move || build_vrt(&sources, &target)).await??;
            retained.push(vrt);
        }
    }
    Ok(retained)
}

/// Run several rasters one after another with the same configuration.
pub async fn run_batch(
    rasters: &[PathBuf],
    predictors: &[Arc<dyn Predictor>],
    config: &RunConfig,
) -> anyhow::Result<Vec<RunOutcome>> {
    let mut outcomes = Vec::with_capacity(rasters.len());
    for (n, raster) in rasters.iter().enumerate() {
        tracing::info!(raster = ?raster, position = n + 1, total = rasters.len(), "batch item");
        outcomes.push(run(raster, predictors, config).await?);
    }
    Ok(outcomes)
}
