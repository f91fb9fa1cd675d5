use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::models::{FeatureCollection, VectorFeature};

/// Workers for per-tile work: all CPUs but two, at least one.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

/// Debug configuration for pipeline execution
#[derive(Clone, Debug)]
pub struct DebugConfig {
    /// Root directory for debug outputs
    pub output_dir: PathBuf,
    /// Whether debug mode is enabled
    pub enabled: bool,
}

/// Wall-clock duration of one named stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub duration_ms: u64,
}

/// Context available to every stage and pipeline step of one run.
#[derive(Clone)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub verbose: bool,
    pub debug: Option<DebugConfig>,
    span: tracing::Span,
    timings: Arc<Mutex<Vec<StageTiming>>>,
}

impl PipelineContext {
    pub fn new(verbose: bool) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            verbose,
            debug: None,
            span: tracing::info_span!("adaf_run", run_id = %run_id),
            timings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Save the collection after every pipeline step under `output_dir`,
    /// which must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        if output_dir.exists() {
            let entries = std::fs::read_dir(&output_dir)?;
            if entries.count() > 0 {
                anyhow::bail!("Debug directory is not empty: {}", output_dir.display());
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.debug = Some(DebugConfig {
            output_dir,
            enabled: true,
        });
        Ok(self)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Start a named stage. Start and end are logged; the end record carries
    /// `duration_ms` and is emitted when the guard drops.
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.verbose {
            tracing::info!(parent: &self.span, stage = name, "stage started");
        } else {
            tracing::debug!(parent: &self.span, stage = name, "stage started");
        }
        StageGuard {
            name: name.to_string(),
            started: Instant::now(),
            context: self.clone(),
        }
    }

    /// Durations of every finished stage, in completion order.
    pub fn timings(&self) -> Vec<StageTiming> {
        match self.timings.lock() {
            Ok(timings) => timings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, timing: StageTiming) {
        match self.timings.lock() {
            Ok(mut timings) => timings.push(timing),
            Err(poisoned) => poisoned.into_inner().push(timing),
        }
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(false)
    }
}

pub struct StageGuard {
    name: String,
    started: Instant,
    context: PipelineContext,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let span = &self.context.span;
        if self.context.verbose {
            tracing::info!(parent: span, stage = %self.name, duration_ms, "stage finished");
        } else {
            tracing::debug!(parent: span, stage = %self.name, duration_ms, "stage finished");
        }
        self.context.record(StageTiming {
            stage: std::mem::take(&mut self.name),
            duration_ms,
        });
    }
}

/// Trait that all pipeline steps must implement
pub trait PipelineStep: Send + Sync {
    /// Transform the collection. Steps filter, merge or rewrite features but
    /// never change the CRS.
    fn process(&self, data: FeatureCollection, context: &PipelineContext) -> Result<FeatureCollection>;

    /// Human-readable name for this step (used in logs and debug output)
    fn name(&self) -> &str;
}

/// Composable post-processing pipeline over a feature collection
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    context: PipelineContext,
}

impl Pipeline {
    /// Create a new empty pipeline
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            context: PipelineContext::default(),
        }
    }

    /// Run inside an existing run context (shares its span and timings)
    pub fn with_context(mut self, context: PipelineContext) -> Self {
        self.context = context;
        self
    }

    /// Enable verbose output
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.context.verbose = verbose;
        self
    }

    /// Enable debug mode with output directory.
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        self.context = self.context.with_debug(output_dir)?;
        Ok(self)
    }

    /// Add a processing step to the pipeline
    pub fn add_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Helper method to add a step from a Box (for convenience)
    pub fn add_step_boxed(mut self, step: Box<dyn PipelineStep>) -> Self {
        self.steps.push(Arc::from(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order
    pub fn run(&self, input: FeatureCollection) -> Result<FeatureCollection> {
        self.run_partial(input, self.steps.len())
    }

    /// Run only the first `num_steps` steps (useful for debugging)
    pub fn run_partial(&self, input: FeatureCollection, num_steps: usize) -> Result<FeatureCollection> {
        self.save_debug_output(&input, 0, "input")?;

        let mut data = input;
        for (step_idx, step) in self.steps.iter().take(num_steps).enumerate() {
            let _stage = self.context.stage(step.name());
            let before = data.len();
            data = step.process(data, &self.context)?;
            tracing::debug!(
                parent: self.context.span(),
                step = step.name(),
                before,
                after = data.len(),
                "pipeline step applied"
            );
            self.save_debug_output(&data, step_idx + 1, step.name())?;
        }
        Ok(data)
    }

    /// Dump the collection after a step as GeoJSON, one file per step
    fn save_debug_output(&self, data: &FeatureCollection, index: usize, step_name: &str) -> Result<()> {
        let Some(debug_config) = &self.context.debug else {
            return Ok(());
        };
        if !debug_config.enabled {
            return Ok(());
        }

        let file_name = format!("{:02}_{}.geojson", index, step_name.to_lowercase().replace(' ', "_"));
        let path = debug_config.output_dir.join(&file_name);
        let document = to_geojson(data);
        std::fs::write(&path, serde_json::to_vec_pretty(&document)?)
            .with_context(|| format!("Failed to write debug output {:?}", path))?;
        tracing::debug!(parent: self.context.span(), file = %file_name, features = data.len(), "debug output saved");
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn feature_to_geojson(feature: &VectorFeature) -> serde_json::Value {
    let ring = |ls: &geo::LineString<f64>| -> Vec<[f64; 2]> { ls.coords().map(|c| [c.x, c.y]).collect() };
    let mut rings = vec![ring(feature.geometry.exterior())];
    rings.extend(feature.geometry.interiors().iter().map(ring));
    json!({
        "type": "Feature",
        "geometry": { "type": "Polygon", "coordinates": rings },
        "properties": {
            "label": feature.label,
            "score": feature.score,
            "prediction_path": feature.provenance,
        },
    })
}

/// GeoJSON FeatureCollection of `data`, with the EPSG code as a named CRS.
pub fn to_geojson(data: &FeatureCollection) -> serde_json::Value {
    let features: Vec<_> = data.iter().map(feature_to_geojson).collect();
    match data.crs() {
        Some(crs) => json!({
            "type": "FeatureCollection",
            "crs": { "type": "name", "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", crs.epsg) } },
            "features": features,
        }),
        None => json!({ "type": "FeatureCollection", "features": features }),
    }
}

/// Runs blocking per-item work on tokio's blocking pool, at most `workers`
/// items at a time. Results come back in input order. A panic inside `work`
/// becomes an error for that item only.
#[derive(Debug, Clone, Copy)]
pub struct TileExecutor {
    workers: usize,
}

impl TileExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn map<T, R, F>(&self, items: Vec<T>, work: F) -> Result<Vec<Result<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let work = Arc::new(work);
        let total = items.len();
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permit = semaphore.clone().acquire_owned().await?;
            let work = work.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (*work)(item)))
                    .map_err(|payload| anyhow::anyhow!("worker panicked: {}", panic_message(payload.as_ref())));
                (index, outcome)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.context("Worker task cancelled")?);
        }
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl Default for TileExecutor {
    fn default() -> Self {
        Self::new(default_workers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Crs;
    use geo::{Rect, coord};

    struct KeepFirst;

    impl PipelineStep for KeepFirst {
        fn process(&self, data: FeatureCollection, _context: &PipelineContext) -> Result<FeatureCollection> {
            let mut data = data;
            let first: Vec<_> = data.iter().take(1).cloned().collect();
            data.replace_features(first);
            Ok(data)
        }

        fn name(&self) -> &str {
            "Keep First"
        }
    }

    fn square(x: f64) -> VectorFeature {
        VectorFeature {
            geometry: Rect::new(coord! { x: x, y: 0.0 }, coord! { x: x + 1.0, y: 1.0 }).to_polygon(),
            label: "barrow".into(),
            score: None,
            provenance: None,
        }
    }

    #[tokio::test]
    async fn executor_preserves_input_order() -> Result<()> {
        let executor = TileExecutor::new(3);
        let out = executor
            .map((0..20u64).collect(), |i| {
                std::thread::sleep(std::time::Duration::from_millis(20 - i));
                i * 2
            })
            .await?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(out, (0..20u64).map(|i| i * 2).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn executor_isolates_panicking_items() -> Result<()> {
        let executor = TileExecutor::new(2);
        let out = executor
            .map(vec![1u32, 2, 3], |i| {
                if i == 2 {
                    panic!("tile {} exploded", i);
                }
                i
            })
            .await?;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().ok(), Some(&1));
        let err = out[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("tile 2 exploded"), "{}", err);
        assert_eq!(out[2].as_ref().ok(), Some(&3));
        Ok(())
    }

    #[test]
    fn pipeline_records_stage_timings() -> Result<()> {
        let context = PipelineContext::new(false);
        let pipeline = Pipeline::new().with_context(context.clone()).add_step(Arc::new(KeepFirst));
        let mut input = FeatureCollection::with_crs(Crs::from_epsg(3794));
        input.extend(Crs::from_epsg(3794), vec![square(0.0), square(5.0)])?;

        let out = pipeline.run(input)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out.crs(), Some(Crs::from_epsg(3794)));
        let timings = context.timings();
        assert_eq!(timings.len(), 1);
        assert_eq!(timings[0].stage, "Keep First");
        Ok(())
    }

    #[test]
    fn debug_output_writes_one_file_per_step() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pipeline = Pipeline::new()
            .with_debug(dir.path().join("debug"))?
            .add_step(Arc::new(KeepFirst));
        let mut input = FeatureCollection::new();
        input.extend(Crs::from_epsg(3794), vec![square(0.0), square(5.0)])?;
        pipeline.run(input)?;

        assert!(dir.path().join("debug/00_input.geojson").exists());
        let text = std::fs::read_to_string(dir.path().join("debug/01_keep_first.geojson"))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(value["features"].as_array().map(|f| f.len()), Some(1));
        Ok(())
    }
}
