use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::models::{DetectionKind, ProbabilityMask, RawDetection, Tile, TileImage};
use crate::pipeline::{PipelineContext, TileExecutor};
use crate::raster::{GeoRaster, write_geotiff};

/// What a model returns for one tile.
#[derive(Debug, Clone)]
pub enum Prediction {
    Detections(Vec<RawDetection>),
    Mask(ProbabilityMask),
}

/// A trained model for one label. Implementations choose their own hardware.
pub trait Predictor: Send + Sync {
    fn label(&self) -> &str;

    fn kind(&self) -> DetectionKind;

    fn predict(&self, tile: &Tile, image: &TileImage) -> anyhow::Result<Prediction>;
}

/// Outcome of running one predictor over a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSummary {
    pub label: String,
    pub directory: PathBuf,
    pub written: usize,
    pub failed: usize,
}

/// Runs a predictor over every tile on the blocking pool and persists the
/// raw outputs under `<run_dir>/predictions_<label>/`.
#[derive(Debug, Clone, Copy)]
pub struct PredictionRunner {
    executor: TileExecutor,
}

impl PredictionRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            executor: TileExecutor::new(workers),
        }
    }

    pub fn output_dir(run_dir: &Path, label: &str) -> PathBuf {
        run_dir.join(format!("predictions_{}", label))
    }

    pub async fn run(
        &self,
        predictor: Arc<dyn Predictor>,
        raster: Arc<GeoRaster>,
        tiles: &[Tile],
        run_dir: &Path,
        context: &PipelineContext,
    ) -> anyhow::Result<PredictionSummary> {
        let label = predictor.label().to_string();
        let directory = Self::output_dir(run_dir, &label);
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("Failed to create prediction directory {:?}", directory))?;

        let _stage = context.stage(&format!("predict {}", label));
        let out_dir = directory.clone();
        let results = self
            .executor
            .map(tiles.to_vec(), move |tile| {
                let image = raster.window(tile.col_off, tile.row_off, tile.size_px);
                predictor
                    .predict(&tile, &image)
                    .and_then(|prediction| persist(predictor.as_ref(), &tile, prediction, &out_dir))
            })
            .await?;

        let mut summary = PredictionSummary {
            label,
            directory,
            written: 0,
            failed: 0,
        };
        for (tile, outcome) in tiles.iter().zip(results) {
            match outcome.and_then(|persisted| persisted) {
                Ok(path) => {
                    summary.written += 1;
                    tracing::trace!(parent: context.span(), tile = tile.index, path = ?path, "prediction persisted");
                }
                Err(e) => {
                    summary.failed += 1;
                    let cause = format!("{:#}", e);
                    tracing::warn!(
                        parent: context.span(),
                        label = %summary.label,
                        tile = %tile.stem(),
                        error = %cause,
                        "prediction failed, tile skipped"
                    );
                }
            }
        }
        Ok(summary)
    }
}

/// Write one prediction in the on-disk format of its kind.
fn persist(predictor: &dyn Predictor, tile: &Tile, prediction: Prediction, dir: &Path) -> anyhow::Result<PathBuf> {
    match (predictor.kind(), prediction) {
        (DetectionKind::ObjectDetection, Prediction::Detections(detections)) => {
            let path = dir.join(format!("{}.txt", tile.stem()));
            let file = std::fs::File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
            let mut writer = std::io::BufWriter::new(file);
            for detection in &detections {
                writeln!(writer, "{}", detection.to_record())?;
            }
            writer.flush().with_context(|| format!("Failed to write {:?}", path))?;
            Ok(path)
        }
        (DetectionKind::Segmentation, Prediction::Mask(mask)) => {
            let path = dir.join(format!("{}_{}.tif", tile.stem(), predictor.label()));
            write_geotiff(&path, mask.width, mask.height, mask.band(0), &mask.transform, Some(mask.crs), None)?;
            Ok(path)
        }
        (kind, _) => anyhow::bail!("{} model '{}' returned the wrong prediction type", kind, predictor.label()),
    }
}
