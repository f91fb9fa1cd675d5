use std::path::Path;

use anyhow::Context;

use crate::error::{ConfigurationError, check_unit_interval};
use crate::models::{Crs, RawDetection, TileFeatures, VectorFeature};

use super::provenance_path;

/// Turns per-tile pixel boxes into georeferenced rectangles.
#[derive(Debug, Clone, Copy)]
pub struct BBoxReconstructor {
    /// Records need a score strictly above this to survive.
    pub threshold: f64,
}

impl Default for BBoxReconstructor {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl BBoxReconstructor {
    pub fn new(threshold: f64) -> Result<Self, ConfigurationError> {
        check_unit_interval("detection threshold", threshold)?;
        Ok(Self { threshold })
    }

    /// Parse a prediction text file. Blank lines are ignored; any malformed
    /// line rejects the whole file.
    pub fn parse_file(path: &Path) -> anyhow::Result<Vec<RawDetection>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prediction file {:?}", path))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                line.parse::<RawDetection>()
                    .with_context(|| format!("Malformed record on line {} of {:?}", n + 1, path))
            })
            .collect()
    }

    /// Georeference the surviving records of one tile.
    ///
    /// Returns `Ok(None)` when there are no records at all. Every record has
    /// to agree on the EPSG code, including the ones below the threshold.
    pub fn reconstruct(
        &self,
        detections: &[RawDetection],
        provenance: Option<&str>,
    ) -> Result<Option<(Crs, Vec<VectorFeature>)>, ConfigurationError> {
        let Some(first) = detections.first() else {
            return Ok(None);
        };
        let crs = first.crs();
        let mut features = Vec::new();
        for detection in detections {
            if detection.crs() != crs {
                return Err(ConfigurationError::CrsMismatch {
                    expected: crs,
                    found: detection.crs(),
                });
            }
            // NaN scores fail this comparison too
            if !(detection.score > self.threshold) {
                continue;
            }
            let rect = detection.map_rect();
            let finite = [rect.min().x, rect.min().y, rect.max().x, rect.max().y]
                .iter()
                .all(|v| v.is_finite());
            if !finite || rect.width() <= 0.0 || rect.height() <= 0.0 {
                tracing::warn!(
                    label = %detection.label,
                    record = %detection.to_record(),
                    "degenerate box skipped"
                );
                continue;
            }
            features.push(VectorFeature {
                geometry: rect.to_polygon(),
                label: detection.label.clone(),
                score: Some(detection.score),
                provenance: provenance.map(str::to_string),
            });
        }
        Ok(Some((crs, features)))
    }

    /// Read and georeference one prediction file. Zero-byte files (tiles
    /// where the model found nothing) yield `Ok(None)`.
    pub fn reconstruct_file(&self, path: &Path, keep_provenance: bool) -> anyhow::Result<Option<TileFeatures>> {
        let metadata = std::fs::metadata(path).with_context(|| format!("Cannot stat {:?}", path))?;
        if metadata.len() == 0 {
            return Ok(None);
        }
        let detections = Self::parse_file(path)?;
        let provenance = keep_provenance.then(|| provenance_path(path));
        let Some((crs, features)) = self.reconstruct(&detections, provenance.as_deref())? else {
            return Ok(None);
        };
        Ok(Some(TileFeatures {
            crs,
            source: path.to_path_buf(),
            features,
        }))
    }
}
