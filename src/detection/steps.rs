use std::sync::Arc;

use anyhow::Result;

use crate::detection::aggregate::merge_overlaps;
use crate::detection::shapes::{area, roundness};
use crate::models::FeatureCollection;
use crate::pipeline::{Pipeline, PipelineContext, PipelineStep};

/// Keep features whose roundness is strictly above `threshold`
pub struct RoundnessFilterStep {
    pub threshold: f64,
}

impl PipelineStep for RoundnessFilterStep {
    fn process(&self, mut data: FeatureCollection, context: &PipelineContext) -> Result<FeatureCollection> {
        let before = data.len();
        data.retain(|feature| roundness(&feature.geometry) > self.threshold);
        if context.verbose {
            tracing::info!(
                parent: context.span(),
                threshold = self.threshold,
                dropped = before - data.len(),
                "roundness filter"
            );
        }
        Ok(data)
    }

    fn name(&self) -> &str {
        "Roundness Filter"
    }
}

/// Keep features whose area (map units squared) is strictly above `min_area`
pub struct MinAreaFilterStep {
    pub min_area: f64,
}

impl PipelineStep for MinAreaFilterStep {
    fn process(&self, mut data: FeatureCollection, context: &PipelineContext) -> Result<FeatureCollection> {
        let before = data.len();
        data.retain(|feature| area(&feature.geometry) > self.min_area);
        if context.verbose {
            tracing::info!(
                parent: context.span(),
                min_area = self.min_area,
                dropped = before - data.len(),
                "minimum area filter"
            );
        }
        Ok(data)
    }

    fn name(&self) -> &str {
        "Minimum Area Filter"
    }
}

/// Fuse overlapping same-label features, averaging their scores
pub struct OverlapMergeStep;

impl PipelineStep for OverlapMergeStep {
    fn process(&self, data: FeatureCollection, context: &PipelineContext) -> Result<FeatureCollection> {
        let before = data.len();
        let merged = merge_overlaps(data);
        if context.verbose {
            tracing::info!(parent: context.span(), before, after = merged.len(), "overlap merge");
        }
        Ok(merged)
    }

    fn name(&self) -> &str {
        "Overlap Merge"
    }
}

/// Roundness then minimum-area filtering of segmentation output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShapeFilter {
    pub roundness: Option<f64>,
    pub min_area: Option<f64>,
}

impl ShapeFilter {
    pub fn new(roundness: Option<f64>, min_area: Option<f64>) -> Self {
        Self { roundness, min_area }
    }

    pub fn is_noop(&self) -> bool {
        self.roundness.is_none() && self.min_area.is_none()
    }

    /// Append the configured filter steps to `pipeline`
    pub fn add_to(&self, mut pipeline: Pipeline) -> Pipeline {
        if let Some(threshold) = self.roundness {
            pipeline = pipeline.add_step(Arc::new(RoundnessFilterStep { threshold }));
        }
        if let Some(min_area) = self.min_area {
            pipeline = pipeline.add_step(Arc::new(MinAreaFilterStep { min_area }));
        }
        pipeline
    }

    pub fn filter(&self, collection: FeatureCollection) -> Result<FeatureCollection> {
        self.add_to(Pipeline::new()).run(collection)
    }
}
