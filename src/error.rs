use thiserror::Error;

use crate::models::{Crs, DetectionKind};

/// Fatal configuration problems. These abort a run immediately.
///
/// Everything else that can go wrong in a run is either absorbed per tile
/// (logged and skipped) or an I/O failure carried through `anyhow`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("unsupported prediction mode {0:?}: choose 'object detection' or 'segmentation'")]
    UnsupportedMode(String),

    #[error("tile size {0} px is not a power of two of at least 32 px")]
    InvalidTileSize(u32),

    #[error("{name} must lie in [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("CRS mismatch: collection is {expected}, feature is {found}")]
    CrsMismatch { expected: Crs, found: Crs },

    #[error("predictor '{label}' is a {found} model, run is configured for {expected}")]
    PredictorKindMismatch {
        label: String,
        expected: DetectionKind,
        found: DetectionKind,
    },

    #[error("raster {0} carries no georeferencing (pixel scale/tiepoint or transformation tag)")]
    MissingGeoreference(String),
}

/// Check that a probability-like threshold lies in the unit interval.
pub fn check_unit_interval(name: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidThreshold { name, value })
    }
}
