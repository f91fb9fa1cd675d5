use std::path::Path;

use image::{GrayImage, Luma};

use crate::error::{ConfigurationError, check_unit_interval};
use crate::models::{ProbabilityMask, TileFeatures, VectorFeature};
use crate::raster::read_geotiff;

use super::contours::find_contours;
use super::provenance_path;
use super::shapes::{MergeRule, dissolve};

/// Thresholds probability rasters and traces the qualifying regions.
#[derive(Debug, Clone, Copy)]
pub struct MaskPolygonizer {
    /// Pixels at or above this probability are foreground.
    pub threshold: f64,
}

impl Default for MaskPolygonizer {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl MaskPolygonizer {
    pub fn new(threshold: f64) -> Result<Self, ConfigurationError> {
        check_unit_interval("segmentation threshold", threshold)?;
        Ok(Self { threshold })
    }

    /// Band 1 as a binary image. NaN never qualifies.
    pub fn binarize(&self, mask: &ProbabilityMask) -> GrayImage {
        let band = mask.band(0);
        let threshold = self.threshold as f32;
        GrayImage::from_fn(mask.width, mask.height, |x, y| {
            let value = band[y as usize * mask.width as usize + x as usize];
            Luma([if value >= threshold { 255 } else { 0 }])
        })
    }

    /// Vectorize one mask: trace, dissolve, explode.
    pub fn polygonize(&self, mask: &ProbabilityMask, label: &str, provenance: Option<&str>) -> Vec<VectorFeature> {
        let binary = self.binarize(mask);
        let polygons = find_contours(&binary)
            .iter()
            .map(|region| region.to_map(&mask.transform))
            .collect::<Vec<_>>();

        dissolve(polygons, MergeRule::SharedBoundary)
            .into_iter()
            .map(|geometry| VectorFeature {
                geometry,
                label: label.to_string(),
                score: None,
                provenance: provenance.map(str::to_string),
            })
            .collect()
    }

    /// Read a probability GeoTIFF and vectorize it.
    pub fn polygonize_file(&self, path: &Path, label: &str, keep_provenance: bool) -> anyhow::Result<TileFeatures> {
        let mask = read_geotiff(path)?.into_probability_mask()?;
        let provenance = keep_provenance.then(|| provenance_path(path));
        let features = self.polygonize(&mask, label, provenance.as_deref());
        Ok(TileFeatures {
            crs: mask.crs,
            source: path.to_path_buf(),
            features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Crs, GeoTransform};
    use geo::Area;

    fn mask(values: &[&[f32]]) -> ProbabilityMask {
        let height = values.len() as u32;
        let width = values[0].len() as u32;
        let data = values.iter().flat_map(|row| row.iter().copied()).collect();
        ProbabilityMask::new(width, height, data, GeoTransform::north_up(100.0, 200.0, 2.0), Crs::from_epsg(3794))
            .unwrap()
    }

    #[test]
    fn threshold_is_inclusive_and_nan_is_background() {
        let m = mask(&[&[0.5, 0.49, f32::NAN]]);
        let binary = MaskPolygonizer::default().binarize(&m);
        assert_eq!(binary.get_pixel(0, 0)[0], 255);
        assert_eq!(binary.get_pixel(1, 0)[0], 0);
        assert_eq!(binary.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn polygons_are_in_map_units() {
        let m = mask(&[&[0.9, 0.9], &[0.9, 0.0]]);
        let features = MaskPolygonizer::default().polygonize(&m, "barrow", Some("a/b/c.tif"));
        assert_eq!(features.len(), 1);
        // three 2 m pixels
        assert!((features[0].geometry.unsigned_area() - 12.0).abs() < 1e-9);
        assert_eq!(features[0].provenance.as_deref(), Some("a/b/c.tif"));
        assert_eq!(features[0].score, None);
    }

    #[test]
    fn empty_mask_gives_no_features() {
        let m = mask(&[&[0.1, 0.2], &[0.3, 0.4]]);
        assert!(MaskPolygonizer::default().polygonize(&m, "barrow", None).is_empty());
    }
}
