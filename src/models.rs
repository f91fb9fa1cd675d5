use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use geo::{BoundingRect, Coord, Polygon, Rect, coord};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs {
    pub epsg: u32,
}

impl Crs {
    pub fn from_epsg(epsg: u32) -> Self {
        Self { epsg }
    }

    /// Rough split of the EPSG registry: 4000-4999 are geographic 2D systems.
    pub fn is_geographic(&self) -> bool {
        (4000..5000).contains(&self.epsg)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

/// Which kind of model produced the predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionKind {
    ObjectDetection,
    Segmentation,
}

impl DetectionKind {
    /// Fixed name of the vector file written for this kind.
    pub fn output_file_name(&self) -> &'static str {
        match self {
            DetectionKind::ObjectDetection => "object_detection.gpkg",
            DetectionKind::Segmentation => "semantic_segmentation.gpkg",
        }
    }

    pub fn run_suffix(&self) -> &'static str {
        match self {
            DetectionKind::ObjectDetection => "obj",
            DetectionKind::Segmentation => "seg",
        }
    }

    /// Extensions of the raw prediction files this kind produces.
    pub fn prediction_extensions(&self) -> &'static [&'static str] {
        match self {
            DetectionKind::ObjectDetection => &["txt"],
            DetectionKind::Segmentation => &["tif", "tiff"],
        }
    }
}

impl FromStr for DetectionKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', '_'], " ");
        match normalized.as_str() {
            "object detection" => Ok(DetectionKind::ObjectDetection),
            "segmentation" | "semantic segmentation" => Ok(DetectionKind::Segmentation),
            _ => Err(ConfigurationError::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionKind::ObjectDetection => write!(f, "object detection"),
            DetectionKind::Segmentation => write!(f, "segmentation"),
        }
    }
}

/// Affine pixel-to-map transform in GDAL coefficient order.
///
/// `x = origin_x + col * pixel_width + row * row_rotation`
/// `y = origin_y + col * col_rotation + row * pixel_height`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of size `resolution`.
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self {
            origin_x,
            pixel_width: resolution,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -resolution,
        }
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Map coordinates back to fractional pixel coordinates.
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.col_rotation) / det;
        Some((col, row))
    }

    /// Transform of the window whose top-left pixel is (`col_off`, `row_off`).
    pub fn window(&self, col_off: u32, row_off: u32) -> Self {
        let (origin_x, origin_y) = self.apply(col_off as f64, row_off as f64);
        Self {
            origin_x,
            origin_y,
            ..*self
        }
    }

    pub fn resolution(&self) -> f64 {
        self.pixel_width.abs()
    }

    /// Map-space bounding rectangle of a `width` x `height` pixel block.
    pub fn extent(&self, width: u32, height: u32) -> Rect<f64> {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(width as f64, 0.0),
            self.apply(width as f64, height as f64),
            self.apply(0.0, height as f64),
        ];
        let (mut min, mut max) = (coord! { x: f64::MAX, y: f64::MAX }, coord! { x: f64::MIN, y: f64::MIN });
        for (x, y) in corners {
            min.x = min.x.min(x);
            min.y = min.y.min(y);
            max.x = max.x.max(x);
            max.y = max.y.max(y);
        }
        Rect::new(min, max)
    }
}

/// One cell of the processing grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    /// Sequence index among the retained tiles.
    pub index: usize,
    pub row: u32,
    pub col: u32,
    /// Top-left pixel of the tile in the source raster.
    pub col_off: u32,
    pub row_off: u32,
    pub size_px: u32,
    /// Transform of the tile window (origin = tile's top-left corner).
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
}

impl Tile {
    pub fn extent(&self) -> Rect<f64> {
        self.transform.extent(self.size_px, self.size_px)
    }

    pub fn polygon(&self) -> Polygon<f64> {
        self.extent().to_polygon()
    }

    pub fn resolution(&self) -> f64 {
        self.transform.resolution()
    }

    pub fn x_min(&self) -> f64 {
        self.extent().min().x
    }

    pub fn y_max(&self) -> f64 {
        self.extent().max().y
    }

    /// File stem used for every per-tile artifact.
    pub fn stem(&self) -> String {
        format!("tile_r{:04}_c{:04}", self.row, self.col)
    }
}

/// Pixel values of one tile, band-sequential, handed to the model.
#[derive(Debug, Clone)]
pub struct TileImage {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    pub data: Vec<f32>,
    pub nodata: Option<f64>,
}

/// One object-detection box as emitted by the detection model.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    pub label: String,
    pub score: f64,
    pub epsg: u32,
    pub resolution: f64,
    pub x_min: f64,
    pub y_max: f64,
}

impl RawDetection {
    pub fn crs(&self) -> Crs {
        Crs::from_epsg(self.epsg)
    }

    fn to_map(&self, px: f64, py: f64) -> Coord<f64> {
        coord! {
            x: self.x_min + self.resolution * px,
            y: self.y_max - self.resolution * py,
        }
    }

    /// Box in map coordinates. `Rect::new` normalizes the corners.
    pub fn map_rect(&self) -> Rect<f64> {
        Rect::new(self.to_map(self.x0, self.y0), self.to_map(self.x1, self.y1))
    }

    /// Text record in the detection model's output format.
    pub fn to_record(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.x0,
            self.y0,
            self.x1,
            self.y1,
            self.label,
            self.score,
            self.epsg,
            self.resolution,
            self.x_min,
            self.y_max
        )
    }
}

impl FromStr for RawDetection {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 10 {
            anyhow::bail!("expected 10 fields, found {}: {:?}", fields.len(), line);
        }
        let num = |i: usize| -> anyhow::Result<f64> {
            fields[i]
                .parse::<f64>()
                .map_err(|e| anyhow::anyhow!("field {} ({:?}): {}", i + 1, fields[i], e))
        };
        // EPSG codes are written as floats by some exporters ("32633.0")
        let epsg = num(6)?;
        if epsg.fract() != 0.0 || epsg <= 0.0 {
            anyhow::bail!("invalid EPSG code {:?}", fields[6]);
        }
        Ok(Self {
            x0: num(0)?,
            y0: num(1)?,
            x1: num(2)?,
            y1: num(3)?,
            label: fields[4].to_string(),
            score: num(5)?,
            epsg: epsg as u32,
            resolution: num(7)?,
            x_min: num(8)?,
            y_max: num(9)?,
        })
    }
}

/// Per-pixel probabilities of one label over one tile.
#[derive(Debug, Clone)]
pub struct ProbabilityMask {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    /// Band-sequential samples, `bands * width * height` long.
    pub data: Vec<f32>,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl ProbabilityMask {
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<f32>,
        transform: GeoTransform,
        crs: Crs,
    ) -> anyhow::Result<Self> {
        let plane = width as usize * height as usize;
        if plane == 0 || data.len() % plane != 0 {
            anyhow::bail!(
                "mask data length {} does not fit a {}x{} raster",
                data.len(),
                width,
                height
            );
        }
        Ok(Self {
            width,
            height,
            bands: data.len() / plane,
            data,
            transform,
            crs,
        })
    }

    pub fn band(&self, band: usize) -> &[f32] {
        let plane = self.width as usize * self.height as usize;
        &self.data[band * plane..(band + 1) * plane]
    }
}

/// A single-part polygon with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    pub geometry: Polygon<f64>,
    pub label: String,
    /// Detection confidence; object detection only.
    pub score: Option<f64>,
    pub provenance: Option<String>,
}

/// Output of one prediction file.
#[derive(Debug, Clone)]
pub struct TileFeatures {
    pub crs: Crs,
    pub source: PathBuf,
    pub features: Vec<VectorFeature>,
}

/// Features sharing one CRS.
#[derive(Debug, Clone, Default)]
pub struct FeatureCollection {
    crs: Option<Crs>,
    features: Vec<VectorFeature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crs(crs: Crs) -> Self {
        Self {
            crs: Some(crs),
            features: Vec::new(),
        }
    }

    pub fn crs(&self) -> Option<Crs> {
        self.crs
    }

    /// Fix the collection CRS on first use and reject any later mismatch.
    pub fn check_crs(&mut self, crs: Crs) -> Result<(), ConfigurationError> {
        match self.crs {
            None => {
                self.crs = Some(crs);
                Ok(())
            }
            Some(expected) if expected == crs => Ok(()),
            Some(expected) => Err(ConfigurationError::CrsMismatch {
                expected,
                found: crs,
            }),
        }
    }

    pub fn push(&mut self, crs: Crs, feature: VectorFeature) -> Result<(), ConfigurationError> {
        self.check_crs(crs)?;
        self.features.push(feature);
        Ok(())
    }

    pub fn extend(
        &mut self,
        crs: Crs,
        features: impl IntoIterator<Item = VectorFeature>,
    ) -> Result<(), ConfigurationError> {
        self.check_crs(crs)?;
        self.features.extend(features);
        Ok(())
    }

    pub fn retain(&mut self, keep: impl FnMut(&VectorFeature) -> bool) {
        self.features.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[VectorFeature] {
        &self.features
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VectorFeature> {
        self.features.iter()
    }

    pub fn into_features(self) -> Vec<VectorFeature> {
        self.features
    }

    /// Replace the members, keeping the CRS.
    pub fn replace_features(&mut self, features: Vec<VectorFeature>) {
        self.features = features;
    }

    /// Whether any member carries a detection score.
    pub fn has_scores(&self) -> bool {
        self.features.iter().any(|f| f.score.is_some())
    }

    pub fn has_provenance(&self) -> bool {
        self.features.iter().any(|f| f.provenance.is_some())
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                    coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
                )
            })
    }
}
