use std::path::{Path, PathBuf};

use adaf::models::{Crs, DetectionKind, GeoTransform, ProbabilityMask, RawDetection, Tile, TileImage, VectorFeature};
use adaf::raster::write_geotiff;
use adaf::{Prediction, Predictor};
use geo::{Polygon, Rect, coord};

pub const TEST_EPSG: u32 = 3794;
pub const TEST_ORIGIN: (f64, f64) = (500000.0, 6000000.0);

/// Writes a single-band GeoTIFF whose pixel (col, row) holds `value(col, row)`.
pub fn write_raster(
    path: &Path,
    width: u32,
    height: u32,
    resolution: f64,
    nodata: Option<f64>,
    value: impl Fn(u32, u32) -> f32,
) -> PathBuf {
    let samples: Vec<f32> = (0..height)
        .flat_map(|row| (0..width).map(move |col| (row, col)))
        .map(|(row, col)| value(col, row))
        .collect();
    let transform = GeoTransform::north_up(TEST_ORIGIN.0, TEST_ORIGIN.1, resolution);
    write_geotiff(path, width, height, &samples, &transform, Some(Crs::from_epsg(TEST_EPSG)), nodata)
        .expect("Failed to write test raster");
    path.to_path_buf()
}

/// Detection in the test CRS on a tile anchored at `TEST_ORIGIN` with 0.5 m pixels.
pub fn detection(x0: f64, y0: f64, x1: f64, y1: f64, label: &str, score: f64) -> RawDetection {
    RawDetection {
        x0,
        y0,
        x1,
        y1,
        label: label.to_string(),
        score,
        epsg: TEST_EPSG,
        resolution: 0.5,
        x_min: TEST_ORIGIN.0,
        y_max: TEST_ORIGIN.1,
    }
}

/// Writes one prediction text file, one record per line.
pub fn write_detections(dir: &Path, name: &str, detections: &[RawDetection]) -> PathBuf {
    std::fs::create_dir_all(dir).expect("Failed to create prediction dir");
    let path = dir.join(name);
    let text: String = detections.iter().map(|d| format!("{}\n", d.to_record())).collect();
    std::fs::write(&path, text).expect("Failed to write prediction file");
    path
}

/// Probability mask from rows of values, 1 m pixels, top-left at `TEST_ORIGIN`.
pub fn mask_from_rows(rows: &[&[f32]]) -> ProbabilityMask {
    let height = rows.len() as u32;
    let width = rows[0].len() as u32;
    let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
    ProbabilityMask::new(
        width,
        height,
        data,
        GeoTransform::north_up(TEST_ORIGIN.0, TEST_ORIGIN.1, 1.0),
        Crs::from_epsg(TEST_EPSG),
    )
    .expect("Invalid test mask")
}

pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
    Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }).to_polygon()
}

pub fn feature(geometry: Polygon<f64>, label: &str, score: Option<f64>) -> VectorFeature {
    VectorFeature {
        geometry,
        label: label.to_string(),
        score,
        provenance: None,
    }
}

/// Object detector that finds one box in the top-left quarter of every tile.
pub struct BoxPredictor {
    pub label: String,
    pub score: f64,
}

impl Predictor for BoxPredictor {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::ObjectDetection
    }

    fn predict(&self, tile: &Tile, image: &TileImage) -> anyhow::Result<Prediction> {
        let quarter = image.width as f64 / 4.0;
        Ok(Prediction::Detections(vec![RawDetection {
            x0: 0.0,
            y0: 0.0,
            x1: quarter,
            y1: quarter,
            label: self.label.clone(),
            score: self.score,
            epsg: tile.crs.map(|c| c.epsg).unwrap_or(TEST_EPSG),
            resolution: tile.resolution(),
            x_min: tile.x_min(),
            y_max: tile.y_max(),
        }]))
    }
}

/// Segmentation model that marks every pixel at or above `cutoff` as certain.
pub struct ThresholdPredictor {
    pub label: String,
    pub cutoff: f32,
}

impl Predictor for ThresholdPredictor {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::Segmentation
    }

    fn predict(&self, tile: &Tile, image: &TileImage) -> anyhow::Result<Prediction> {
        let data = image
            .data
            .iter()
            .take((image.width * image.height) as usize)
            .map(|&v| if v >= self.cutoff { 1.0 } else { 0.0 })
            .collect();
        let crs = tile.crs.unwrap_or(Crs::from_epsg(TEST_EPSG));
        Ok(Prediction::Mask(ProbabilityMask::new(image.width, image.height, data, tile.transform, crs)?))
    }
}

/// Model that fails on the tile with the given index and finds nothing elsewhere.
pub struct FlakyPredictor {
    pub fail_on: usize,
}

impl Predictor for FlakyPredictor {
    fn label(&self) -> &str {
        "flaky"
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::ObjectDetection
    }

    fn predict(&self, tile: &Tile, _image: &TileImage) -> anyhow::Result<Prediction> {
        if tile.index == self.fail_on {
            anyhow::bail!("out of GPU memory");
        }
        Ok(Prediction::Detections(Vec::new()))
    }
}

/// Model that panics on the tile with the given index and finds nothing elsewhere.
pub struct PanickingPredictor {
    pub panic_on: usize,
}

impl Predictor for PanickingPredictor {
    fn label(&self) -> &str {
        "fragile"
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::ObjectDetection
    }

    fn predict(&self, tile: &Tile, _image: &TileImage) -> anyhow::Result<Prediction> {
        if tile.index == self.panic_on {
            panic!("index out of bounds in model backend");
        }
        Ok(Prediction::Detections(Vec::new()))
    }
}
