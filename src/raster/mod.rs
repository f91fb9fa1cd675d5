//! GeoTIFF access and the VRT mosaic index.

mod geotiff;
mod vrt;

use image::{GrayImage, Luma};

use crate::models::{Crs, GeoTransform, ProbabilityMask, TileImage};

pub use geotiff::{read_geotiff, read_header, write_geotiff};
pub use vrt::build_vrt;

/// Size and georeferencing of a raster file.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
}

/// A fully decoded raster, band-sequential.
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub header: RasterHeader,
    pub bands: usize,
    pub data: Vec<f32>,
}

impl GeoRaster {
    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn band(&self, band: usize) -> &[f32] {
        let plane = self.width() as usize * self.height() as usize;
        &self.data[band * plane..(band + 1) * plane]
    }

    fn is_valid(&self, value: f32) -> bool {
        if value.is_nan() {
            return false;
        }
        match self.header.nodata {
            // Compared in the band's own precision
            Some(nodata) if !nodata.is_nan() => value != nodata as f32,
            _ => true,
        }
    }

    /// Band-1 validity as a binary image (255 = data, 0 = nodata).
    pub fn valid_mask(&self) -> GrayImage {
        let band = self.band(0);
        let width = self.width();
        GrayImage::from_fn(width, self.height(), |x, y| {
            let value = band[y as usize * width as usize + x as usize];
            Luma([if self.is_valid(value) { 255 } else { 0 }])
        })
    }

    /// Cut a square window out of every band. Pixels past the raster edge are
    /// filled with nodata (NaN when the raster declares none).
    pub fn window(&self, col_off: u32, row_off: u32, size: u32) -> TileImage {
        let fill = self.header.nodata.unwrap_or(f64::NAN) as f32;
        let plane = size as usize * size as usize;
        let mut data = vec![fill; plane * self.bands];
        for b in 0..self.bands {
            let src = self.band(b);
            for row in 0..size {
                let src_row = row_off + row;
                if src_row >= self.height() {
                    break;
                }
                for col in 0..size {
                    let src_col = col_off + col;
                    if src_col >= self.width() {
                        break;
                    }
                    data[b * plane + row as usize * size as usize + col as usize] =
                        src[src_row as usize * self.width() as usize + src_col as usize];
                }
            }
        }
        TileImage {
            width: size,
            height: size,
            bands: self.bands,
            data,
            nodata: self.header.nodata,
        }
    }

    /// Interpret this raster as a probability mask. A missing CRS is an error
    /// because every output feature has to be georeferenced.
    pub fn into_probability_mask(self) -> anyhow::Result<ProbabilityMask> {
        let crs = self
            .header
            .crs
            .ok_or_else(|| anyhow::anyhow!("probability raster carries no EPSG code"))?;
        ProbabilityMask::new(self.header.width, self.header.height, self.data, self.header.transform, crs)
    }
}
