use std::path::{Path, PathBuf};

use geo::{Area, Geometry, MultiPolygon};
use serde::Serialize;

use crate::core::gpkg::{self, Field, FieldType, FieldValue, GeometryType, Layer, LayerFeature};
use crate::core::workspace::ScratchSpace;
use crate::detection::contours::find_contours;
use crate::detection::shapes::{MergeRule, dissolve, interiors_overlap};
use crate::error::ConfigurationError;
use crate::models::{Crs, Tile};
use crate::pipeline::PipelineContext;
use crate::raster::{GeoRaster, read_geotiff};

pub const DEFAULT_TILE_SIZE: u32 = 1024;
const MIN_TILE_SIZE: u32 = 32;

/// A grid cell before filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub tile: Tile,
    pub overlaps_valid: bool,
}

/// Tiles of one raster that touch valid data.
#[derive(Debug, Clone, Serialize)]
pub struct TileGrid {
    pub tiles: Vec<Tile>,
    /// Cells in the full bounding grid before filtering
    pub candidates: usize,
    pub tile_size: u32,
    pub crs: Option<Crs>,
    /// Area of the valid-data polygon in map units squared
    pub valid_area: f64,
}

impl TileGrid {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Lays a tile grid over the valid-data extent of a raster.
#[derive(Debug, Clone)]
pub struct GridBuilder {
    tile_size: u32,
    scratch_parent: Option<PathBuf>,
}

impl GridBuilder {
    pub fn new(tile_size: u32) -> Result<Self, ConfigurationError> {
        if tile_size < MIN_TILE_SIZE || !tile_size.is_power_of_two() {
            return Err(ConfigurationError::InvalidTileSize(tile_size));
        }
        Ok(Self {
            tile_size,
            scratch_parent: None,
        })
    }

    /// Put scratch artifacts under `parent` instead of the system temp dir
    pub fn with_scratch_dir(mut self, parent: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(parent.into());
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Valid pixels of band 1 traced into map-space polygons.
    pub fn valid_data_outline(raster: &GeoRaster) -> MultiPolygon<f64> {
        let transform = raster.header.transform;
        let polygons = find_contours(&raster.valid_mask())
            .iter()
            .map(|region| region.to_map(&transform))
            .collect::<Vec<_>>();
        MultiPolygon::new(dissolve(polygons, MergeRule::SharedBoundary))
    }

    /// Every cell of the `ceil(w/size) x ceil(h/size)` grid anchored at the
    /// raster origin, row-major. Edge cells extend past the raster.
    pub fn bounding_grid(&self, raster: &GeoRaster) -> Vec<Tile> {
        let header = &raster.header;
        let rows = header.height.div_ceil(self.tile_size);
        let cols = header.width.div_ceil(self.tile_size);
        let mut tiles = Vec::with_capacity(rows as usize * cols as usize);
        for row in 0..rows {
            for col in 0..cols {
                let (col_off, row_off) = (col * self.tile_size, row * self.tile_size);
                tiles.push(Tile {
                    index: tiles.len(),
                    row,
                    col,
                    col_off,
                    row_off,
                    size_px: self.tile_size,
                    transform: header.transform.window(col_off, row_off),
                    crs: header.crs,
                });
            }
        }
        tiles
    }

    /// Tag each cell by whether its interior shares area with `outline`.
    pub fn tag_cells(tiles: Vec<Tile>, outline: &MultiPolygon<f64>) -> Vec<GridCell> {
        tiles
            .into_iter()
            .map(|tile| {
                let polygon = tile.polygon();
                let overlaps_valid = outline.0.iter().any(|part| interiors_overlap(&polygon, part));
                GridCell { tile, overlaps_valid }
            })
            .collect()
    }

    /// Build the grid for an in-memory raster.
    pub async fn build(&self, raster: &GeoRaster, stem: &str, context: &PipelineContext) -> anyhow::Result<TileGrid> {
        let _stage = context.stage("grid");
        let outline = Self::valid_data_outline(raster);
        let candidates = self.bounding_grid(raster);
        let candidate_count = candidates.len();
        let cells = Self::tag_cells(candidates, &outline);

        let scratch = match &self.scratch_parent {
            Some(parent) => ScratchSpace::new_in(parent, "adaf_grid")?,
            None => ScratchSpace::new("adaf_grid")?,
        };
        let written = self.write_artifacts(&scratch, stem, raster.header.crs, &outline, &cells).await;
        let closed = scratch.close();
        written?;
        closed?;

        let tiles: Vec<Tile> = cells
            .into_iter()
            .filter(|cell| cell.overlaps_valid)
            .enumerate()
            .map(|(index, cell)| Tile { index, ..cell.tile })
            .collect();

        let grid = TileGrid {
            candidates: candidate_count,
            tile_size: self.tile_size,
            crs: raster.header.crs,
            valid_area: outline.unsigned_area(),
            tiles,
        };
        tracing::info!(
            parent: context.span(),
            tiles = grid.tiles.len(),
            candidates = grid.candidates,
            tile_size = self.tile_size,
            "tile grid built"
        );
        Ok(grid)
    }

    /// Read the raster at `path` and build its grid.
    pub async fn build_from_path(&self, path: &Path, context: &PipelineContext) -> anyhow::Result<(GeoRaster, TileGrid)> {
        let owned = path.to_path_buf();
        let raster = tokio::task::spawn_blocking(move || read_geotiff(&owned)).await??;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("raster").to_string();
        let grid = self.build(&raster, &stem, context).await?;
        Ok((raster, grid))
    }

    /// Valid-data outline and tagged reference grid, as GeoPackages
    async fn write_artifacts(
        &self,
        scratch: &ScratchSpace,
        stem: &str,
        crs: Option<Crs>,
        outline: &MultiPolygon<f64>,
        cells: &[GridCell],
    ) -> anyhow::Result<()> {
        let mut valid = Layer::new("valid_data", crs, GeometryType::MultiPolygon, Vec::new());
        if !outline.0.is_empty() {
            valid.features.push(LayerFeature {
                geometry: Geometry::MultiPolygon(outline.clone()),
                values: Vec::new(),
            });
        }
        gpkg::write_layer(&scratch.join(format!("{}_validDataMask.gpkg", stem)), &valid).await?;

        let fields = vec![
            Field::new("row", FieldType::Integer).required(),
            Field::new("col", FieldType::Integer).required(),
            Field::new("overlaps_valid", FieldType::Integer).required(),
        ];
        let mut grid = Layer::new("refgrid", crs, GeometryType::Polygon, fields);
        grid.features = cells
            .iter()
            .map(|cell| LayerFeature {
                geometry: Geometry::Polygon(cell.tile.polygon()),
                values: vec![
                    FieldValue::Integer(cell.tile.row as i64),
                    FieldValue::Integer(cell.tile.col as i64),
                    FieldValue::Integer(cell.overlaps_valid as i64),
                ],
            })
            .collect();
        gpkg::write_layer(&scratch.join(format!("{}_refgrid.gpkg", stem)), &grid).await?;
        Ok(())
    }
}
