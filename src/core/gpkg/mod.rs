//! Single-file GeoPackage output.

mod state;
pub mod wkb;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use geo::{BoundingRect, Geometry, Rect, coord};

use crate::models::{Crs, DetectionKind, FeatureCollection};

use state::GeoPackage;

/// Geometry type of a feature table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryType {
    Polygon,
    MultiPolygon,
}

impl GeometryType {
    fn sql_name(&self) -> &'static str {
        match self {
            GeometryType::Polygon => "POLYGON",
            GeometryType::MultiPolygon => "MULTIPOLYGON",
        }
    }
}

impl FromStr for GeometryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "POLYGON" => Ok(GeometryType::Polygon),
            "MULTIPOLYGON" => Ok(GeometryType::MultiPolygon),
            other => Err(anyhow::anyhow!("Unsupported geometry type: {}", other)),
        }
    }
}

/// Attribute column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Real,
    Integer,
}

impl FieldType {
    fn sql_name(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Real => "REAL",
            FieldType::Integer => "INTEGER",
        }
    }
}

impl FromStr for FieldType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TEXT" => Ok(FieldType::Text),
            "REAL" | "DOUBLE" | "FLOAT" => Ok(FieldType::Real),
            "INTEGER" | "INT" | "MEDIUMINT" | "SMALLINT" | "TINYINT" | "BOOLEAN" => Ok(FieldType::Integer),
            other => Err(anyhow::anyhow!("Unsupported field type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Attribute values
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Real(f64),
    Integer(i64),
    Null,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            FieldValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map(FieldValue::Real).unwrap_or(FieldValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerFeature {
    pub geometry: Geometry<f64>,
    /// One value per field of the layer, in field order
    pub values: Vec<FieldValue>,
}

/// One feature table with its schema and rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub crs: Option<Crs>,
    pub geometry_type: GeometryType,
    pub fields: Vec<Field>,
    pub features: Vec<LayerFeature>,
}

impl Layer {
    pub fn new(name: impl Into<String>, crs: Option<Crs>, geometry_type: GeometryType, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            crs,
            geometry_type,
            fields,
            features: Vec::new(),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Value of column `name` in feature `feature`
    pub fn value(&self, feature: usize, name: &str) -> Option<&FieldValue> {
        let index = self.field_index(name)?;
        self.features.get(feature)?.values.get(index)
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

/// Write `layers` into a new GeoPackage at `path`, replacing any existing file.
pub async fn write_layers(path: &Path, layers: &[Layer]) -> anyhow::Result<()> {
    let package = GeoPackage::create(path).await?;
    let mut result = Ok(());
    for layer in layers {
        result = package.write_layer(layer).await;
        if result.is_err() {
            break;
        }
    }
    package.close().await;
    result
}

pub async fn write_layer(path: &Path, layer: &Layer) -> anyhow::Result<()> {
    write_layers(path, std::slice::from_ref(layer)).await
}

pub async fn read_layer(path: &Path, name: &str) -> anyhow::Result<Layer> {
    let package = GeoPackage::open(path).await?;
    let layer = package.read_layer(name).await;
    package.close().await;
    layer
}

pub async fn layer_names(path: &Path) -> anyhow::Result<Vec<String>> {
    let package = GeoPackage::open(path).await?;
    let names = package.layer_names().await;
    package.close().await;
    names
}

/// What [`VectorWriter::write`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorOutput {
    Written(PathBuf),
    NoFeatures,
}

/// Writes the final feature collection of a run.
///
/// The layer CRS is registered as `EPSG:<code>` in `gpkg_spatial_ref_sys`.
/// Only EPSG:4326 carries a WKT definition; every other code is stored with
/// the definition `undefined`, so readers that ignore the organization code
/// show such layers without a CRS.
pub struct VectorWriter;

impl VectorWriter {
    /// Layer name: the output file stem.
    pub fn layer_name(kind: DetectionKind) -> &'static str {
        kind.output_file_name().trim_end_matches(".gpkg")
    }

    /// Attribute schema and rows for `collection`. Object detection carries a
    /// score column; `prediction_path` only exists when provenance was kept.
    pub fn to_layer(collection: &FeatureCollection, kind: DetectionKind) -> Layer {
        let with_score = kind == DetectionKind::ObjectDetection;
        let with_provenance = collection.has_provenance();

        let mut fields = vec![Field::new("label", FieldType::Text).required()];
        if with_score {
            fields.push(Field::new("score", FieldType::Real));
        }
        if with_provenance {
            fields.push(Field::new("prediction_path", FieldType::Text));
        }

        let mut layer = Layer::new(Self::layer_name(kind), collection.crs(), GeometryType::Polygon, fields);
        layer.features = collection
            .iter()
            .map(|feature| {
                let mut values = vec![FieldValue::Text(feature.label.clone())];
                if with_score {
                    values.push(feature.score.into());
                }
                if with_provenance {
                    values.push(feature.provenance.clone().into());
                }
                LayerFeature {
                    geometry: Geometry::Polygon(feature.geometry.clone()),
                    values,
                }
            })
            .collect();
        layer
    }

    /// Write `collection` to `<directory>/<kind file name>`. An empty
    /// collection leaves the file system untouched.
    pub async fn write(
        collection: &FeatureCollection,
        directory: &Path,
        kind: DetectionKind,
    ) -> anyhow::Result<VectorOutput> {
        if collection.is_empty() {
            return Ok(VectorOutput::NoFeatures);
        }
        let path = directory.join(kind.output_file_name());
        write_layer(&path, &Self::to_layer(collection, kind)).await?;
        tracing::info!(path = ?path, features = collection.len(), "vector output written");
        Ok(VectorOutput::Written(path))
    }
}
