use std::path::{Path, PathBuf};

use anyhow::Context;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};

use crate::models::Crs;

use super::{Field, FieldType, FieldValue, GeometryType, Layer, LayerFeature, wkb};

/// "GPKG" as a big-endian integer
const APPLICATION_ID: i64 = 0x4750_4B47;
const USER_VERSION: i64 = 10300;
const UNDEFINED_CARTESIAN: i32 = -1;

const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

const SCHEMA: &[&str] = &[
    "CREATE TABLE gpkg_spatial_ref_sys (
        srs_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL PRIMARY KEY,
        organization TEXT NOT NULL,
        organization_coordsys_id INTEGER NOT NULL,
        definition TEXT NOT NULL,
        description TEXT
    )",
    "CREATE TABLE gpkg_contents (
        table_name TEXT NOT NULL PRIMARY KEY,
        data_type TEXT NOT NULL,
        identifier TEXT UNIQUE,
        description TEXT DEFAULT '',
        last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        min_x DOUBLE,
        min_y DOUBLE,
        max_x DOUBLE,
        max_y DOUBLE,
        srs_id INTEGER,
        CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
    )",
    "CREATE TABLE gpkg_geometry_columns (
        table_name TEXT NOT NULL,
        column_name TEXT NOT NULL,
        geometry_type_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL,
        z TINYINT NOT NULL,
        m TINYINT NOT NULL,
        CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
        CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
        CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
    )",
];

pub(super) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An open GeoPackage file.
pub(super) struct GeoPackage {
    path: PathBuf,
    pool: SqlitePool,
}

impl std::fmt::Debug for GeoPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoPackage").field("path", &self.path).finish()
    }
}

impl GeoPackage {
    async fn connect(options: SqliteConnectOptions) -> anyhow::Result<SqlitePool> {
        Ok(SqlitePoolOptions::new().max_connections(1).connect_with(options).await?)
    }

    /// Create an empty GeoPackage at `path`, replacing any existing file.
    pub(super) async fn create(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to replace existing GeoPackage {:?}", path))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = Self::connect(options)
            .await
            .with_context(|| format!("Failed to create GeoPackage {:?}", path))?;
        let package = Self {
            path: path.to_path_buf(),
            pool,
        };
        package.init_schema().await?;
        Ok(package)
    }

    pub(super) async fn open(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = Self::connect(options)
            .await
            .with_context(|| format!("Failed to open GeoPackage {:?}", path))?;
        let package = Self {
            path: path.to_path_buf(),
            pool,
        };
        let application_id: i64 = sqlx::query_scalar("PRAGMA application_id").fetch_one(&package.pool).await?;
        if application_id != APPLICATION_ID {
            anyhow::bail!("{:?} is not a GeoPackage (application_id {:#x})", path, application_id);
        }
        Ok(package)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("PRAGMA application_id = {}", APPLICATION_ID))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("PRAGMA user_version = {}", USER_VERSION))
            .execute(&mut *tx)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        let defaults: [(&str, i32, &str, i32, &str, &str); 3] = [
            ("Undefined cartesian SRS", -1, "NONE", -1, "undefined", "undefined cartesian coordinate reference system"),
            ("Undefined geographic SRS", 0, "NONE", 0, "undefined", "undefined geographic coordinate reference system"),
            ("WGS 84 geodetic", 4326, "EPSG", 4326, WGS84_WKT, "longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid"),
        ];
        for (name, id, org, org_id, definition, description) in defaults {
            sqlx::query(
                "INSERT INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(id)
            .bind(org)
            .bind(org_id)
            .bind(definition)
            .bind(description)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Make sure `crs` has a row in `gpkg_spatial_ref_sys`, returning its srs_id.
    async fn register_srs(&self, crs: Option<Crs>) -> anyhow::Result<i32> {
        let Some(crs) = crs else {
            return Ok(UNDEFINED_CARTESIAN);
        };
        let srs_id = i32::try_from(crs.epsg).with_context(|| format!("{} does not fit an srs_id", crs))?;
        sqlx::query(
            "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
             (srs_name, srs_id, organization, organization_coordsys_id, definition)
             VALUES (?, ?, 'EPSG', ?, 'undefined')",
        )
        .bind(crs.to_string())
        .bind(srs_id)
        .bind(srs_id)
        .execute(&self.pool)
        .await?;
        Ok(srs_id)
    }

    /// Create the feature table of `layer` and insert every feature.
    pub(super) async fn write_layer(&self, layer: &Layer) -> anyhow::Result<()> {
        let srs_id = self.register_srs(layer.crs).await?;
        let table = quote_ident(&layer.name);

        let mut columns = vec![
            "fid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string(),
            format!("geom {}", layer.geometry_type.sql_name()),
        ];
        columns.extend(layer.fields.iter().map(|field| {
            format!(
                "{} {}{}",
                quote_ident(&field.name),
                field.kind.sql_name(),
                if field.nullable { "" } else { " NOT NULL" }
            )
        }));

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("CREATE TABLE {} ({})", table, columns.join(", ")))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create layer {:?} in {:?}", layer.name, self.path))?;

        let bounds = layer.bounds();
        sqlx::query(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
             VALUES (?, 'features', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&layer.name)
        .bind(&layer.name)
        .bind(bounds.map(|r| r.min().x))
        .bind(bounds.map(|r| r.min().y))
        .bind(bounds.map(|r| r.max().x))
        .bind(bounds.map(|r| r.max().y))
        .bind(srs_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO gpkg_geometry_columns (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES (?, 'geom', ?, ?, 0, 0)",
        )
        .bind(&layer.name)
        .bind(layer.geometry_type.sql_name())
        .bind(srs_id)
        .execute(&mut *tx)
        .await?;

        let names: Vec<String> = layer.fields.iter().map(|f| quote_ident(&f.name)).collect();
        let placeholders = vec!["?"; layer.fields.len() + 1].join(", ");
        let insert = if names.is_empty() {
            format!("INSERT INTO {} (geom) VALUES (?)", table)
        } else {
            format!("INSERT INTO {} (geom, {}) VALUES ({})", table, names.join(", "), placeholders)
        };

        for (n, feature) in layer.features.iter().enumerate() {
            if feature.values.len() != layer.fields.len() {
                anyhow::bail!(
                    "feature {} of layer {:?} has {} values for {} fields",
                    n,
                    layer.name,
                    feature.values.len(),
                    layer.fields.len()
                );
            }
            let blob = wkb::encode(&feature.geometry, srs_id)?;
            let mut query = sqlx::query(&insert).bind(blob);
            for value in &feature.values {
                query = match value {
                    FieldValue::Text(text) => query.bind(text.clone()),
                    FieldValue::Real(real) => query.bind(*real),
                    FieldValue::Integer(int) => query.bind(*int),
                    FieldValue::Null => query.bind(Option::<String>::None),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit layer {:?} to {:?}", layer.name, self.path))?;
        Ok(())
    }

    /// Read back a feature table written by [`GeoPackage::write_layer`].
    pub(super) async fn read_layer(&self, name: &str) -> anyhow::Result<Layer> {
        let table = quote_ident(name);
        let geometry_row = sqlx::query(
            "SELECT g.geometry_type_name, g.srs_id, s.organization
             FROM gpkg_geometry_columns g JOIN gpkg_spatial_ref_sys s ON g.srs_id = s.srs_id
             WHERE g.table_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("Layer {:?} not found in {:?}", name, self.path))?;
        let geometry_type: GeometryType = geometry_row.try_get::<String, _>(0)?.parse()?;
        let srs_id: i64 = geometry_row.try_get(1)?;
        let organization: String = geometry_row.try_get(2)?;
        let crs = (organization.eq_ignore_ascii_case("EPSG") && srs_id > 0).then(|| Crs::from_epsg(srs_id as u32));

        let mut fields = Vec::new();
        for column in sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?
        {
            let column_name: String = column.try_get("name")?;
            if column_name == "fid" || column_name == "geom" {
                continue;
            }
            let declared: String = column.try_get("type")?;
            let not_null: i64 = column.try_get("notnull")?;
            fields.push(Field {
                name: column_name,
                kind: declared.parse()?,
                nullable: not_null == 0,
            });
        }

        let mut features = Vec::new();
        for row in sqlx::query(&format!("SELECT * FROM {} ORDER BY fid", table))
            .fetch_all(&self.pool)
            .await?
        {
            let blob: Vec<u8> = row.try_get("geom")?;
            let mut values = Vec::with_capacity(fields.len());
            for field in &fields {
                let name = field.name.as_str();
                let value = match field.kind {
                    FieldType::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
                    FieldType::Real => row.try_get::<Option<f64>, _>(name)?.map(FieldValue::Real),
                    FieldType::Integer => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Integer),
                };
                values.push(value.unwrap_or(FieldValue::Null));
            }
            features.push(LayerFeature {
                geometry: wkb::decode(&blob)?,
                values,
            });
        }

        Ok(Layer {
            name: name.to_string(),
            crs,
            geometry_type,
            fields,
            features,
        })
    }

    /// Names of every feature table, in creation order.
    pub(super) async fn layer_names(&self) -> anyhow::Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Release the file handle.
    pub(super) async fn close(self) {
        self.pool.close().await;
    }
}
