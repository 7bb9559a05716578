//! Layer discovery in a SQLite database

use rusqlite::{Connection, OptionalExtension};

use geofilter_core::backend::generic::FEATURE_ID;
use geofilter_core::dataset::{Crs, DatasetHandle, FieldType, StorageKind, TableRef};
use geofilter_core::error::Result;
use geofilter_core::expression::quote_ident;

/// Tables that never hold layers
const METADATA_TABLES: &[&str] = &[
    "geometry_columns",
    "spatial_ref_sys",
    "spatialite_history",
    "views_geometry_columns",
    "virts_geometry_columns",
];

const GEOMETRY_TYPES: &[&str] = &[
    "GEOMETRY",
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
];

const GEOMETRY_NAMES: &[&str] = &["geom", "geometry", "the_geom", "wkt", "wkt_geometry"];

struct Column {
    name: String,
    declared: String,
    pk: bool,
}

fn is_layer_table(name: &str) -> bool {
    !name.starts_with("sqlite_")
        && !name.starts_with('_')
        && !name.starts_with("gpkg_")
        && !name.starts_with("idx_")
        && !METADATA_TABLES.contains(&name.to_ascii_lowercase().as_str())
}

fn field_type(declared: &str) -> FieldType {
    let declared = declared.to_ascii_uppercase();
    if declared.contains("INT") {
        FieldType::Integer
    } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB") {
        FieldType::Real
    } else if declared.contains("BOOL") {
        FieldType::Boolean
    } else if declared.contains("CHAR") || declared.contains("TEXT") || declared.contains("CLOB") {
        FieldType::Text
    } else {
        FieldType::Other
    }
}

fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Column>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok(Column {
            name: row.get(1)?,
            declared: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            pk: row.get::<_, i64>(5)? > 0,
        })
    })?;
    rows.collect()
}

/// Geometry column and SRID registered in `geometry_columns`, if that table exists
fn registered_geometry(conn: &Connection, table: &str) -> rusqlite::Result<Option<(String, i64)>> {
    let has_registry: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'geometry_columns'",
            [],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !has_registry {
        return Ok(None);
    }
    conn.query_row(
        "SELECT f_geometry_column, srid FROM geometry_columns WHERE lower(f_table_name) = lower(?1)",
        [table],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

fn describe(conn: &Connection, table: &str, connection_key: &str, spatial: bool) -> rusqlite::Result<DatasetHandle> {
    let columns = columns(conn, table)?;
    let registered = registered_geometry(conn, table)?;
    let geometry = match &registered {
        Some((column, _)) => Some(column.clone()),
        None => columns
            .iter()
            .find(|c| GEOMETRY_TYPES.contains(&c.declared.to_ascii_uppercase().as_str()))
            .or_else(|| {
                columns
                    .iter()
                    .find(|c| GEOMETRY_NAMES.contains(&c.name.to_ascii_lowercase().as_str()))
            })
            .map(|c| c.name.clone()),
    };
    let keys: Vec<&Column> = columns.iter().filter(|c| c.pk).collect();
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
        row.get(0)
    })?;

    let storage = if spatial {
        StorageKind::Embedded
    } else {
        StorageKind::Generic
    };
    let mut handle = DatasetHandle::new(table, storage)
        .with_table(TableRef::new(table))
        .with_connection(connection_key)
        .with_feature_count(count.max(0) as u64);
    if let Some((_, srid)) = registered.filter(|(_, srid)| *srid > 0) {
        handle = handle.with_crs(Crs::new(format!("EPSG:{}", srid)));
    }
    if let Some(column) = &geometry {
        handle = handle.with_geometry_column(column);
    }
    if let [key] = keys.as_slice() {
        handle = handle.with_primary_key(&key.name);
    }
    for column in &columns {
        if Some(&column.name) != geometry.as_ref() {
            handle = handle.with_field(&column.name, field_type(&column.declared));
        }
    }
    Ok(handle)
}

/// Every layer table of the database
pub fn discover(conn: &Connection, connection_key: &str, spatial: bool) -> Result<Vec<DatasetHandle>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    let mut layers = Vec::new();
    for name in names.iter().filter(|n| is_layer_table(n)) {
        match describe(conn, name, connection_key, spatial) {
            Ok(handle) => layers.push(handle),
            Err(e) => tracing::warn!(table = %name, error = %e, "skipping unreadable table"),
        }
    }
    tracing::debug!(layers = layers.len(), spatial, "layers discovered");
    Ok(layers)
}

/// Host SQL for a subset: the feature id placeholder becomes the key column
pub fn subset_sql(subset: &str, dataset: &DatasetHandle) -> String {
    let key = dataset
        .primary_key
        .as_deref()
        .map(quote_ident)
        .unwrap_or_else(|| "rowid".to_string());
    subset.replace(FEATURE_ID, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE towns (fid INTEGER PRIMARY KEY, name TEXT, population INTEGER, geom POINT);
             CREATE TABLE _geofilter_records (key TEXT PRIMARY KEY, value TEXT, updated TEXT);
             CREATE TABLE notes (body TEXT);
             INSERT INTO towns VALUES (1, 'a', 10, 'POINT (0 0)');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_discover_skips_internal_tables() {
        let layers = discover(&database(), "sqlite:test", false).unwrap();
        let names: Vec<&str> = layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(names, vec!["notes", "towns"]);

        let towns = &layers[1];
        assert_eq!(towns.geometry_column.as_deref(), Some("geom"));
        assert_eq!(towns.primary_key.as_deref(), Some("fid"));
        assert_eq!(towns.feature_count, 1);
        assert_eq!(towns.storage, StorageKind::Generic);
        assert!(towns.has_field("population"));
        assert!(!towns.has_field("geom"));
        assert!(layers[0].primary_key.is_none());
    }

    #[test]
    fn test_subset_sql_uses_key_column() {
        let layers = discover(&database(), "sqlite:test", false).unwrap();
        assert_eq!(subset_sql("$id IN (1, 2)", &layers[1]), "\"fid\" IN (1, 2)");
    }
}
