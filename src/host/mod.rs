//! SQLite-backed host for the command line
//!
//! Every table of the database with a key column is a layer. Geometries are
//! read as WKT, either from text columns or through SpatiaLite's `AsText`
//! when the connection has spatial functions.

mod geojson;
mod layers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde_json::json;

use geofilter_core::backend::embedded::{EmbeddedStore, SqliteStore};
use geofilter_core::backend::sql::SqlSession;
use geofilter_core::dataset::{AttributeValue, DatasetHandle, DatasetId, Feature, FeatureId, FieldType};
use geofilter_core::error::{FilterError, Result};
use geofilter_core::expression::quote_ident;
use geofilter_core::geometry::parse_wkt;
use geofilter_core::host::{ConnectionProvider, DatasetRegistry, FeatureSource, HostServices, SubsetCommitter};
use geofilter_core::store::RecordStore;
use geofilter_core::{bail_expression, map_storage_err, trace_time};

pub use geojson::GeoJsonWriter;
pub use layers::subset_sql;

/// Record key of a committed subset
pub fn subset_key(dataset: &DatasetId) -> String {
    format!("subset/{}", dataset)
}

pub struct SqliteHost {
    path: PathBuf,
    spatial: bool,
    layers: BTreeMap<DatasetId, DatasetHandle>,
}

fn has_spatial_functions(conn: &Connection) -> bool {
    conn.query_row("SELECT spatialite_version()", [], |row| row.get::<_, String>(0))
        .is_ok()
}

impl SqliteHost {
    /// Discover the layers of the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FilterError::invalid_value("database", path.display()));
        }
        let conn = Connection::open(path)?;
        let spatial = has_spatial_functions(&conn);
        let key = format!("sqlite:{}", path.display());
        let layers = layers::discover(&conn, &key, spatial)?
            .into_iter()
            .map(|handle| (handle.id.clone(), handle))
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            spatial,
            layers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer_ids(&self) -> Vec<DatasetId> {
        self.layers.keys().cloned().collect()
    }

    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices {
            registry: self.clone(),
            features: self.clone(),
            connections: self.clone(),
            writer: Arc::new(GeoJsonWriter),
        }
    }

    fn geometry_select(&self, column: Option<&str>) -> String {
        match column {
            Some(column) if self.spatial => format!(
                "CASE WHEN typeof({0}) = 'blob' THEN AsText({0}) ELSE {0} END",
                quote_ident(column)
            ),
            Some(column) => quote_ident(column),
            None => "NULL".to_string(),
        }
    }

    fn query(&self, dataset: &DatasetHandle, filter: Option<String>) -> Result<Vec<Feature>> {
        let start = Instant::now();
        let table = dataset.require_table()?;
        let key = dataset
            .primary_key
            .as_deref()
            .map(quote_ident)
            .unwrap_or_else(|| "rowid".to_string());
        let mut columns = vec![key, self.geometry_select(dataset.geometry_column.as_deref())];
        columns.extend(dataset.fields.iter().map(|f| quote_ident(&f.name)));
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&table.name));
        if let Some(filter) = filter {
            sql.push_str(&format!(" WHERE {}", filter));
        }

        let conn = Connection::open(&self.path).map_err(|e| map_storage_err!(&dataset.id, e))?;
        let mut stmt = conn.prepare(&sql).map_err(|e| map_storage_err!(&dataset.id, e))?;
        let rows = stmt
            .query_map([], |row| {
                let id: FeatureId = row.get(0)?;
                let geometry: Value = row.get(1)?;
                let mut values = Vec::with_capacity(dataset.fields.len());
                for i in 0..dataset.fields.len() {
                    values.push(row.get::<_, Value>(i + 2)?);
                }
                Ok((id, geometry, values))
            })
            .map_err(|e| map_storage_err!(&dataset.id, e))?;

        let mut features = Vec::new();
        for row in rows {
            let (id, geometry, values) = row.map_err(|e| map_storage_err!(&dataset.id, e))?;
            let mut feature = Feature::new(id, read_geometry(&dataset.id, id, geometry));
            for (field, value) in dataset.fields.iter().zip(values) {
                feature = feature.with_attribute(&field.name, attribute(value, field.field_type));
            }
            features.push(feature);
        }
        trace_time!(start, "feature query", dataset = dataset.id.as_str(), rows = features.len());
        Ok(features)
    }
}

fn read_geometry(dataset: &DatasetId, id: FeatureId, value: Value) -> Option<geofilter_core::geometry::Geometry> {
    match value {
        Value::Text(wkt) if !wkt.trim().is_empty() => match parse_wkt(&wkt) {
            Ok(geometry) => Some(geometry),
            Err(e) => {
                tracing::debug!(dataset = %dataset, feature = id, error = %e, "unreadable geometry");
                None
            }
        },
        _ => None,
    }
}

fn attribute(value: Value, field_type: FieldType) -> AttributeValue {
    match (value, field_type) {
        (Value::Integer(v), FieldType::Boolean) => AttributeValue::Bool(v != 0),
        (Value::Integer(v), _) => AttributeValue::Integer(v),
        (Value::Real(v), _) => AttributeValue::Real(v),
        (Value::Text(s), _) => AttributeValue::Text(s),
        (Value::Null, _) | (Value::Blob(_), _) => AttributeValue::Null,
    }
}

impl DatasetRegistry for SqliteHost {
    fn resolve(&self, id: &DatasetId) -> Option<DatasetHandle> {
        self.layers.get(id).cloned()
    }

    /// The command line has no interactive selection
    fn selection(&self, _id: &DatasetId) -> Vec<FeatureId> {
        Vec::new()
    }

    fn datasets(&self) -> Vec<DatasetHandle> {
        self.layers.values().cloned().collect()
    }
}

impl FeatureSource for SqliteHost {
    fn features(&self, dataset: &DatasetHandle, subset: Option<&str>) -> Result<Vec<Feature>> {
        let subset = subset.map(str::trim).filter(|s| !s.is_empty());
        if let Some(subset) = subset {
            if subset.contains(';') {
                bail_expression!("subset of {} is not a single expression", dataset.id);
            }
        }
        self.query(dataset, subset.map(|s| subset_sql(s, dataset)))
    }

    fn features_by_id(&self, dataset: &DatasetHandle, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
        self.query(dataset, Some(subset_sql(&format!("$id IN ({})", list), dataset)))
    }
}

impl ConnectionProvider for SqliteHost {
    fn sql_driver_available(&self) -> bool {
        false
    }

    fn open_sql(&self, dataset: &DatasetHandle) -> Result<Box<dyn SqlSession>> {
        Err(FilterError::Connection {
            dataset: dataset.id.clone(),
            reason: "no database server driver in this build".to_string(),
        })
    }

    fn open_embedded(&self, dataset: &DatasetHandle) -> Result<Box<dyn EmbeddedStore>> {
        let store = SqliteStore::open(&self.path).map_err(|e| FilterError::Connection {
            dataset: dataset.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(store))
    }
}

/// Persists committed subsets next to the layers
pub struct RecordCommitter {
    store: Arc<dyn RecordStore>,
}

impl RecordCommitter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl SubsetCommitter for RecordCommitter {
    fn commit_subset(&mut self, id: &DatasetId, expression: &str) -> Result<()> {
        let record = json!({
            "subset": expression,
            "updated": chrono::Utc::now().to_rfc3339(),
        });
        self.store.put(&subset_key(id), &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geofilter_core::store::MemoryRecordStore;

    fn towns(dir: &Path) -> PathBuf {
        let path = dir.join("towns.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE towns (fid INTEGER PRIMARY KEY, name TEXT, population INTEGER, geom TEXT);
             INSERT INTO towns VALUES (1, 'Ash', 50, 'POINT (1 0)');
             INSERT INTO towns VALUES (2, 'Birch', 150, 'POINT (2 0)');
             INSERT INTO towns VALUES (3, 'Cedar', 250, NULL);",
        )
        .unwrap();
        path
    }

    #[test]
    fn test_features_under_subset() {
        let dir = tempfile::tempdir().unwrap();
        let host = SqliteHost::open(&towns(dir.path())).unwrap();
        let layer = host.resolve(&DatasetId::new("towns")).unwrap();

        let all = host.features(&layer, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[2].geometry.is_none());

        let subset = host.features(&layer, Some("$id IN (2, 3)")).unwrap();
        let ids: Vec<FeatureId> = subset.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(subset[0].attribute("name"), Some(&AttributeValue::Text("Birch".into())));

        let by_id = host.features_by_id(&layer, &[1]).unwrap();
        assert_eq!(by_id.len(), 1);
        assert!(host.features(&layer, Some("1 = 1; DROP TABLE towns")).is_err());
    }

    #[test]
    fn test_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteHost::open(&dir.path().join("none.sqlite")).is_err());
    }

    #[test]
    fn test_committer_records_subset() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let mut committer = RecordCommitter::new(store.clone());
        committer.commit_subset(&DatasetId::new("towns"), "$id IN (1)").unwrap();
        let record = store.get("subset/towns").unwrap().unwrap();
        assert_eq!(record["subset"], "$id IN (1)");
    }
}
