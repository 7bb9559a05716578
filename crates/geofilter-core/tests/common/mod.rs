//! In-memory host shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use geofilter_core::backend::embedded::{EmbeddedStore, SqliteStore};
use geofilter_core::backend::generic::FEATURE_ID;
use geofilter_core::backend::sql::SqlSession;
use geofilter_core::dataset::{
    AttributeValue, DatasetHandle, DatasetId, Feature, FeatureId, FieldType, StorageKind, TableRef,
};
use geofilter_core::error::{FilterError, Result};
use geofilter_core::expression::{AttributeFilter, MATCH_NOTHING};
use geofilter_core::geometry::{Coord, Geometry};
use geofilter_core::host::{
    ConnectionProvider, DatasetRegistry, ExportLayer, ExportOptions, ExportWriter, FeatureSource,
    HostServices, SubsetCommitter,
};

pub type SqlFactory = Box<dyn Fn() -> Box<dyn SqlSession> + Send + Sync>;

#[derive(Default)]
pub struct MemoryHost {
    pub datasets: Mutex<BTreeMap<DatasetId, DatasetHandle>>,
    pub features: Mutex<BTreeMap<DatasetId, Vec<Feature>>>,
    pub selections: Mutex<BTreeMap<DatasetId, Vec<FeatureId>>>,
    pub embedded_path: Mutex<Option<PathBuf>>,
    pub sql: Mutex<Option<SqlFactory>>,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, handle: DatasetHandle, features: Vec<Feature>) {
        self.features.lock().unwrap().insert(handle.id.clone(), features);
        self.datasets.lock().unwrap().insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, id: &str) {
        self.datasets.lock().unwrap().remove(&DatasetId::new(id));
    }

    pub fn select(&self, id: &str, ids: Vec<FeatureId>) {
        self.selections.lock().unwrap().insert(DatasetId::new(id), ids);
    }

    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices {
            registry: self.clone(),
            features: self.clone(),
            connections: self.clone(),
            writer: self.clone(),
        }
    }
}

fn subset_ids(subset: &str) -> Option<Vec<FeatureId>> {
    let list = subset.strip_prefix(FEATURE_ID)?.trim().strip_prefix("IN (")?.strip_suffix(')')?;
    Some(list.split(',').filter_map(|id| id.trim().parse().ok()).collect())
}

impl DatasetRegistry for MemoryHost {
    fn resolve(&self, id: &DatasetId) -> Option<DatasetHandle> {
        self.datasets.lock().unwrap().get(id).cloned()
    }

    fn selection(&self, id: &DatasetId) -> Vec<FeatureId> {
        self.selections.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    fn datasets(&self) -> Vec<DatasetHandle> {
        self.datasets.lock().unwrap().values().cloned().collect()
    }
}

impl FeatureSource for MemoryHost {
    fn features(&self, dataset: &DatasetHandle, subset: Option<&str>) -> Result<Vec<Feature>> {
        let all = self.features.lock().unwrap().get(&dataset.id).cloned().unwrap_or_default();
        let Some(subset) = subset.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(all);
        };
        if subset == MATCH_NOTHING {
            return Ok(Vec::new());
        }
        if let Some(ids) = subset_ids(subset) {
            return Ok(all.into_iter().filter(|f| ids.contains(&f.id)).collect());
        }
        let filter = AttributeFilter::parse(subset)?;
        let mut matched = Vec::new();
        for feature in all {
            if filter.matches(&feature)? {
                matched.push(feature);
            }
        }
        Ok(matched)
    }

    fn features_by_id(&self, dataset: &DatasetHandle, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        Ok(self
            .features(dataset, None)?
            .into_iter()
            .filter(|f| ids.contains(&f.id))
            .collect())
    }
}

impl ConnectionProvider for MemoryHost {
    fn sql_driver_available(&self) -> bool {
        self.sql.lock().unwrap().is_some()
    }

    fn open_sql(&self, dataset: &DatasetHandle) -> Result<Box<dyn SqlSession>> {
        match self.sql.lock().unwrap().as_ref() {
            Some(factory) => Ok(factory()),
            None => Err(FilterError::Connection {
                dataset: dataset.id.clone(),
                reason: "no database driver".to_string(),
            }),
        }
    }

    fn open_embedded(&self, dataset: &DatasetHandle) -> Result<Box<dyn EmbeddedStore>> {
        let path = self.embedded_path.lock().unwrap().clone();
        let path = path.ok_or_else(|| FilterError::Connection {
            dataset: dataset.id.clone(),
            reason: "no database file".to_string(),
        })?;
        let store = SqliteStore::open(&path).map_err(|e| FilterError::Connection {
            dataset: dataset.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(store))
    }
}

impl ExportWriter for MemoryHost {
    fn write_layer(&self, layer: &ExportLayer, _options: &ExportOptions, path: &Path) -> Result<PathBuf> {
        let ids: Vec<FeatureId> = layer.features.iter().map(|f| f.id).collect();
        std::fs::write(path, serde_json::to_string(&ids)?)?;
        Ok(path.to_path_buf())
    }

    fn write_style(&self, _dataset: &DatasetHandle, _path: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn archive(&self, _files: &[PathBuf], archive: &Path) -> Result<PathBuf> {
        Ok(archive.to_path_buf())
    }
}

/// Records every commit and keeps the visible subsets
#[derive(Clone, Default)]
pub struct Commits(pub Arc<Mutex<Vec<(DatasetId, String)>>>);

impl Commits {
    pub fn last(&self, dataset: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == dataset)
            .map(|(_, subset)| subset.clone())
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl SubsetCommitter for Commits {
    fn commit_subset(&mut self, id: &DatasetId, expression: &str) -> Result<()> {
        self.0.lock().unwrap().push((id.clone(), expression.to_string()));
        Ok(())
    }
}

/// Ten point features with `population = 25 * id`
pub fn towns_features() -> Vec<Feature> {
    (1..=10)
        .map(|id| {
            Feature::new(id, Some(Geometry::Point(Coord::new(id as f64, 0.0))))
                .with_attribute("population", AttributeValue::Integer(id * 25))
        })
        .collect()
}

pub fn generic_towns(id: &str) -> DatasetHandle {
    DatasetHandle::new(id, StorageKind::Generic)
        .with_geometry_column("geom")
        .with_primary_key("fid")
        .with_field("population", FieldType::Integer)
        .with_feature_count(10)
}

pub fn embedded_towns() -> DatasetHandle {
    DatasetHandle::new("towns", StorageKind::Embedded)
        .with_table(TableRef::new("towns"))
        .with_geometry_column("geom")
        .with_primary_key("fid")
        .with_field("population", FieldType::Integer)
        .with_feature_count(10)
}

/// SQLite file with the ten towns
pub fn create_towns_db(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE towns (fid INTEGER PRIMARY KEY, geom TEXT, population INTEGER);")
        .unwrap();
    for fid in 1..=10i64 {
        conn.execute(
            "INSERT INTO towns VALUES (?1, ?2, ?3)",
            rusqlite::params![fid, format!("POINT ({} 0)", fid), fid * 25],
        )
        .unwrap();
    }
}

pub fn table_names(path: &Path) -> Vec<String> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap();
    names
}
