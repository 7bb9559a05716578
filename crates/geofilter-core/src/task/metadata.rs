//! Layer metadata task: checks a dataset can be filtered and how

use std::sync::Arc;

use serde::Serialize;

use super::{Task, TaskContext, TaskKind, TaskOutput};
use crate::backend::{choose_backend, BackendSelection};
use crate::dataset::{DatasetHandle, DatasetId, FieldType};
use crate::error::{FilterError, Result};
use crate::host::{ConnectionProvider, DatasetRegistry};

/// Field names tried, in order, when a dataset declares no primary key
pub const PRIMARY_KEY_CANDIDATES: [&str; 6] = ["fid", "id", "gid", "ogc_fid", "objectid", "pk"];

#[derive(Debug, Clone, Serialize)]
pub struct MetadataReport {
    pub dataset: DatasetId,
    pub name: String,
    pub feature_count: u64,
    pub crs: String,
    /// Required properties the dataset lacks
    pub missing: Vec<String>,
    /// Field usable as primary key when none is declared
    pub primary_key_candidate: Option<String>,
    pub recommended: BackendSelection,
    pub warnings: Vec<String>,
}

impl MetadataReport {
    pub fn is_filterable(&self) -> bool {
        self.missing.is_empty() || (self.missing == ["primary key"] && self.primary_key_candidate.is_some())
    }
}

/// First integer-like field named like a primary key
pub fn detect_primary_key(dataset: &DatasetHandle) -> Option<String> {
    PRIMARY_KEY_CANDIDATES.iter().find_map(|candidate| {
        dataset
            .fields
            .iter()
            .find(|f| {
                f.name.eq_ignore_ascii_case(candidate)
                    && matches!(f.field_type, FieldType::Integer | FieldType::Other)
            })
            .map(|f| f.name.clone())
    })
}

pub struct LayerMetadataTask {
    dataset: DatasetId,
    registry: Arc<dyn DatasetRegistry>,
    connections: Arc<dyn ConnectionProvider>,
}

impl LayerMetadataTask {
    pub fn new(
        dataset: DatasetId,
        registry: Arc<dyn DatasetRegistry>,
        connections: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            dataset,
            registry,
            connections,
        }
    }

    fn inspect(&self, ctx: &TaskContext) -> Result<MetadataReport> {
        let dataset = self
            .registry
            .resolve(&self.dataset)
            .ok_or_else(|| FilterError::DatasetUnavailable(self.dataset.clone()))?;
        ctx.check_canceled()?;

        let mut missing = Vec::new();
        let mut warnings = Vec::new();
        if dataset.geometry_column.as_deref().is_none_or(str::is_empty) {
            missing.push("geometry column".to_string());
        }
        let primary_key_candidate = if dataset.primary_key.as_deref().is_none_or(str::is_empty) {
            missing.push("primary key".to_string());
            let candidate = detect_primary_key(&dataset);
            match &candidate {
                Some(name) => warnings.push(format!("no primary key declared; '{}' can serve as one", name)),
                None => warnings.push("no primary key declared and no candidate field found".to_string()),
            }
            candidate
        } else {
            None
        };
        if dataset.table.is_none() && dataset.storage != crate::dataset::StorageKind::Generic {
            missing.push("table".to_string());
        }
        if dataset.crs.srid().is_none() {
            warnings.push(format!("CRS {} has no numeric SRID; reprojection is unavailable", dataset.crs));
        }

        let recommended = choose_backend(&dataset, None, self.connections.sql_driver_available());
        if recommended.fallback {
            warnings.push(recommended.reason.clone());
        }
        ctx.set_progress(90);

        Ok(MetadataReport {
            dataset: dataset.id.clone(),
            name: dataset.name.clone(),
            feature_count: dataset.feature_count,
            crs: dataset.crs.to_string(),
            missing,
            primary_key_candidate,
            recommended,
            warnings,
        })
    }
}

impl Task for LayerMetadataTask {
    fn kind(&self) -> TaskKind {
        TaskKind::LayerMetadata
    }

    fn describe(&self) -> String {
        format!("inspect {}", self.dataset)
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput> {
        self.inspect(ctx).map(TaskOutput::Metadata)
    }
}
