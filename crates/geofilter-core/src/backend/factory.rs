//! Backend selection
//!
//! The dataset's storage kind decides, unless the request forces a backend.
//! Selection never fails: anything that cannot be honoured degrades to the
//! generic driver and says so in the returned [`BackendSelection`].

use std::sync::Arc;

use serde::Serialize;

use super::embedded::EmbeddedBackend;
use super::generic::GenericBackend;
use super::sql::SqlBackend;
use super::{Backend, BackendKind};
use crate::config::EngineConfig;
use crate::dataset::{DatasetHandle, DatasetId, StorageKind};
use crate::host::{ConnectionProvider, FeatureSource, HostServices};

/// What the backends need from the host
#[derive(Clone)]
pub struct BackendServices {
    pub connections: Arc<dyn ConnectionProvider>,
    pub features: Arc<dyn FeatureSource>,
}

impl From<&HostServices> for BackendServices {
    fn from(host: &HostServices) -> Self {
        Self {
            connections: host.connections.clone(),
            features: host.features.clone(),
        }
    }
}

/// Outcome of backend selection for one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSelection {
    pub dataset: DatasetId,
    pub kind: BackendKind,
    /// The request named a backend
    pub forced: bool,
    /// The preferred backend was unavailable
    pub fallback: bool,
    pub reason: String,
}

impl BackendSelection {
    fn new(dataset: &DatasetHandle, kind: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            dataset: dataset.id.clone(),
            kind,
            forced: false,
            fallback: false,
            reason: reason.into(),
        }
    }
}

/// Whether `kind` can serve `dataset`
fn usable(kind: BackendKind, dataset: &DatasetHandle, sql_driver: bool) -> bool {
    match kind {
        BackendKind::Generic => true,
        BackendKind::Embedded => dataset.storage == StorageKind::Embedded,
        BackendKind::Sql => dataset.storage == StorageKind::Sql && sql_driver,
    }
}

/// Decide which backend serves `dataset`
pub fn choose_backend(
    dataset: &DatasetHandle,
    forced: Option<BackendKind>,
    sql_driver: bool,
) -> BackendSelection {
    if let Some(kind) = forced {
        if usable(kind, dataset, sql_driver) {
            let mut selection = BackendSelection::new(dataset, kind, format!("{} backend requested", kind));
            selection.forced = true;
            return selection;
        }
        let mut selection = BackendSelection::new(
            dataset,
            BackendKind::Generic,
            format!(
                "requested {} backend cannot serve {} storage{}",
                kind,
                dataset.storage,
                if kind == BackendKind::Sql && !sql_driver {
                    " (database driver unavailable)"
                } else {
                    ""
                }
            ),
        );
        selection.forced = true;
        selection.fallback = true;
        return selection;
    }

    match dataset.storage {
        StorageKind::Sql if sql_driver => {
            BackendSelection::new(dataset, BackendKind::Sql, "dataset is stored in a SQL database")
        }
        StorageKind::Embedded => BackendSelection::new(
            dataset,
            BackendKind::Embedded,
            "dataset is stored in an embedded database file",
        ),
        StorageKind::Sql => {
            let mut selection = BackendSelection::new(
                dataset,
                BackendKind::Generic,
                "database driver unavailable, using the generic driver",
            );
            selection.fallback = true;
            selection
        }
        StorageKind::Generic => BackendSelection::new(
            dataset,
            BackendKind::Generic,
            "dataset is read through the generic driver",
        ),
    }
}

/// Instantiate the backend of a given kind
pub fn create_backend(
    kind: BackendKind,
    services: &BackendServices,
    config: &EngineConfig,
) -> Box<dyn Backend> {
    let repair = config.geometry.repair;
    match kind {
        BackendKind::Sql => Box::new(SqlBackend::new(
            config.sql.clone(),
            repair,
            services.connections.clone(),
        )),
        BackendKind::Embedded => Box::new(EmbeddedBackend::new(
            config.embedded.clone(),
            repair,
            services.connections.clone(),
        )),
        BackendKind::Generic => Box::new(GenericBackend::new(
            config.generic.clone(),
            repair,
            services.features.clone(),
        )),
    }
}

/// Pick and build the backend for a dataset. Never fails.
pub fn select_backend(
    dataset: &DatasetHandle,
    forced: Option<BackendKind>,
    services: &BackendServices,
    config: &EngineConfig,
) -> (Box<dyn Backend>, BackendSelection) {
    let selection = choose_backend(dataset, forced, services.connections.sql_driver_available());
    if selection.fallback {
        tracing::warn!(dataset = %dataset.id, reason = %selection.reason, "falling back to the generic driver");
    } else {
        tracing::debug!(dataset = %dataset.id, backend = %selection.kind, reason = %selection.reason, "backend selected");
    }
    (create_backend(selection.kind, services, config), selection)
}
