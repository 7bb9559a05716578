//! Contracts of the host application collaborators
//!
//! The engine never owns datasets. It asks the host to resolve them, to hand
//! out storage sessions and features, to make subsets visible and to write
//! exports. Everything a worker thread touches is `Send + Sync`; the subset
//! committer is only used on the owning thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::embedded::EmbeddedStore;
use crate::backend::sql::SqlSession;
use crate::dataset::{Crs, DatasetHandle, DatasetId, Feature, FeatureId};
use crate::error::Result;

/// The host's project/layer registry
pub trait DatasetRegistry: Send + Sync {
    /// Current handle for a dataset, `None` when it no longer exists
    fn resolve(&self, id: &DatasetId) -> Option<DatasetHandle>;

    /// Ids of the features currently selected in a dataset
    fn selection(&self, id: &DatasetId) -> Vec<FeatureId>;

    /// Every dataset the host knows about
    fn datasets(&self) -> Vec<DatasetHandle> {
        Vec::new()
    }
}

/// Makes a subset expression visible on a dataset (owning thread only)
pub trait SubsetCommitter {
    /// Empty expression clears the subset
    fn commit_subset(&mut self, id: &DatasetId, expression: &str) -> Result<()>;
}

/// Generic feature access, used by the generic driver and exports
pub trait FeatureSource: Send + Sync {
    /// Features matching `subset` (all features when `None` or empty)
    fn features(&self, dataset: &DatasetHandle, subset: Option<&str>) -> Result<Vec<Feature>>;

    fn features_by_id(&self, dataset: &DatasetHandle, ids: &[FeatureId]) -> Result<Vec<Feature>>;
}

/// Hands out one storage session per task invocation
pub trait ConnectionProvider: Send + Sync {
    /// Whether the full-database driver is installed and usable
    fn sql_driver_available(&self) -> bool;

    fn open_sql(&self, dataset: &DatasetHandle) -> Result<Box<dyn SqlSession>>;

    fn open_embedded(&self, dataset: &DatasetHandle) -> Result<Box<dyn EmbeddedStore>>;
}

/// Features of one dataset ready to be written
#[derive(Debug, Clone)]
pub struct ExportLayer {
    pub dataset: DatasetId,
    pub name: String,
    /// CRS of the feature geometries
    pub crs: Crs,
    pub features: Vec<Feature>,
}

/// Output format description, passed through to the writer
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub format: String,
    pub target_crs: Option<Crs>,
}

/// Writes exported layers in a host format
pub trait ExportWriter: Send + Sync {
    /// Write one layer to `path`, returning the file actually written
    fn write_layer(&self, layer: &ExportLayer, options: &ExportOptions, path: &Path)
        -> Result<PathBuf>;

    /// Write the layer style next to `path`, if the host has one
    fn write_style(&self, dataset: &DatasetHandle, path: &Path) -> Result<Option<PathBuf>>;

    /// Bundle written files into one archive
    fn archive(&self, files: &[PathBuf], archive: &Path) -> Result<PathBuf>;
}

/// Host collaborators shared with worker threads
#[derive(Clone)]
pub struct HostServices {
    pub registry: Arc<dyn DatasetRegistry>,
    pub features: Arc<dyn FeatureSource>,
    pub connections: Arc<dyn ConnectionProvider>,
    pub writer: Arc<dyn ExportWriter>,
}
