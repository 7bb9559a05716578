//! Configuration type definitions

use serde::{Deserialize, Serialize};

/// Current configuration format version
pub const CONFIG_FORMAT_VERSION: u32 = 1;

/// Engine configuration, passed to the orchestrator at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Format version for compatibility checking
    #[serde(default = "default_version")]
    pub version: u32,

    /// Task worker pool
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Embedded database backend
    #[serde(default)]
    pub embedded: EmbeddedConfig,

    /// SQL database backend
    #[serde(default)]
    pub sql: SqlConfig,

    /// Generic driver backend
    #[serde(default)]
    pub generic: GenericConfig,

    /// Geometry preparation
    #[serde(default)]
    pub geometry: GeometryConfig,

    /// Undo/redo history
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            workers: WorkerConfig::default(),
            embedded: EmbeddedConfig::default(),
            sql: SqlConfig::default(),
            generic: GenericConfig::default(),
            geometry: GeometryConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Default number of values returned by list population
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            list_limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Attempts of the create-and-index sequence before giving up on a lock
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Prefix of temporary result tables
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            temp_prefix: default_temp_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Materialize when the request has at least this many predicates
    #[serde(default = "default_materialize_predicates")]
    pub materialize_predicate_threshold: usize,

    /// Materialize when the dataset has at least this many features
    #[serde(default = "default_materialize_features")]
    pub materialize_feature_threshold: u64,

    /// Prefix of materialized relations
    #[serde(default = "default_relation_prefix")]
    pub relation_prefix: String,

    /// Schema for materialized relations (the dataset's own schema when unset)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relation_schema: Option<String>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            materialize_predicate_threshold: default_materialize_predicates(),
            materialize_feature_threshold: default_materialize_features(),
            relation_prefix: default_relation_prefix(),
            relation_schema: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericConfig {
    /// Features evaluated between two cancellation checks
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            cancel_check_interval: default_cancel_check_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// Repair invalid geometries (and wrap targets in MakeValid on databases)
    #[serde(default = "default_true")]
    pub repair: bool,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            repair: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries kept per timeline; the oldest are dropped first
    #[serde(default = "default_history_entries")]
    pub max_entries: usize,

    /// Persist histories through the record store
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_history_entries(),
            persist: default_true(),
        }
    }
}

fn default_version() -> u32 {
    CONFIG_FORMAT_VERSION
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_list_limit() -> usize {
    1000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_temp_prefix() -> String {
    "_gf_tmp".to_string()
}

fn default_materialize_predicates() -> usize {
    3
}

fn default_materialize_features() -> u64 {
    100_000
}

fn default_relation_prefix() -> String {
    "gf_mv".to_string()
}

fn default_cancel_check_interval() -> usize {
    256
}

fn default_history_entries() -> usize {
    100
}

fn default_true() -> bool {
    true
}
