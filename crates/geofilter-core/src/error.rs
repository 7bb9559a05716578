//! Error types and exit codes for geofilter
//!
//! Every error belongs to one [`ErrorCategory`] so that callers can tell a
//! configuration problem (fix the dataset setup) from a transient one (retry
//! later) or an environment one (install or enable a driver).
//!
//! Exit codes used by the CLI:
//! - 0: Success
//! - 1: Generic failure
//! - 2: Usage error (bad flags/args, invalid expression)
//! - 3: Data error (dataset setup, unavailable dataset, invalid geometry)
//! - 4: Transient error (storage locked, connection lost, canceled)

mod macros;

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::dataset::DatasetId;
use crate::request::Predicate;

/// Exit codes for the geofilter CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Success (0)
    Success = 0,
    /// Generic failure (1)
    Failure = 1,
    /// Usage error - bad flags/args (2)
    Usage = 2,
    /// Data error - dataset configuration or content (3)
    Data = 3,
    /// Transient error - retry later (4)
    Transient = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

/// Broad class of a failure, used to pick an actionable message
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The dataset or request is misconfigured; retrying will not help
    Configuration,
    /// The operation may succeed if retried later
    Transient,
    /// A driver or extension is missing from the runtime
    Environment,
    /// Unexpected failure inside geofilter or the host
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Environment => write!(f, "environment"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl From<rusqlite::Error> for FilterError {
    fn from(err: rusqlite::Error) -> Self {
        FilterError::Sqlite(err.to_string())
    }
}

/// Errors that can occur during geofilter operations
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("dataset {dataset} is missing required properties: {missing}")]
    InvalidProperties { dataset: DatasetId, missing: String },

    #[error("predicate '{predicate}' is not supported by the {backend} backend")]
    UnsupportedPredicate {
        predicate: Predicate,
        backend: BackendKind,
    },

    #[error("storage for {dataset} stayed locked after {attempts} attempts")]
    StorageLocked { dataset: DatasetId, attempts: u32 },

    #[error("cannot reach database for {dataset}: {reason}")]
    Connection { dataset: DatasetId, reason: String },

    #[error("invalid geometry: {reason}")]
    GeometryInvalid { reason: String },

    #[error("dataset not available: {0}")]
    DatasetUnavailable(DatasetId),

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("cannot reproject from {source_crs} to {target_crs}")]
    CrsMismatch {
        source_crs: String,
        target_crs: String,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("storage error on {dataset}: {reason}")]
    Storage { dataset: DatasetId, reason: String },

    #[error("failed to persist {key}: {reason}")]
    Persistence { key: String, reason: String },

    #[error("failed to export {target:?}: {reason}")]
    Export { target: PathBuf, reason: String },

    #[error("invalid {context}: {value}")]
    InvalidValue { context: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("{0}")]
    Other(String),
}

impl FilterError {
    /// Create an error for a failed storage statement
    pub fn storage(dataset: &DatasetId, error: impl std::fmt::Display) -> Self {
        FilterError::Storage {
            dataset: dataset.clone(),
            reason: error.to_string(),
        }
    }

    /// Create an error for missing dataset properties
    pub fn missing_properties(dataset: &DatasetId, missing: &[&str]) -> Self {
        FilterError::InvalidProperties {
            dataset: dataset.clone(),
            missing: missing.join(", "),
        }
    }

    /// Create an error for an expression that cannot be compiled
    pub fn invalid_expression(reason: impl std::fmt::Display) -> Self {
        FilterError::InvalidExpression {
            reason: reason.to_string(),
        }
    }

    /// Create an error for an invalid value or configuration
    pub fn invalid_value(context: &str, value: impl std::fmt::Display) -> Self {
        FilterError::InvalidValue {
            context: context.to_string(),
            value: value.to_string(),
        }
    }

    /// Create an error for a record store failure
    pub fn persistence(key: &str, error: impl std::fmt::Display) -> Self {
        FilterError::Persistence {
            key: key.to_string(),
            reason: error.to_string(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, FilterError::Canceled)
    }

    /// Classify the error for user-facing reporting
    pub fn category(&self) -> ErrorCategory {
        match self {
            FilterError::InvalidProperties { .. }
            | FilterError::UnsupportedPredicate { .. }
            | FilterError::GeometryInvalid { .. }
            | FilterError::DatasetUnavailable(_)
            | FilterError::InvalidExpression { .. }
            | FilterError::CrsMismatch { .. }
            | FilterError::InvalidValue { .. } => ErrorCategory::Configuration,

            FilterError::StorageLocked { .. }
            | FilterError::Canceled
            | FilterError::Storage { .. }
            | FilterError::Persistence { .. } => ErrorCategory::Transient,

            FilterError::Connection { .. } => ErrorCategory::Environment,

            FilterError::Export { .. }
            | FilterError::Io(_)
            | FilterError::Json(_)
            | FilterError::Toml(_)
            | FilterError::Sqlite(_)
            | FilterError::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Actionable message shown to the user instead of a generic failure
    pub fn user_message(&self) -> String {
        match self {
            FilterError::InvalidProperties { dataset, missing } => format!(
                "Layer '{}' cannot be filtered: it has no {}. Fix the layer setup and try again.",
                dataset, missing
            ),
            FilterError::UnsupportedPredicate { predicate, backend } => format!(
                "The {} backend cannot evaluate '{}'. Choose another predicate or a backend that supports it.",
                backend, predicate
            ),
            FilterError::StorageLocked { dataset, attempts } => format!(
                "The database file behind '{}' is busy ({} attempts). Close other programs using it and retry.",
                dataset, attempts
            ),
            FilterError::Connection { dataset, reason } => format!(
                "Cannot connect to the database of '{}' ({}). Check that the database driver is installed and the server is reachable.",
                dataset, reason
            ),
            FilterError::GeometryInvalid { reason } => format!(
                "The reference geometry is unusable ({}). Select valid source features.",
                reason
            ),
            FilterError::DatasetUnavailable(id) => format!(
                "Layer '{}' is no longer available. Reload the project layers.",
                id
            ),
            FilterError::InvalidExpression { reason } => {
                format!("The filter expression is invalid: {}.", reason)
            }
            FilterError::Canceled => "The operation was canceled.".to_string(),
            FilterError::Storage { dataset, reason } => format!(
                "Filtering '{}' failed in the database ({}). Retry later.",
                dataset, reason
            ),
            FilterError::Persistence { key, reason } => format!(
                "Could not save '{}' ({}). History is kept for this session only.",
                key, reason
            ),
            other => other.to_string(),
        }
    }

    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FilterError::InvalidExpression { .. }
            | FilterError::InvalidValue { .. }
            | FilterError::UnsupportedPredicate { .. } => ExitCode::Usage,

            FilterError::InvalidProperties { .. }
            | FilterError::GeometryInvalid { .. }
            | FilterError::DatasetUnavailable(_)
            | FilterError::CrsMismatch { .. } => ExitCode::Data,

            FilterError::StorageLocked { .. }
            | FilterError::Connection { .. }
            | FilterError::Canceled
            | FilterError::Storage { .. } => ExitCode::Transient,

            FilterError::Persistence { .. }
            | FilterError::Export { .. }
            | FilterError::Io(_)
            | FilterError::Json(_)
            | FilterError::Toml(_)
            | FilterError::Sqlite(_)
            | FilterError::Other(_) => ExitCode::Failure,
        }
    }

    /// Get the error type identifier
    fn error_type(&self) -> &'static str {
        match self {
            FilterError::InvalidProperties { .. } => "invalid_properties",
            FilterError::UnsupportedPredicate { .. } => "unsupported_predicate",
            FilterError::StorageLocked { .. } => "storage_locked",
            FilterError::Connection { .. } => "connection",
            FilterError::GeometryInvalid { .. } => "geometry_invalid",
            FilterError::DatasetUnavailable(_) => "dataset_unavailable",
            FilterError::InvalidExpression { .. } => "invalid_expression",
            FilterError::CrsMismatch { .. } => "crs_mismatch",
            FilterError::Canceled => "canceled",
            FilterError::Storage { .. } => "storage",
            FilterError::Persistence { .. } => "persistence",
            FilterError::Export { .. } => "export",
            FilterError::InvalidValue { .. } => "invalid_value",
            FilterError::Io(_) => "io_error",
            FilterError::Json(_) => "json_error",
            FilterError::Toml(_) => "toml_error",
            FilterError::Sqlite(_) => "sqlite_error",
            FilterError::Other(_) => "other",
        }
    }

    /// Convert error to JSON representation for structured error output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.exit_code() as i32,
                "type": self.error_type(),
                "category": self.category(),
                "message": self.to_string(),
                "hint": self.user_message(),
            }
        })
    }
}

/// Result type alias for geofilter operations
pub type Result<T> = std::result::Result<T, FilterError>;
