//! Engine configuration
//!
//! Configuration is a plain value loaded from TOML and handed to the
//! orchestrator, which threads the relevant sections into each backend.

pub mod types;

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::backend::retry::RetryPolicy;
use crate::error::{FilterError, Result};

pub use types::{
    EmbeddedConfig, EngineConfig, GenericConfig, GeometryConfig, HistoryConfig, SqlConfig,
    WorkerConfig, CONFIG_FORMAT_VERSION,
};

impl EmbeddedConfig {
    /// Retry policy for lock contention on the embedded store
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;

        if config.version > CONFIG_FORMAT_VERSION {
            tracing::warn!(
                version = config.version,
                supported = CONFIG_FORMAT_VERSION,
                "configuration written by a newer version"
            );
        }

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FilterError::Other(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(FilterError::invalid_value("workers.count", 0));
        }
        if self.embedded.retry_attempts == 0 {
            return Err(FilterError::invalid_value("embedded.retry_attempts", 0));
        }
        if self.sql.materialize_predicate_threshold == 0 {
            return Err(FilterError::invalid_value(
                "sql.materialize_predicate_threshold",
                0,
            ));
        }
        if self.generic.cancel_check_interval == 0 {
            return Err(FilterError::invalid_value("generic.cancel_check_interval", 0));
        }
        Ok(())
    }
}
