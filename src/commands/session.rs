//! One engine session over a database

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use geofilter_core::error::{FilterError, Result};
use geofilter_core::orchestrator::{Orchestrator, Report};
use geofilter_core::store::{RecordStore, SqliteRecordStore};
use geofilter_core::{bail_invalid, EngineConfig};

use crate::cli::Cli;
use crate::host::{RecordCommitter, SqliteHost};

/// How often the wait loop looks at the interrupt flag
const POLL: Duration = Duration::from_millis(100);

/// Time canceled tasks get to wind down
const GRACE: Duration = Duration::from_secs(5);

/// Default location of the engine configuration
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("geofilter").join("config.toml"))
}

pub fn load_config(cli: &Cli) -> Result<EngineConfig> {
    if let Some(path) = &cli.config {
        return EngineConfig::load(path);
    }
    match default_config_path().filter(|p| p.exists()) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading configuration");
            EngineConfig::load(&path)
        }
        None => Ok(EngineConfig::default()),
    }
}

pub struct Session {
    pub orchestrator: Orchestrator,
    pub host: Arc<SqliteHost>,
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
}

impl Session {
    pub fn open(cli: &Cli) -> Result<Self> {
        let Some(db) = &cli.db else {
            bail_invalid!("--db", "no database given (use --db or GEOFILTER_DB)");
        };
        let config = load_config(cli)?;
        let host = Arc::new(SqliteHost::open(db)?);
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(host.path())?);
        let committer = RecordCommitter::new(store.clone());
        let mut orchestrator =
            Orchestrator::new(config, host.services(), Box::new(committer), Some(store))?;

        for layer in host.layer_ids() {
            if let Err(e) = orchestrator.restore_history(&layer) {
                tracing::warn!(layer = %layer, error = %e, "could not restore filter history");
            }
        }
        if let Err(e) = orchestrator.restore_global_history() {
            tracing::warn!(error = %e, "could not restore global history");
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            tracing::debug!(error = %e, "interrupt handler not installed");
        }

        Ok(Self {
            orchestrator,
            host,
            timeout: Duration::from_secs(cli.timeout.max(1)),
            interrupted,
        })
    }

    /// Drain reports until every task finished, canceling on interrupt or timeout
    pub fn wait(&mut self) -> Vec<Report> {
        let deadline = Instant::now() + self.timeout;
        let mut reports = Vec::new();
        loop {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                tracing::warn!("interrupted, canceling tasks");
                self.orchestrator.cancel_all();
            }
            reports.extend(self.orchestrator.wait_idle(POLL));
            if self.orchestrator.pending() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending = self.orchestrator.pending(), "timed out, canceling tasks");
                self.orchestrator.cancel_all();
                reports.extend(self.orchestrator.wait_idle(GRACE));
                break;
            }
        }
        reports
    }

    /// The single report a one-task command waits for
    pub fn wait_one(&mut self) -> Result<Report> {
        self.wait()
            .into_iter()
            .next()
            .ok_or_else(|| FilterError::Other("task did not finish".to_string()))
    }

    pub fn close(mut self) {
        self.orchestrator.shutdown();
    }
}
