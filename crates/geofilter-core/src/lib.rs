//! Geofilter Core Library
//!
//! Multi-backend geometric filter engine: compiles attribute and spatial
//! filters for SQL, embedded and generic storage, runs them off the owning
//! thread, and keeps per-dataset and global undo/redo timelines.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod expression;
pub mod favorites;
pub mod geometry;
pub mod history;
pub mod host;
pub mod logging;
pub mod orchestrator;
pub mod request;
pub mod store;
pub mod task;

pub use backend::{BackendKind, BackendSelection};
pub use config::EngineConfig;
pub use dataset::{DatasetHandle, DatasetId};
pub use error::{FilterError, Result};
pub use orchestrator::{DatasetReport, Orchestrator, Replay, Report, ReportStatus, RequestHandle};
pub use request::{FilterRequest, HistoryScope, Predicate};
