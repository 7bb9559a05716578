//! Task engine: background work with cancellation and a completion channel
//!
//! Every task walks the same lifecycle:
//!
//! ```text
//! Created -> Queued -> Running -> {Succeeded | Failed | Canceled} -> Finished
//! ```
//!
//! `Running` happens on a worker thread and may block on storage I/O.
//! `Finished` happens on the owning thread when the completion is drained;
//! that is the only place host-visible side effects are applied.

mod engine;
pub mod export;
pub mod filter;
pub mod metadata;
pub mod populate;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

pub use engine::{Completion, TaskEngine, TaskHandle};
pub use export::{ExportRequest, ExportSummary, ExportTask};
pub use filter::{FilterOutcome, FilterTask};
pub use metadata::{LayerMetadataTask, MetadataReport};
pub use populate::{PopulateListTask, PopulateRequest};

use crate::dataset::AttributeValue;
use crate::error::{FilterError, Result};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Filter,
    LayerMetadata,
    PopulateList,
    Export,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Filter => "filter",
            TaskKind::LayerMetadata => "layer-metadata",
            TaskKind::PopulateList => "populate-list",
            TaskKind::Export => "export",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Finished,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Canceled)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Succeeded, Finished)
                | (Failed, Finished)
                | (Canceled, Finished)
        )
    }

    /// Succeeded, Failed or Canceled
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// Shared, transition-checked task state
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<TaskState>>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TaskState::Created)))
    }

    pub fn get(&self) -> TaskState {
        self.0.lock().map(|s| *s).unwrap_or(TaskState::Failed)
    }

    pub fn transition(&self, next: TaskState) -> Result<()> {
        let mut state = self
            .0
            .lock()
            .map_err(|_| FilterError::Other("task state lock poisoned".to_string()))?;
        if !state.can_transition_to(next) {
            return Err(FilterError::Other(format!(
                "invalid task transition {:?} -> {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

type CancelHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancelInner {
    canceled: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(u64, CancelHook)>>,
}

/// Cooperative cancellation flag with hooks run when it trips
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.0.canceled.load(Ordering::SeqCst)
    }

    /// Trip the flag and run the registered hooks once
    pub fn cancel(&self) {
        if self.0.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(hooks) = self.0.hooks.lock() {
            for (_, hook) in hooks.iter() {
                hook();
            }
        }
    }

    /// Register a hook; runs immediately when already canceled
    pub fn on_cancel(&self, hook: impl Fn() + Send + Sync + 'static) -> u64 {
        let id = self.0.next_hook.fetch_add(1, Ordering::SeqCst);
        {
            // `cancel` trips the flag before taking this lock
            let Ok(mut hooks) = self.0.hooks.lock() else {
                hook();
                return id;
            };
            if !self.is_canceled() {
                hooks.push((id, Box::new(hook)));
                return id;
            }
        }
        hook();
        id
    }

    pub fn remove_hook(&self, id: u64) {
        if let Ok(mut hooks) = self.0.hooks.lock() {
            hooks.retain(|(hook_id, _)| *hook_id != id);
        }
    }
}

/// Progress in percent, readable from any thread
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU32>);

impl Progress {
    pub fn set(&self, percent: u32) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a running task can see of its own lifecycle
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    cancel: CancelToken,
    progress: Progress,
}

impl TaskContext {
    pub fn new(id: TaskId, cancel: CancelToken, progress: Progress) -> Self {
        Self {
            id,
            cancel,
            progress,
        }
    }

    /// Context for running backend code outside the engine
    pub fn detached() -> Self {
        Self::new(0, CancelToken::new(), Progress::default())
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// `Err(Canceled)` once cancellation was requested
    pub fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(FilterError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn set_progress(&self, percent: u32) {
        self.progress.set(percent);
    }

    pub fn progress(&self) -> u32 {
        self.progress.get()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn on_cancel(&self, hook: impl Fn() + Send + Sync + 'static) -> u64 {
        self.cancel.on_cancel(hook)
    }

    pub fn remove_hook(&self, id: u64) {
        self.cancel.remove_hook(id);
    }

    /// Sleep in small steps, returning early when canceled
    pub fn sleep(&self, duration: Duration) {
        let step = Duration::from_millis(10);
        let mut left = duration;
        while !left.is_zero() && !self.is_canceled() {
            let nap = left.min(step);
            std::thread::sleep(nap);
            left -= nap;
        }
    }
}

/// Result payload of a successful task
#[derive(Debug)]
pub enum TaskOutput {
    Filter(Box<FilterOutcome>),
    Metadata(MetadataReport),
    Values(Vec<AttributeValue>),
    Export(ExportSummary),
}

/// How a task's `Running` phase ended
#[derive(Debug)]
pub enum TaskResult {
    Succeeded(TaskOutput),
    Failed(FilterError),
    Canceled,
}

impl TaskResult {
    pub fn state(&self) -> TaskState {
        match self {
            TaskResult::Succeeded(_) => TaskState::Succeeded,
            TaskResult::Failed(_) => TaskState::Failed,
            TaskResult::Canceled => TaskState::Canceled,
        }
    }
}

/// Unit of background work
pub trait Task: Send {
    fn kind(&self) -> TaskKind;

    /// Short description for logs and reports
    fn describe(&self) -> String;

    /// The `Running` phase, on a worker thread
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput>;

    /// Runs after `run` however it ended, and for tasks canceled while queued
    fn finalize(&mut self) {}
}
