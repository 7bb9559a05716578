//! Orchestrator: requests in, committed subsets and history out
//!
//! Lives on the owning thread. Backend work happens in tasks; everything
//! host-visible (subset commits, history, persistence) happens while draining
//! completions, so there is a single writer for every piece of session state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{select_backend, Artifact, BackendKind, BackendSelection, BackendServices};
use crate::cache::SourceGeometryCache;
use crate::config::EngineConfig;
use crate::dataset::{AttributeValue, DatasetId};
use crate::error::{ErrorCategory, FilterError, Result};
use crate::favorites::{self, Favorite};
use crate::history::{FilterHistory, GlobalHistory, GlobalSnapshot, HistoryEntry};
use crate::host::{HostServices, SubsetCommitter};
use crate::log_cache_metrics;
use crate::request::FilterRequest;
use crate::store::RecordStore;
use crate::task::{
    Completion, ExportRequest, ExportSummary, ExportTask, FilterOutcome, FilterTask,
    LayerMetadataTask, MetadataReport, PopulateListTask, PopulateRequest, TaskEngine, TaskId,
    TaskKind, TaskOutput, TaskResult,
};

pub type RequestId = u64;

/// What `submit_filter` started
#[derive(Debug, Clone, Serialize)]
pub struct RequestHandle {
    pub id: RequestId,
    /// Task per dataset that was queued
    pub tasks: Vec<(DatasetId, TaskId)>,
    pub selections: Vec<BackendSelection>,
    /// Targets the registry could not resolve
    pub unavailable: Vec<DatasetId>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Applied,
    Failed,
    Canceled,
    /// A newer request for the dataset won
    Superseded,
    Unavailable,
}

/// Per-dataset result of a filter request
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub request: RequestId,
    pub dataset: DatasetId,
    pub status: ReportStatus,
    pub backend: Option<BackendKind>,
    pub fallback: bool,
    pub feature_count: Option<u64>,
    pub subset: Option<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    /// Process exit code the error maps to
    pub code: Option<i32>,
}

impl DatasetReport {
    fn new(request: RequestId, dataset: DatasetId, status: ReportStatus) -> Self {
        Self {
            request,
            dataset,
            status,
            backend: None,
            fallback: false,
            feature_count: None,
            subset: None,
            warnings: Vec::new(),
            error: None,
            category: None,
            code: None,
        }
    }

    fn with_selection(mut self, selection: Option<&BackendSelection>) -> Self {
        if let Some(selection) = selection {
            self.backend = Some(selection.kind);
            self.fallback = selection.fallback;
        }
        self
    }

    fn with_error(mut self, error: &FilterError) -> Self {
        self.error = Some(error.user_message());
        self.category = Some(error.category());
        self.code = Some(error.exit_code().into());
        self
    }
}

/// States made visible by an undo, redo or reset
#[derive(Debug, Clone, Default, Serialize)]
pub struct Replay {
    pub entries: Vec<HistoryEntry>,
    /// Problems that did not stop the replay, such as unsaved history
    pub warnings: Vec<String>,
}

/// Drained from the orchestrator after a task finishes
#[derive(Debug)]
pub enum Report {
    Filter(DatasetReport),
    Metadata {
        task: TaskId,
        result: Result<MetadataReport>,
    },
    Values {
        task: TaskId,
        result: Result<Vec<AttributeValue>>,
    },
    Export {
        task: TaskId,
        result: Result<ExportSummary>,
    },
}

struct TaskInfo {
    request: RequestId,
    dataset: DatasetId,
    selection: BackendSelection,
    /// Handed to the task; re-queued when it does not succeed
    retired: Vec<Artifact>,
    warnings: Vec<String>,
}

struct RequestState {
    request: Arc<FilterRequest>,
    cache: Arc<SourceGeometryCache>,
    pending: usize,
    global: bool,
    snapshot: GlobalSnapshot,
}

pub struct Orchestrator {
    config: EngineConfig,
    host: HostServices,
    committer: Box<dyn SubsetCommitter>,
    store: Option<Arc<dyn RecordStore>>,
    engine: TaskEngine,
    histories: HashMap<DatasetId, FilterHistory>,
    global: GlobalHistory,
    subsets: HashMap<DatasetId, String>,
    /// Latest filter task per dataset
    in_flight: HashMap<DatasetId, TaskId>,
    /// Tasks replaced by a newer state of their dataset
    superseded: HashSet<TaskId>,
    filter_tasks: HashMap<TaskId, TaskInfo>,
    requests: HashMap<RequestId, RequestState>,
    /// Artifacts whose subsets left every timeline, dropped by the next filter
    retired: HashMap<DatasetId, Vec<Artifact>>,
    ready: Vec<Report>,
    next_request: RequestId,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        host: HostServices,
        committer: Box<dyn SubsetCommitter>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = TaskEngine::new(config.workers.count)?;
        let global = GlobalHistory::new(config.history.max_entries);
        Ok(Self {
            config,
            host,
            committer,
            store,
            engine,
            histories: HashMap::new(),
            global,
            subsets: HashMap::new(),
            in_flight: HashMap::new(),
            superseded: HashSet::new(),
            filter_tasks: HashMap::new(),
            requests: HashMap::new(),
            retired: HashMap::new(),
            ready: Vec::new(),
            next_request: 1,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue one filter task per target dataset
    pub fn submit_filter(&mut self, request: FilterRequest) -> Result<RequestHandle> {
        request.validate()?;
        let id = self.next_request;
        self.next_request += 1;
        let request = Arc::new(request);
        let mut state = RequestState {
            cache: Arc::new(SourceGeometryCache::new()),
            pending: 0,
            global: request.history_scope.is_global(request.targets.len()),
            snapshot: GlobalSnapshot::new(request.summary()),
            request: request.clone(),
        };
        let mut handle = RequestHandle {
            id,
            tasks: Vec::new(),
            selections: Vec::new(),
            unavailable: Vec::new(),
            warnings: Vec::new(),
        };

        for target in &request.targets {
            if let Err(e) = self.queue_target(target, &mut state, &mut handle) {
                // tasks already queued still finish through the request
                if state.pending > 0 {
                    self.requests.insert(id, state);
                }
                return Err(e);
            }
        }

        tracing::info!(request = id, tasks = state.pending, summary = %request.summary(), "filter request submitted");
        if state.pending > 0 {
            self.requests.insert(id, state);
        }
        Ok(handle)
    }

    fn queue_target(
        &mut self,
        target: &DatasetId,
        state: &mut RequestState,
        handle: &mut RequestHandle,
    ) -> Result<()> {
        let request = state.request.clone();
        let Some(dataset) = self.host.registry.resolve(target) else {
            tracing::warn!(request = handle.id, dataset = %target, "target dataset unavailable");
            let error = FilterError::DatasetUnavailable(target.clone());
            self.ready.push(Report::Filter(
                DatasetReport::new(handle.id, target.clone(), ReportStatus::Unavailable).with_error(&error),
            ));
            handle.unavailable.push(target.clone());
            return Ok(());
        };

        let services = BackendServices::from(&self.host);
        let (backend, selection) = select_backend(&dataset, request.forced_backend, &services, &self.config);
        let mut warnings = Vec::new();
        if selection.fallback {
            warnings.push(selection.reason.clone());
        }
        let approximated = backend.supports_predicates().approximated(&request.predicates);
        if !approximated.is_empty() {
            let names: Vec<&str> = approximated.iter().map(|p| p.as_str()).collect();
            let warning = format!(
                "{} backend approximates {} with bounding boxes on {}",
                selection.kind,
                names.join(", "),
                dataset.id
            );
            tracing::warn!(dataset = %dataset.id, "{}", warning);
            handle.warnings.push(warning.clone());
            warnings.push(warning);
        }

        // last writer wins
        self.supersede(&dataset.id);
        let retired = self.retired.remove(&dataset.id).unwrap_or_default();
        let task = FilterTask::new(
            request,
            dataset.clone(),
            (backend, selection.clone()),
            self.host.registry.clone(),
            self.host.features.clone(),
            state.cache.clone(),
            self.subsets.get(&dataset.id).cloned(),
            self.config.geometry.repair,
        )
        .with_retired(retired.clone());

        let task_id = match self.engine.submit(Box::new(task)) {
            Ok(task) => task.id,
            Err(e) => {
                self.retire(&dataset.id, retired);
                return Err(e);
            }
        };
        self.in_flight.insert(dataset.id.clone(), task_id);
        self.filter_tasks.insert(
            task_id,
            TaskInfo {
                request: handle.id,
                dataset: dataset.id.clone(),
                selection: selection.clone(),
                retired,
                warnings,
            },
        );
        state.pending += 1;
        handle.tasks.push((dataset.id, task_id));
        handle.selections.push(selection);
        Ok(())
    }

    /// Drain finished tasks without blocking
    pub fn process_completions(&mut self) -> Vec<Report> {
        while let Some(completion) = self.engine.try_next() {
            self.finish(completion);
        }
        std::mem::take(&mut self.ready)
    }

    /// Drain until no task is left or `timeout` elapses
    pub fn wait_idle(&mut self, timeout: Duration) -> Vec<Report> {
        let deadline = Instant::now() + timeout;
        while self.engine.pending() > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                tracing::debug!(pending = self.engine.pending(), "still waiting for tasks");
                break;
            }
            if let Some(completion) = self.engine.next_timeout(left) {
                self.finish(completion);
            }
        }
        self.process_completions()
    }

    /// Tasks not yet finished
    pub fn pending(&self) -> usize {
        self.engine.pending()
    }

    fn finish(&mut self, completion: Completion) {
        tracing::debug!(
            task = completion.id,
            kind = %completion.kind,
            elapsed = ?completion.elapsed,
            "{}",
            completion.description
        );
        if let Some(info) = self.filter_tasks.remove(&completion.id) {
            self.finish_filter(completion.id, info, completion.result);
            return;
        }
        let task = completion.id;
        let report = match completion.result {
            TaskResult::Succeeded(TaskOutput::Metadata(report)) => Report::Metadata {
                task,
                result: Ok(report),
            },
            TaskResult::Succeeded(TaskOutput::Values(values)) => Report::Values {
                task,
                result: Ok(values),
            },
            TaskResult::Succeeded(TaskOutput::Export(summary)) => Report::Export {
                task,
                result: Ok(summary),
            },
            TaskResult::Succeeded(TaskOutput::Filter(_)) => {
                tracing::error!(task, "filter result without a request");
                return;
            }
            TaskResult::Failed(error) => Self::aux_failure(task, completion.kind, error),
            TaskResult::Canceled => Self::aux_failure(task, completion.kind, FilterError::Canceled),
        };
        self.ready.push(report);
    }

    fn aux_failure(task: TaskId, kind: TaskKind, error: FilterError) -> Report {
        match kind {
            TaskKind::LayerMetadata => Report::Metadata {
                task,
                result: Err(error),
            },
            TaskKind::PopulateList => Report::Values {
                task,
                result: Err(error),
            },
            TaskKind::Export | TaskKind::Filter => Report::Export {
                task,
                result: Err(error),
            },
        }
    }

    fn finish_filter(&mut self, task: TaskId, info: TaskInfo, result: TaskResult) {
        let superseded = self.superseded.remove(&task);
        if self.in_flight.get(&info.dataset) == Some(&task) {
            self.in_flight.remove(&info.dataset);
        }
        let mut report = DatasetReport::new(info.request, info.dataset.clone(), ReportStatus::Applied)
            .with_selection(Some(&info.selection));
        report.warnings = info.warnings;

        match result {
            TaskResult::Succeeded(TaskOutput::Filter(outcome)) if superseded => {
                tracing::info!(dataset = %info.dataset, task, "discarding superseded filter result");
                self.retire(&info.dataset, outcome.applied.retained);
                report.status = ReportStatus::Superseded;
            }
            TaskResult::Succeeded(TaskOutput::Filter(outcome)) => {
                report = self.commit(info.request, *outcome, report);
            }
            TaskResult::Succeeded(_) => {
                tracing::error!(task, "filter task returned a foreign output");
                report.status = ReportStatus::Failed;
            }
            TaskResult::Canceled => {
                self.retire(&info.dataset, info.retired);
                if superseded {
                    report.status = ReportStatus::Superseded;
                } else {
                    report.status = ReportStatus::Canceled;
                    report = report.with_error(&FilterError::Canceled);
                }
            }
            TaskResult::Failed(error) => {
                tracing::warn!(dataset = %info.dataset, error = %error, "filter failed");
                self.retire(&info.dataset, info.retired);
                report.status = ReportStatus::Failed;
                report = report.with_error(&error);
            }
        }
        self.ready.push(Report::Filter(report));
        self.request_done(info.request);
    }

    /// The `Finished` side effects of a successful filter
    fn commit(&mut self, request: RequestId, outcome: FilterOutcome, mut report: DatasetReport) -> DatasetReport {
        let dataset = outcome.dataset.clone();
        report.warnings.extend(outcome.warnings);
        if let Err(error) = self.committer.commit_subset(&dataset, &outcome.applied.subset) {
            tracing::warn!(dataset = %dataset, error = %error, "subset commit failed");
            self.retire(&dataset, outcome.applied.retained);
            report.status = ReportStatus::Failed;
            return report.with_error(&error);
        }

        let description = self
            .requests
            .get(&request)
            .map(|state| state.request.summary())
            .unwrap_or_else(|| "filter".to_string());
        let entry = HistoryEntry::new(
            dataset.clone(),
            outcome.applied.subset.clone(),
            Some(outcome.applied.feature_count),
            description,
        )
        .with_artifacts(&outcome.applied.retained)
        .with_metadata("backend", serde_json::json!(outcome.applied.backend))
        .with_metadata("expression", serde_json::json!(outcome.expression));

        let before = self.record(&dataset, entry.clone());
        if let Some(state) = self.requests.get_mut(&request) {
            if state.global {
                state.snapshot.record(before, entry);
            }
        }
        if let Some(warning) = self.persist_dataset(&dataset) {
            report.warnings.push(warning);
        }

        tracing::info!(
            dataset = %dataset,
            backend = %outcome.applied.backend,
            features = outcome.applied.feature_count,
            cache_hit = ?outcome.cache_hit,
            "subset committed"
        );
        report.feature_count = Some(outcome.applied.feature_count);
        report.subset = Some(outcome.applied.subset);
        report
    }

    /// Push onto the dataset timeline, returning the state it replaces
    fn record(&mut self, dataset: &DatasetId, entry: HistoryEntry) -> HistoryEntry {
        let max = self.config.history.max_entries;
        let history = self
            .histories
            .entry(dataset.clone())
            .or_insert_with(|| FilterHistory::new(dataset.clone(), max));
        let before = history.current();
        let removed = history.push(entry.clone());
        self.set_subset(dataset, &entry.subset);
        for old in removed {
            self.retire(dataset, old.artifacts());
        }
        before
    }

    fn request_done(&mut self, request: RequestId) {
        let Some(state) = self.requests.get_mut(&request) else {
            return;
        };
        state.pending = state.pending.saturating_sub(1);
        if state.pending > 0 {
            return;
        }
        let Some(state) = self.requests.remove(&request) else {
            return;
        };
        if state.global && !state.snapshot.is_empty() {
            self.global.push(state.snapshot);
            if let Some(warning) = self.persist_global() {
                // the request's last report is already queued
                if let Some(Report::Filter(report)) = self.ready.last_mut() {
                    report.warnings.push(warning);
                }
            }
        }
        log_cache_metrics!(state.cache.metrics(), "request_finished");
        state.cache.clear();
        tracing::debug!(request, "filter request finished");
    }

    fn set_subset(&mut self, dataset: &DatasetId, subset: &str) {
        if subset.trim().is_empty() {
            self.subsets.remove(dataset);
        } else {
            self.subsets.insert(dataset.clone(), subset.to_string());
        }
    }

    fn retire(&mut self, dataset: &DatasetId, artifacts: Vec<Artifact>) {
        if artifacts.is_empty() {
            return;
        }
        let queue = self.retired.entry(dataset.clone()).or_default();
        for artifact in artifacts {
            if !queue.contains(&artifact) {
                queue.push(artifact);
            }
        }
    }

    /// Artifacts waiting to be dropped for a dataset
    pub fn retired_artifacts(&self, dataset: &DatasetId) -> &[Artifact] {
        self.retired.get(dataset).map(Vec::as_slice).unwrap_or(&[])
    }

    fn persist_dataset(&self, dataset: &DatasetId) -> Option<String> {
        let store = self.store.as_ref().filter(|_| self.config.history.persist)?;
        let history = self.histories.get(dataset)?;
        history.save(store.as_ref()).err().map(|e| {
            tracing::warn!(dataset = %dataset, error = %e, "history kept for this session only");
            format!("history of {} not persisted: {}", dataset, e)
        })
    }

    fn persist_global(&self) -> Option<String> {
        let store = self.store.as_ref().filter(|_| self.config.history.persist)?;
        self.global.save(store.as_ref()).err().map(|e| {
            tracing::warn!(error = %e, "global history kept for this session only");
            format!("global history not persisted: {}", e)
        })
    }

    /// Make a history state visible without refiltering
    fn apply_entry(&mut self, entry: &HistoryEntry) -> Result<()> {
        self.supersede(&entry.dataset);
        self.committer.commit_subset(&entry.dataset, &entry.subset)?;
        self.set_subset(&entry.dataset, &entry.subset);
        Ok(())
    }

    /// Step a dataset back; `None` when there is nothing to undo
    pub fn undo(&mut self, dataset: &DatasetId) -> Result<Option<Replay>> {
        let Some(entry) = self.histories.get_mut(dataset).and_then(FilterHistory::undo) else {
            return Ok(None);
        };
        if let Err(e) = self.apply_entry(&entry) {
            // keep the cursor on what is actually visible
            if let Some(history) = self.histories.get_mut(dataset) {
                history.redo();
            }
            return Err(e);
        }
        tracing::info!(dataset = %dataset, subset = %entry.subset, "undo");
        let mut replay = Replay::default();
        replay.warnings.extend(self.persist_dataset(dataset));
        replay.entries.push(entry);
        Ok(Some(replay))
    }

    pub fn redo(&mut self, dataset: &DatasetId) -> Result<Option<Replay>> {
        let Some(entry) = self.histories.get_mut(dataset).and_then(FilterHistory::redo) else {
            return Ok(None);
        };
        if let Err(e) = self.apply_entry(&entry) {
            if let Some(history) = self.histories.get_mut(dataset) {
                history.undo();
            }
            return Err(e);
        }
        tracing::info!(dataset = %dataset, subset = %entry.subset, "redo");
        let mut replay = Replay::default();
        replay.warnings.extend(self.persist_dataset(dataset));
        replay.entries.push(entry);
        Ok(Some(replay))
    }

    /// Replay the previous global snapshot on every dataset it touched
    pub fn undo_global(&mut self) -> Result<Option<Replay>> {
        let Some(states) = self.global.undo() else {
            return Ok(None);
        };
        let mut replay = self.apply_states(states)?;
        replay.warnings.extend(self.persist_global());
        Ok(Some(replay))
    }

    pub fn redo_global(&mut self) -> Result<Option<Replay>> {
        let Some(states) = self.global.redo() else {
            return Ok(None);
        };
        let mut replay = self.apply_states(states)?;
        replay.warnings.extend(self.persist_global());
        Ok(Some(replay))
    }

    fn apply_states(&mut self, states: BTreeMap<DatasetId, HistoryEntry>) -> Result<Replay> {
        let mut replay = Replay::default();
        let mut first_error = None;
        for (dataset, entry) in states {
            match self.apply_entry(&entry) {
                Ok(()) => {
                    replay.warnings.extend(self.sync_timeline(&dataset, &entry));
                    replay.entries.push(entry);
                }
                Err(e) => {
                    tracing::warn!(dataset = %dataset, error = %e, "could not restore dataset state");
                    replay.warnings.push(format!("{} not restored: {}", dataset, e));
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if replay.entries.is_empty() => Err(e),
            _ => Ok(replay),
        }
    }

    /// Follow a global replay on the dataset timeline so it matches what is visible
    fn sync_timeline(&mut self, dataset: &DatasetId, entry: &HistoryEntry) -> Option<String> {
        let max = self.config.history.max_entries;
        let removed = self
            .histories
            .entry(dataset.clone())
            .or_insert_with(|| FilterHistory::new(dataset.clone(), max))
            .sync_to(entry);
        for old in removed {
            self.retire(dataset, old.artifacts());
        }
        self.persist_dataset(dataset)
    }

    /// Clear the subsets of `datasets`, recorded like any other filter
    pub fn reset(&mut self, datasets: &[DatasetId]) -> Result<Replay> {
        let mut snapshot = GlobalSnapshot::new("reset");
        let mut replay = Replay::default();
        for dataset in datasets {
            self.supersede(dataset);
            self.committer.commit_subset(dataset, "")?;
            let entry = HistoryEntry::new(dataset.clone(), "", None, "reset");
            let before = self.record(dataset, entry.clone());
            snapshot.record(before, entry.clone());
            replay.warnings.extend(self.persist_dataset(dataset));
            replay.entries.push(entry);
        }
        if datasets.len() > 1 {
            self.global.push(snapshot);
            replay.warnings.extend(self.persist_global());
        }
        tracing::info!(datasets = datasets.len(), "subsets reset");
        Ok(replay)
    }

    /// Export datasets under their current subsets unless given explicitly
    pub fn submit_export(&mut self, mut request: ExportRequest) -> Result<TaskId> {
        for dataset in &request.datasets {
            if let Some(subset) = self.subsets.get(dataset) {
                request
                    .subsets
                    .entry(dataset.clone())
                    .or_insert_with(|| subset.clone());
            }
        }
        let task = ExportTask::new(
            request,
            self.host.registry.clone(),
            self.host.features.clone(),
            self.host.writer.clone(),
        );
        Ok(self.engine.submit(Box::new(task))?.id)
    }

    pub fn submit_layer_metadata(&mut self, dataset: DatasetId) -> Result<TaskId> {
        let task = LayerMetadataTask::new(
            dataset,
            self.host.registry.clone(),
            self.host.connections.clone(),
        );
        Ok(self.engine.submit(Box::new(task))?.id)
    }

    /// Distinct values of `field`, optionally under the dataset's current subset
    pub fn submit_populate_list(
        &mut self,
        dataset: DatasetId,
        field: impl Into<String>,
        under_subset: bool,
        limit: Option<usize>,
    ) -> Result<TaskId> {
        let subset = under_subset
            .then(|| self.subsets.get(&dataset).cloned())
            .flatten();
        let request = PopulateRequest {
            dataset,
            field: field.into(),
            subset,
            limit: limit.unwrap_or(self.config.workers.list_limit),
        };
        let task = PopulateListTask::new(
            request,
            self.host.registry.clone(),
            self.host.features.clone(),
            self.config.generic.cancel_check_interval,
        );
        Ok(self.engine.submit(Box::new(task))?.id)
    }

    /// Cancel the in-flight filter of a dataset in favor of a newer state
    fn supersede(&mut self, dataset: &DatasetId) {
        if let Some(task) = self.in_flight.remove(dataset) {
            tracing::debug!(dataset = %dataset, task, "superseding in-flight filter");
            self.superseded.insert(task);
            self.engine.cancel(task);
        }
    }

    /// Cancel the in-flight filter of a dataset
    pub fn cancel_dataset(&mut self, dataset: &DatasetId) -> bool {
        match self.in_flight.remove(dataset) {
            Some(task) => {
                tracing::debug!(dataset = %dataset, task, "canceling in-flight filter");
                self.engine.cancel(task)
            }
            None => false,
        }
    }

    /// Cancel every task of a request, returning how many were signalled
    pub fn cancel_request(&mut self, request: RequestId) -> usize {
        let tasks: Vec<(TaskId, DatasetId)> = self
            .filter_tasks
            .iter()
            .filter(|(_, info)| info.request == request)
            .map(|(task, info)| (*task, info.dataset.clone()))
            .collect();
        let mut canceled = 0;
        for (task, dataset) in tasks {
            if self.in_flight.get(&dataset) == Some(&task) {
                self.in_flight.remove(&dataset);
            }
            if self.engine.cancel(task) {
                canceled += 1;
            }
        }
        canceled
    }

    /// Cancel everything; results still arrive as canceled reports
    pub fn cancel_all(&mut self) {
        self.in_flight.clear();
        self.engine.cancel_all();
    }

    pub fn cancel_task(&self, task: TaskId) -> bool {
        self.engine.cancel(task)
    }

    pub fn current_subset(&self, dataset: &DatasetId) -> Option<&str> {
        self.subsets.get(dataset).map(String::as_str)
    }

    pub fn history(&self, dataset: &DatasetId) -> Option<&FilterHistory> {
        self.histories.get(dataset)
    }

    pub fn global_history(&self) -> &GlobalHistory {
        &self.global
    }

    /// Load a dataset's persisted timeline into the session
    pub fn restore_history(&mut self, dataset: &DatasetId) -> Result<bool> {
        let Some(store) = self.store.clone() else {
            return Ok(false);
        };
        let Some(history) = FilterHistory::load(store.as_ref(), dataset, self.config.history.max_entries)? else {
            return Ok(false);
        };
        self.set_subset(dataset, &history.current().subset);
        tracing::debug!(dataset = %dataset, entries = history.entries().len(), "history restored");
        self.histories.insert(dataset.clone(), history);
        Ok(true)
    }

    /// Load the persisted global timeline
    pub fn restore_global_history(&mut self) -> Result<bool> {
        let Some(store) = self.store.clone() else {
            return Ok(false);
        };
        match GlobalHistory::load(store.as_ref(), self.config.history.max_entries)? {
            Some(global) => {
                self.global = global;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn require_store(&self, what: &str) -> Result<Arc<dyn RecordStore>> {
        self.store
            .clone()
            .ok_or_else(|| FilterError::persistence(what, "no record store configured"))
    }

    pub fn save_favorite(&self, favorite: &Favorite) -> Result<()> {
        favorites::save(self.require_store("favorites")?.as_ref(), favorite)
    }

    pub fn favorites(&self) -> Result<Vec<Favorite>> {
        favorites::list(self.require_store("favorites")?.as_ref())
    }

    /// Submit a saved request, optionally against other datasets
    pub fn apply_favorite(&mut self, name: &str, targets: Option<Vec<DatasetId>>) -> Result<RequestHandle> {
        let store = self.require_store("favorites")?;
        let favorite = favorites::load(store.as_ref(), name)?
            .ok_or_else(|| FilterError::invalid_value("favorite", name))?;
        self.submit_filter(favorite.request_for(targets))
    }

    /// Cancel outstanding work and stop the workers
    pub fn shutdown(&mut self) {
        self.cancel_all();
        self.engine.shutdown();
    }
}
