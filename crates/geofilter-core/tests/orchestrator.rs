//! End-to-end filtering through the orchestrator

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    create_towns_db, embedded_towns, generic_towns, table_names, towns_features, Commits, MemoryHost,
};
use geofilter_core::backend::sql::{SqlSession, StatementCanceler};
use geofilter_core::dataset::{DatasetHandle, DatasetId, FieldType, StorageKind, TableRef};
use geofilter_core::error::{FilterError, Result};
use geofilter_core::request::{BufferSpec, BufferUnit, CombineOperator, SourceGeometry};
use geofilter_core::store::{MemoryRecordStore, RecordStore};
use geofilter_core::{
    BackendKind, DatasetReport, EngineConfig, FilterRequest, Orchestrator, Predicate, Report,
    ReportStatus,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn orchestrator(host: &Arc<MemoryHost>, commits: &Commits, store: Option<Arc<dyn RecordStore>>) -> Orchestrator {
    Orchestrator::new(
        EngineConfig::default(),
        host.services(),
        Box::new(commits.clone()),
        store,
    )
    .unwrap()
}

fn filter_reports(reports: Vec<Report>) -> Vec<DatasetReport> {
    reports
        .into_iter()
        .filter_map(|r| match r {
            Report::Filter(report) => Some(report),
            _ => None,
        })
        .collect()
}

fn towns() -> DatasetId {
    DatasetId::new("towns")
}

#[test]
fn test_generic_filter_combine_and_undo() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(FilterRequest::new(["towns"]).with_attribute("population > 100"))
        .unwrap();
    let reports = filter_reports(orch.wait_idle(WAIT));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ReportStatus::Applied);
    assert_eq!(reports[0].backend, Some(BackendKind::Generic));
    assert_eq!(reports[0].feature_count, Some(6));
    assert_eq!(commits.last("towns").as_deref(), Some("$id IN (5, 6, 7, 8, 9, 10)"));

    orch.submit_filter(
        FilterRequest::new(["towns"])
            .with_attribute("population < 200")
            .with_combine(CombineOperator::And),
    )
    .unwrap();
    filter_reports(orch.wait_idle(WAIT));
    assert_eq!(orch.current_subset(&towns()), Some("$id IN (5, 6, 7)"));

    let entry = orch.undo(&towns()).unwrap().unwrap().entries.remove(0);
    assert_eq!(entry.subset, "$id IN (5, 6, 7, 8, 9, 10)");
    assert_eq!(commits.last("towns").as_deref(), Some("$id IN (5, 6, 7, 8, 9, 10)"));

    let entry = orch.undo(&towns()).unwrap().unwrap().entries.remove(0);
    assert!(entry.is_unfiltered());
    assert_eq!(orch.current_subset(&towns()), None);
    assert!(orch.undo(&towns()).unwrap().is_none());

    let entry = orch.redo(&towns()).unwrap().unwrap().entries.remove(0);
    assert_eq!(entry.subset, "$id IN (5, 6, 7, 8, 9, 10)");
    assert!(orch.history(&towns()).unwrap().can_redo());
}

#[test]
fn test_embedded_filter_leaves_no_temp_tables() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("towns.sqlite");
    create_towns_db(&path);

    let host = MemoryHost::new();
    host.add(embedded_towns(), Vec::new());
    *host.embedded_path.lock().unwrap() = Some(path.clone());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    let handle = orch
        .submit_filter(FilterRequest::new(["towns"]).with_attribute("population > 100"))
        .unwrap();
    assert_eq!(handle.selections[0].kind, BackendKind::Embedded);

    let reports = filter_reports(orch.wait_idle(WAIT));
    assert_eq!(reports[0].status, ReportStatus::Applied, "{:?}", reports[0]);
    assert_eq!(reports[0].subset.as_deref(), Some("\"fid\" IN (5, 6, 7, 8, 9, 10)"));
    assert_eq!(reports[0].feature_count, Some(6));
    assert!(table_names(&path).iter().all(|t| !t.starts_with("_gf_tmp")));

    let history = orch.history(&towns()).unwrap();
    assert_eq!(history.entries().len(), 1);
    assert_eq!(history.entries()[0].feature_count, Some(6));
    assert_eq!(history.current().subset, "\"fid\" IN (5, 6, 7, 8, 9, 10)");
}

#[test]
fn test_missing_target_does_not_block_siblings() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    let handle = orch
        .submit_filter(FilterRequest::new(["towns", "ghost"]).with_attribute("population >= 250"))
        .unwrap();
    assert_eq!(handle.unavailable, vec![DatasetId::new("ghost")]);

    let reports = filter_reports(orch.wait_idle(WAIT));
    let status = |id: &str| reports.iter().find(|r| r.dataset.as_str() == id).unwrap().status;
    assert_eq!(status("ghost"), ReportStatus::Unavailable);
    assert_eq!(status("towns"), ReportStatus::Applied);

    // two targets means a global snapshot holding the dataset that succeeded
    let global = orch.global_history();
    assert_eq!(global.snapshots().len(), 1);
    assert_eq!(global.snapshots()[0].entries.len(), 1);

    let restored = orch.undo_global().unwrap().unwrap();
    assert_eq!(restored.entries.len(), 1);
    assert!(restored.warnings.is_empty());
    assert_eq!(commits.last("towns").as_deref(), Some(""));
    orch.redo_global().unwrap().unwrap();
    assert_eq!(commits.last("towns").as_deref(), Some("$id IN (10)"));
}

#[test]
fn test_sql_dataset_without_driver_falls_back() {
    let host = MemoryHost::new();
    let roads = DatasetHandle::new("roads", StorageKind::Sql)
        .with_table(TableRef::new("roads").with_schema("public"))
        .with_geometry_column("geom")
        .with_primary_key("gid")
        .with_field("population", FieldType::Integer);
    host.add(roads, towns_features());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(FilterRequest::new(["roads"]).with_attribute("population = 50"))
        .unwrap();
    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Applied);
    assert_eq!(report.backend, Some(BackendKind::Generic));
    assert!(report.fallback);
    assert!(report.warnings.iter().any(|w| w.contains("driver unavailable")));
    assert_eq!(report.subset.as_deref(), Some("$id IN (2)"));
}

#[test]
fn test_newer_request_supersedes_older() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(FilterRequest::new(["towns"]).with_attribute("population > 100"))
        .unwrap();
    orch.submit_filter(FilterRequest::new(["towns"]).with_attribute("population < 100"))
        .unwrap();
    let reports = filter_reports(orch.wait_idle(WAIT));
    assert_eq!(reports.len(), 2);
    let statuses: Vec<ReportStatus> = {
        let mut sorted = reports.clone();
        sorted.sort_by_key(|r| r.request);
        sorted.iter().map(|r| r.status).collect()
    };
    assert_eq!(statuses, vec![ReportStatus::Superseded, ReportStatus::Applied]);
    assert_eq!(orch.current_subset(&towns()), Some("$id IN (1, 2, 3)"));
    assert_eq!(orch.history(&towns()).unwrap().entries().len(), 1);
}

#[test]
fn test_approximated_predicate_warns() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    host.add(generic_towns("zones"), towns_features());
    host.select("zones", vec![3]);
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    let handle = orch
        .submit_filter(
            FilterRequest::new(["towns"])
                .with_predicate(Predicate::Within)
                .with_source(SourceGeometry::current_selection("zones"))
                .with_buffer(BufferSpec::new(1.5, BufferUnit::MapUnits)),
        )
        .unwrap();
    assert!(handle.warnings.iter().any(|w| w.contains("within")));
    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Applied, "{:?}", report.error);
    assert_eq!(report.subset.as_deref(), Some("$id IN (2, 3, 4)"));
}

#[test]
fn test_history_survives_restart() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let commits = Commits::default();
    {
        let mut orch = orchestrator(&host, &commits, Some(store.clone()));
        orch.submit_filter(FilterRequest::new(["towns"]).with_attribute("population > 200"))
            .unwrap();
        orch.wait_idle(WAIT);
        orch.reset(&[towns()]).unwrap();
        orch.shutdown();
    }

    let mut orch = orchestrator(&host, &commits, Some(store));
    assert!(orch.restore_history(&towns()).unwrap());
    assert_eq!(orch.current_subset(&towns()), None);
    let entry = orch.undo(&towns()).unwrap().unwrap().entries.remove(0);
    assert_eq!(entry.subset, "$id IN (9, 10)");
    assert_eq!(orch.current_subset(&towns()), Some("$id IN (9, 10)"));
}

#[test]
fn test_failed_filter_leaves_history_untouched() {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(FilterRequest::new(["towns"]).with_attribute("elevation > 3"))
        .unwrap();
    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.error.is_some());
    assert_eq!(commits.count(), 0);
    assert!(orch.history(&towns()).is_none());
}

#[derive(Default)]
struct SqlLog {
    statements: Vec<String>,
    relations: BTreeSet<String>,
}

struct Flag(Arc<AtomicBool>);

impl StatementCanceler for Flag {
    fn cancel_statement(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Session whose CREATE INDEX runs until the statement is canceled
struct SlowIndexSession {
    log: Arc<Mutex<SqlLog>>,
    canceled: Arc<AtomicBool>,
}

impl SqlSession for SlowIndexSession {
    fn execute(&mut self, sql: &str) -> Result<u64> {
        {
            let mut log = self.log.lock().unwrap();
            log.statements.push(sql.to_string());
            let words: Vec<&str> = sql.split_whitespace().collect();
            if sql.starts_with("CREATE UNLOGGED TABLE") {
                log.relations.insert(words[3].to_string());
            } else if sql.starts_with("DROP TABLE IF EXISTS") {
                log.relations.remove(words[4]);
            }
        }
        if sql.starts_with("CREATE INDEX") {
            while !self.canceled.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            return Err(FilterError::Other("canceling statement due to user request".to_string()));
        }
        Ok(0)
    }

    fn query_count(&mut self, _sql: &str) -> Result<u64> {
        Ok(0)
    }

    fn canceler(&self) -> Arc<dyn StatementCanceler> {
        Arc::new(Flag(self.canceled.clone()))
    }
}

/// SQL dataset whose index build blocks until canceled
fn slow_roads(host: &Arc<MemoryHost>) -> Arc<Mutex<SqlLog>> {
    let roads = DatasetHandle::new("roads", StorageKind::Sql)
        .with_table(TableRef::new("roads").with_schema("public"))
        .with_connection("pg:main")
        .with_geometry_column("geom")
        .with_primary_key("gid")
        .with_feature_count(100);
    host.add(roads, Vec::new());
    let log = Arc::new(Mutex::new(SqlLog::default()));
    let session_log = log.clone();
    *host.sql.lock().unwrap() = Some(Box::new(move || {
        Box::new(SlowIndexSession {
            log: session_log.clone(),
            canceled: Arc::new(AtomicBool::new(false)),
        }) as Box<dyn SqlSession>
    }));
    log
}

fn buffered_point_request() -> FilterRequest {
    FilterRequest::new(["roads"])
        .with_predicate(Predicate::Intersects)
        .with_source(SourceGeometry::Wkt {
            wkt: "POINT (2 48)".to_string(),
            crs: geofilter_core::dataset::Crs::wgs84(),
        })
        .with_buffer(BufferSpec::new(100.0, BufferUnit::Meters))
}

fn wait_for_index_build(log: &Mutex<SqlLog>) {
    let started = std::time::Instant::now();
    while !log.lock().unwrap().statements.iter().any(|s| s.starts_with("CREATE INDEX")) {
        assert!(started.elapsed() < WAIT, "index build never started");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_cancel_during_index_build_drops_relation() {
    let host = MemoryHost::new();
    let log = slow_roads(&host);
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    let handle = orch.submit_filter(buffered_point_request()).unwrap();
    assert_eq!(handle.selections[0].kind, BackendKind::Sql);

    wait_for_index_build(&log);
    assert_eq!(orch.cancel_request(handle.id), 1);

    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Canceled);
    assert_eq!(report.code, Some(4));
    assert_eq!(commits.count(), 0);
    assert!(log.lock().unwrap().relations.is_empty());
}

#[test]
fn test_cancel_all_reports_canceled() {
    let host = MemoryHost::new();
    let log = slow_roads(&host);
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(buffered_point_request()).unwrap();
    wait_for_index_build(&log);
    orch.cancel_all();

    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Canceled);
    assert!(report.error.is_some());
    assert_eq!(report.code, Some(4));
    assert!(orch.history(&DatasetId::new("roads")).is_none());
}

#[test]
fn test_cancel_dataset_is_not_superseded() {
    let host = MemoryHost::new();
    let log = slow_roads(&host);
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, None);

    orch.submit_filter(buffered_point_request()).unwrap();
    wait_for_index_build(&log);
    assert!(orch.cancel_dataset(&DatasetId::new("roads")));

    let report = filter_reports(orch.wait_idle(WAIT)).remove(0);
    assert_eq!(report.status, ReportStatus::Canceled);
}

fn towns_and_zones() -> Arc<MemoryHost> {
    let host = MemoryHost::new();
    host.add(generic_towns("towns"), towns_features());
    host.add(generic_towns("zones"), towns_features());
    host
}

#[test]
fn test_global_undo_moves_dataset_timelines() {
    let host = towns_and_zones();
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let commits = Commits::default();
    let zones = DatasetId::new("zones");
    {
        let mut orch = orchestrator(&host, &commits, Some(store.clone()));
        orch.submit_filter(FilterRequest::new(["towns", "zones"]).with_attribute("population > 200"))
            .unwrap();
        orch.wait_idle(WAIT);

        let replay = orch.undo_global().unwrap().unwrap();
        assert_eq!(replay.entries.len(), 2);
        for dataset in [towns(), zones.clone()] {
            let history = orch.history(&dataset).unwrap();
            assert_eq!(history.cursor(), 0);
            assert!(history.current().is_unfiltered());
            assert!(history.can_redo());
            assert_eq!(orch.current_subset(&dataset), None);
        }

        orch.redo_global().unwrap().unwrap();
        assert_eq!(orch.history(&towns()).unwrap().cursor(), 1);
        assert_eq!(orch.current_subset(&zones), Some("$id IN (9, 10)"));

        orch.undo_global().unwrap().unwrap();
        orch.shutdown();
    }

    // a new session sees the undone state, so combining starts from no filter
    let mut orch = orchestrator(&host, &commits, Some(store));
    assert!(orch.restore_history(&towns()).unwrap());
    assert!(orch.restore_history(&zones).unwrap());
    assert!(orch.restore_global_history().unwrap());
    assert_eq!(orch.current_subset(&towns()), None);

    orch.submit_filter(
        FilterRequest::new(["towns", "zones"])
            .with_attribute("population < 100")
            .with_combine(CombineOperator::And),
    )
    .unwrap();
    orch.wait_idle(WAIT);
    assert_eq!(orch.current_subset(&towns()), Some("$id IN (1, 2, 3)"));
    let global = orch.global_history();
    assert_eq!(global.snapshots().len(), 1);
    assert!(global.snapshots()[0].previous[&zones].is_unfiltered());
}

/// Store whose writes always fail
struct ReadOnlyStore;

impl RecordStore for ReadOnlyStore {
    fn get(&self, _key: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn put(&self, key: &str, _record: &serde_json::Value) -> Result<()> {
        Err(FilterError::persistence(key, "attempt to write a readonly database"))
    }

    fn list(&self, _prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_unsaved_history_is_reported() {
    let host = towns_and_zones();
    let commits = Commits::default();
    let mut orch = orchestrator(&host, &commits, Some(Arc::new(ReadOnlyStore)));

    orch.submit_filter(FilterRequest::new(["towns", "zones"]).with_attribute("population > 200"))
        .unwrap();
    let reports = filter_reports(orch.wait_idle(WAIT));
    let warnings: Vec<&String> = reports.iter().flat_map(|r| &r.warnings).collect();
    assert!(warnings.iter().any(|w| w.contains("history of towns not persisted")));
    assert!(warnings.iter().any(|w| w.starts_with("global history not persisted")));

    let replay = orch.undo(&towns()).unwrap().unwrap();
    assert_eq!(replay.entries.len(), 1);
    assert!(replay.warnings[0].contains("history of towns not persisted"));

    let replay = orch.redo_global().unwrap();
    assert!(replay.is_none());
    let replay = orch.undo_global().unwrap().unwrap();
    assert!(replay.warnings.iter().any(|w| w.starts_with("global history not persisted")));

    let replay = orch.reset(&[towns(), DatasetId::new("zones")]).unwrap();
    assert_eq!(replay.entries.len(), 2);
    assert_eq!(replay.warnings.len(), 3);
}
