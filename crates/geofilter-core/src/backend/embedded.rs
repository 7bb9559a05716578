//! Embedded spatial database backend (SpatiaLite dialect)
//!
//! The filter result is written to a connection-local TEMP table, indexed,
//! and read back as a list of primary keys. The subset handed to the host is that key list,
//! so it never depends on the temporary table, which is dropped on cleanup.
//! Lock contention on the database file is retried with exponential backoff.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, ErrorCode, InterruptHandle};

use super::retry::{RetryError, RetryPolicy};
use super::sql::{qualified_table, StatementCanceler};
use super::{
    artifact_name, validate_input, AppliedFilter, Artifact, ArtifactKind, Backend, BackendKind,
    ExpressionInput, FilterExpression, PredicateSupport,
};
use crate::cache::PreparedGeometry;
use crate::config::EmbeddedConfig;
use crate::dataset::{DatasetHandle, FeatureId};
use crate::error::{FilterError, Result};
use crate::expression::{self, quote_ident, quote_literal};
use crate::host::ConnectionProvider;
use crate::request::{BufferSpec, CombineOperator, Predicate};
use crate::task::TaskContext;

/// Failure of one statement on the embedded store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database file is locked by another connection
    Locked(String),
    /// The statement was interrupted
    Interrupted,
    Failed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Locked(msg) => write!(f, "database locked: {}", msg),
            StoreError::Interrupted => write!(f, "statement interrupted"),
            StoreError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Locked(err.to_string())
            }
            Some(ErrorCode::OperationInterrupted) => StoreError::Interrupted,
            _ => StoreError::Failed(err.to_string()),
        }
    }
}

/// A connection to an embedded database file
pub trait EmbeddedStore: Send {
    fn execute(&mut self, sql: &str) -> std::result::Result<(), StoreError>;

    /// Run a query whose first column is a feature id
    fn query_ids(&mut self, sql: &str) -> std::result::Result<Vec<FeatureId>, StoreError>;

    /// Whether the spatial extension functions are loaded
    fn has_spatial_functions(&mut self) -> bool;

    /// Handle interrupting the running statement from another thread
    fn interrupter(&self) -> Option<Arc<dyn StatementCanceler>> {
        None
    }

    fn close(&mut self) {}
}

struct Interrupter(InterruptHandle);

impl StatementCanceler for Interrupter {
    fn cancel_statement(&self) {
        self.0.interrupt();
    }
}

/// [`EmbeddedStore`] over a rusqlite connection
pub struct SqliteStore {
    conn: Option<Connection>,
    spatial: Option<bool>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> std::result::Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            spatial: None,
        }
    }

    fn conn(&self) -> std::result::Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::Failed("store is closed".to_string()))
    }
}

impl EmbeddedStore for SqliteStore {
    fn execute(&mut self, sql: &str) -> std::result::Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn query_ids(&mut self, sql: &str) -> std::result::Result<Vec<FeatureId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, FeatureId>(0))?;
        let ids: rusqlite::Result<Vec<FeatureId>> = rows.collect();
        Ok(ids?)
    }

    fn has_spatial_functions(&mut self) -> bool {
        if let Some(spatial) = self.spatial {
            return spatial;
        }
        let spatial = self
            .conn()
            .map(|c| c.query_row("SELECT spatialite_version()", [], |_| Ok(())).is_ok())
            .unwrap_or(false);
        self.spatial = Some(spatial);
        spatial
    }

    fn interrupter(&self) -> Option<Arc<dyn StatementCanceler>> {
        let handle = self.conn.as_ref()?.get_interrupt_handle();
        Some(Arc::new(Interrupter(handle)))
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "failed to close embedded store");
            }
        }
    }
}

fn spatialite_function(predicate: Predicate) -> &'static str {
    match predicate {
        Predicate::Intersects => "ST_Intersects",
        Predicate::Within => "ST_Within",
        Predicate::Contains => "ST_Contains",
        Predicate::Overlaps => "ST_Overlaps",
        Predicate::Crosses => "ST_Crosses",
        Predicate::Touches => "ST_Touches",
        Predicate::Disjoint => "ST_Disjoint",
        Predicate::Equals => "ST_Equals",
    }
}

fn source_expression(
    source: &PreparedGeometry,
    buffer: Option<&BufferSpec>,
    target: &DatasetHandle,
) -> Result<String> {
    let srid = source.crs.srid().or(target.crs.srid()).unwrap_or(0);
    let mut sql = format!("GeomFromText({}, {})", quote_literal(&source.wkt), srid);
    if source.crs != target.crs {
        match (source.crs.srid(), target.crs.srid()) {
            (Some(_), Some(to)) => sql = format!("ST_Transform({}, {})", sql, to),
            _ => {
                return Err(FilterError::CrsMismatch {
                    source_crs: source.crs.to_string(),
                    target_crs: target.crs.to_string(),
                })
            }
        }
    }
    if let Some(buffer) = buffer.filter(|b| !b.is_zero()) {
        sql = format!(
            "ST_Buffer({}, {}, {})",
            sql,
            buffer.distance_in(&target.crs),
            buffer.style.segments
        );
    }
    Ok(sql)
}

pub struct EmbeddedBackend {
    config: EmbeddedConfig,
    policy: RetryPolicy,
    make_valid: bool,
    connections: Arc<dyn ConnectionProvider>,
    store: Option<Box<dyn EmbeddedStore>>,
    pending: Vec<Artifact>,
    counter: u64,
}

impl EmbeddedBackend {
    pub fn new(
        config: EmbeddedConfig,
        make_valid: bool,
        connections: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            policy: config.retry_policy(),
            config,
            make_valid,
            connections,
            store: None,
            pending: Vec::new(),
            counter: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn open(&mut self, dataset: &DatasetHandle) -> Result<()> {
        if self.store.is_none() {
            let store = self.connections.open_embedded(dataset).map_err(|e| match e {
                FilterError::Connection { .. } => e,
                other => FilterError::Connection {
                    dataset: dataset.id.clone(),
                    reason: other.to_string(),
                },
            })?;
            self.store = Some(store);
        }
        Ok(())
    }

    fn store_mut(&mut self) -> Result<&mut Box<dyn EmbeddedStore>> {
        self.store
            .as_mut()
            .ok_or_else(|| FilterError::Other("embedded store unavailable".to_string()))
    }
}

/// Statements of one create-index-read attempt
struct Materialization<'a> {
    table: String,
    temp: &'a str,
    pk: String,
    geom: String,
    combined: &'a str,
}

impl Materialization<'_> {
    fn attempt(
        &self,
        store: &mut dyn EmbeddedStore,
        ctx: &TaskContext,
        attempt: u32,
    ) -> std::result::Result<Vec<FeatureId>, StoreError> {
        let temp = quote_ident(self.temp);
        if attempt > 1 {
            store.execute(&format!("DROP TABLE IF EXISTS {}", temp))?;
        }
        store.execute(&format!(
            "CREATE TEMP TABLE {} AS SELECT {}, {} FROM {} WHERE {}",
            temp, self.pk, self.geom, self.table, self.combined
        ))?;
        ctx.set_progress(40);
        store.execute(&format!(
            "CREATE INDEX {} ON {} ({})",
            quote_ident(&format!("{}_pk", self.temp)),
            temp,
            self.pk
        ))?;
        if store.has_spatial_functions() {
            let spatial_index = format!(
                "SELECT CreateSpatialIndex({}, {})",
                quote_literal(self.temp),
                quote_literal(self.geom.trim_matches('"'))
            );
            match store.execute(&spatial_index) {
                Err(StoreError::Failed(reason)) => {
                    tracing::debug!(table = self.temp, reason = %reason, "spatial index not created");
                }
                other => other?,
            }
        }
        ctx.set_progress(70);
        store.query_ids(&format!("SELECT {} FROM {} ORDER BY {}", self.pk, temp, self.pk))
    }
}

impl Backend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn supports_predicates(&self) -> PredicateSupport {
        PredicateSupport::all_exact()
    }

    fn build_expression(
        &self,
        dataset: &DatasetHandle,
        input: &ExpressionInput,
    ) -> Result<FilterExpression> {
        let attribute =
            validate_input(BackendKind::Embedded, &self.supports_predicates(), dataset, input)?;
        dataset.require_table()?;
        let (geom, _) = dataset.require_keys()?;

        let spatial = match input.source.as_deref() {
            Some(source) if !input.predicates.is_empty() => {
                let target = if self.make_valid {
                    format!("MakeValid({})", quote_ident(geom))
                } else {
                    quote_ident(geom)
                };
                let source = source_expression(source, input.buffer.as_ref(), dataset)?;
                let parts: Vec<String> = input
                    .predicates
                    .iter()
                    .map(|p| format!("{}({}, {})", spatialite_function(*p), target, source))
                    .collect();
                Some(if parts.len() == 1 {
                    parts.join("")
                } else {
                    format!("({})", parts.join(" OR "))
                })
            }
            _ => None,
        };
        let attribute = attribute.map(|a| a.to_sql());
        let text = expression::and_all([spatial.as_deref(), attribute.as_deref()].into_iter().flatten())
            .ok_or_else(|| FilterError::invalid_expression("empty embedded filter"))?;

        Ok(FilterExpression {
            backend: BackendKind::Embedded,
            text,
            spatial,
            attribute,
            predicate_count: input.predicates.len(),
            buffered: input.buffer.is_some_and(|b| !b.is_zero()) && !input.predicates.is_empty(),
            plan: None,
        })
    }

    fn apply_filter(
        &mut self,
        ctx: &TaskContext,
        dataset: &DatasetHandle,
        expression: &FilterExpression,
        existing_subset: Option<&str>,
        combine: CombineOperator,
    ) -> Result<AppliedFilter> {
        ctx.check_canceled()?;
        let (geom, pk) = dataset.require_keys()?;
        let table = qualified_table(dataset.require_table()?);
        self.open(dataset)?;

        self.counter += 1;
        let temp = artifact_name(&self.config.temp_prefix, &dataset.id, self.counter);
        self.pending.push(Artifact {
            kind: ArtifactKind::TempTable,
            dataset: dataset.id.clone(),
            name: quote_ident(&temp),
        });

        let combined = expression::combine(existing_subset, &expression.text, combine);
        let plan = Materialization {
            table,
            temp: &temp,
            pk: quote_ident(pk),
            geom: quote_ident(geom),
            combined: &combined,
        };

        let policy = self.policy.clone();
        let store = self.store_mut()?;
        let hook = store
            .interrupter()
            .map(|interrupter| ctx.on_cancel(move || interrupter.cancel_statement()));
        let result = policy.run(
            || ctx.is_canceled(),
            |e: &StoreError| matches!(e, StoreError::Locked(_)),
            |attempt| plan.attempt(store.as_mut(), ctx, attempt),
        );
        if let Some(hook) = hook {
            ctx.remove_hook(hook);
        }

        let ids = result.map_err(|e| match e {
            RetryError::Canceled | RetryError::Fatal(StoreError::Interrupted) => FilterError::Canceled,
            _ if ctx.is_canceled() => FilterError::Canceled,
            RetryError::Exhausted { attempts, last } => {
                tracing::warn!(dataset = %dataset.id, attempts, error = %last, "storage stayed locked");
                FilterError::StorageLocked {
                    dataset: dataset.id.clone(),
                    attempts,
                }
            }
            RetryError::Fatal(e) => FilterError::storage(&dataset.id, e),
        })?;

        ctx.set_progress(90);
        Ok(AppliedFilter {
            subset: expression::id_list_expression(&quote_ident(pk), &ids),
            feature_count: ids.len() as u64,
            backend: BackendKind::Embedded,
            retained: Vec::new(),
            skipped: 0,
        })
    }

    fn drop_artifacts(
        &mut self,
        _ctx: &TaskContext,
        dataset: &DatasetHandle,
        artifacts: &[Artifact],
    ) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }
        self.open(dataset)?;
        let store = self.store_mut()?;
        for artifact in artifacts {
            store
                .execute(&format!("DROP TABLE IF EXISTS {}", artifact.name))
                .map_err(|e| FilterError::storage(&dataset.id, e))?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if let Some(store) = self.store.as_mut() {
            for artifact in &pending {
                if let Err(e) = store.execute(&format!("DROP TABLE IF EXISTS {}", artifact.name)) {
                    tracing::warn!(table = %artifact.name, error = %e, "failed to drop temporary table");
                }
            }
        }
        if let Some(mut store) = self.store.take() {
            store.close();
        }
    }
}

impl Drop for EmbeddedBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::retry::RecordingSleeper;
    use crate::backend::sql::SqlSession;
    use crate::dataset::{Crs, FieldType, StorageKind, TableRef};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Store failing the first `locked` CREATE TEMP TABLE statements
    struct ContendedStore {
        locked: u32,
        statements: Arc<Mutex<Vec<String>>>,
    }

    impl EmbeddedStore for ContendedStore {
        fn execute(&mut self, sql: &str) -> std::result::Result<(), StoreError> {
            self.statements.lock().unwrap().push(sql.to_string());
            if sql.starts_with("CREATE TEMP TABLE") && self.locked > 0 {
                self.locked -= 1;
                return Err(StoreError::Locked("database is locked".to_string()));
            }
            Ok(())
        }

        fn query_ids(&mut self, _sql: &str) -> std::result::Result<Vec<FeatureId>, StoreError> {
            Ok(vec![2, 5])
        }

        fn has_spatial_functions(&mut self) -> bool {
            true
        }
    }

    struct OneStore(Mutex<Option<Box<dyn EmbeddedStore>>>);

    impl ConnectionProvider for OneStore {
        fn sql_driver_available(&self) -> bool {
            false
        }

        fn open_sql(&self, dataset: &DatasetHandle) -> Result<Box<dyn SqlSession>> {
            Err(FilterError::Connection {
                dataset: dataset.id.clone(),
                reason: "no driver".to_string(),
            })
        }

        fn open_embedded(&self, dataset: &DatasetHandle) -> Result<Box<dyn EmbeddedStore>> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| FilterError::Connection {
                    dataset: dataset.id.clone(),
                    reason: "store already taken".to_string(),
                })
        }
    }

    fn towns() -> DatasetHandle {
        DatasetHandle::new("towns", StorageKind::Embedded)
            .with_table(TableRef::new("towns"))
            .with_geometry_column("geom")
            .with_primary_key("fid")
            .with_field("population", FieldType::Integer)
            .with_crs(Crs::wgs84())
    }

    fn contended(locked: u32) -> (EmbeddedBackend, Arc<RecordingSleeper>, Arc<Mutex<Vec<String>>>) {
        let statements = Arc::new(Mutex::new(Vec::new()));
        let store: Box<dyn EmbeddedStore> = Box::new(ContendedStore {
            locked,
            statements: statements.clone(),
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_sleeper(sleeper.clone());
        let backend = EmbeddedBackend::new(
            EmbeddedConfig::default(),
            false,
            Arc::new(OneStore(Mutex::new(Some(store)))),
        )
        .with_retry_policy(policy);
        (backend, sleeper, statements)
    }

    fn attribute_expression(backend: &EmbeddedBackend) -> FilterExpression {
        let input = ExpressionInput {
            attribute: Some("population > 100".to_string()),
            ..Default::default()
        };
        backend.build_expression(&towns(), &input).unwrap()
    }

    #[test]
    fn test_lock_contention_retries_with_backoff() {
        let (mut backend, sleeper, statements) = contended(4);
        let expr = attribute_expression(&backend);
        let ctx = TaskContext::detached();
        let applied = backend
            .apply_filter(&ctx, &towns(), &expr, None, CombineOperator::Replace)
            .unwrap();

        assert_eq!(applied.subset, "\"fid\" IN (2, 5)");
        assert_eq!(applied.feature_count, 2);
        assert_eq!(sleeper.total(), Duration::from_millis(1500));
        let creates = statements
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.starts_with("CREATE TEMP TABLE"))
            .count();
        assert_eq!(creates, 5);

        backend.cleanup();
        assert!(statements
            .lock()
            .unwrap()
            .last()
            .unwrap()
            .starts_with("DROP TABLE IF EXISTS \"_gf_tmp_towns_1_"));
    }

    #[test]
    fn test_persistent_lock_gives_storage_locked() {
        let (mut backend, sleeper, _) = contended(u32::MAX);
        let expr = attribute_expression(&backend);
        let err = backend
            .apply_filter(&TaskContext::detached(), &towns(), &expr, None, CombineOperator::Replace)
            .unwrap_err();
        assert!(matches!(err, FilterError::StorageLocked { attempts: 5, .. }));
        assert_eq!(sleeper.delays().len(), 4);
        assert_eq!(err.exit_code(), crate::error::ExitCode::Transient);
    }

    #[test]
    fn test_buffered_source_expression() {
        let (backend, _, _) = contended(0);
        let source = PreparedGeometry::from_wkt("POINT (10 20)", &Crs::wgs84(), true).unwrap();
        let input = ExpressionInput {
            predicates: vec![Predicate::Intersects],
            source: Some(Arc::new(source)),
            buffer: Some(BufferSpec::new(1.0, crate::request::BufferUnit::MapUnits)),
            ..Default::default()
        };
        let expr = backend.build_expression(&towns(), &input).unwrap();
        assert!(expr.text.starts_with("ST_Intersects(\"geom\", ST_Buffer(GeomFromText('POINT"));
        assert!(expr.text.ends_with(", 4326), 1, 8))"));
        assert!(expr.buffered);
    }

    #[test]
    fn test_sqlite_attribute_filter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("towns.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE towns (fid INTEGER PRIMARY KEY, geom TEXT, population INTEGER);")
            .unwrap();
        for fid in 1..=10 {
            conn.execute(
                "INSERT INTO towns VALUES (?1, ?2, ?3)",
                rusqlite::params![fid, format!("POINT ({} 0)", fid), fid * 25],
            )
            .unwrap();
        }
        drop(conn);

        let store: Box<dyn EmbeddedStore> = Box::new(SqliteStore::open(&path).unwrap());
        let mut backend = EmbeddedBackend::new(
            EmbeddedConfig::default(),
            false,
            Arc::new(OneStore(Mutex::new(Some(store)))),
        );
        let expr = attribute_expression(&backend);
        let ctx = TaskContext::detached();
        let applied = backend
            .apply_filter(&ctx, &towns(), &expr, Some("fid <> 6"), CombineOperator::And)
            .unwrap();
        assert_eq!(applied.subset, "\"fid\" IN (5, 7, 8, 9, 10)");
        assert_eq!(applied.feature_count, 5);

        let leftovers = |path: &Path| -> i64 {
            Connection::open(path)
                .unwrap()
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE '_gf_tmp%'",
                    [],
                    |row| row.get(0),
                )
                .unwrap()
        };
        // never written to the file, so an abandoned connection leaves nothing behind
        assert_eq!(leftovers(&path), 0);
        backend.cleanup();
        backend.cleanup();
        assert_eq!(leftovers(&path), 0);
    }

    #[test]
    fn test_locked_sqlite_error_maps_to_locked() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(matches!(StoreError::from(err), StoreError::Locked(_)));
    }
}
