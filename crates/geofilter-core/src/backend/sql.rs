//! Full SQL/spatial database backend (PostGIS dialect)
//!
//! Predicates are pushed to the server. Large or expensive results are
//! materialized into an unlogged relation with a GIST index so the host's
//! repeated reads of the subset stay cheap.

use std::sync::Arc;

use super::{
    artifact_name, validate_input, AppliedFilter, Artifact, ArtifactKind, Backend, BackendKind,
    ExpressionInput, FilterExpression, PredicateSupport,
};
use crate::cache::PreparedGeometry;
use crate::config::SqlConfig;
use crate::dataset::{DatasetHandle, StorageKind, TableRef};
use crate::error::{FilterError, Result};
use crate::expression::{self, quote_ident, quote_literal};
use crate::host::ConnectionProvider;
use crate::request::{BufferSpec, CombineOperator, Predicate};
use crate::task::TaskContext;

/// Interrupts the statement currently running on a session
pub trait StatementCanceler: Send + Sync {
    fn cancel_statement(&self);
}

/// A session on the full database, provided by the host driver
pub trait SqlSession: Send {
    /// Run a statement, returning affected rows
    fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a `SELECT COUNT(*)` style query
    fn query_count(&mut self, sql: &str) -> Result<u64>;

    /// Handle usable from another thread to cancel the running statement
    fn canceler(&self) -> Arc<dyn StatementCanceler>;

    fn close(&mut self) {}
}

fn st_function(predicate: Predicate) -> &'static str {
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

pub(crate) fn qualified_table(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

/// `ST_Buffer` style parameter string
pub(crate) fn buffer_parameters(buffer: &BufferSpec) -> String {
    format!(
        "'quad_segs={} endcap={}'",
        buffer.style.segments,
        buffer.style.end_cap.as_str()
    )
}

pub struct SqlBackend {
    config: SqlConfig,
    make_valid: bool,
    connections: Arc<dyn ConnectionProvider>,
    session: Option<Box<dyn SqlSession>>,
    /// Created but not (yet) retained by a successful apply
    pending: Vec<Artifact>,
    counter: u64,
}

impl SqlBackend {
    pub fn new(config: SqlConfig, make_valid: bool, connections: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            config,
            make_valid,
            connections,
            session: None,
            pending: Vec::new(),
            counter: 0,
        }
    }

    fn session(&mut self, dataset: &DatasetHandle) -> Result<&mut Box<dyn SqlSession>> {
        if self.session.is_none() {
            let session = self.connections.open_sql(dataset).map_err(|e| match e {
                FilterError::Connection { .. } => e,
                other => FilterError::Connection {
                    dataset: dataset.id.clone(),
                    reason: other.to_string(),
                },
            })?;
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| FilterError::Other("SQL session unavailable".to_string()))
    }

    /// Run one statement, polling cancellation first
    fn run(&mut self, ctx: &TaskContext, dataset: &DatasetHandle, sql: &str) -> Result<u64> {
        ctx.check_canceled()?;
        tracing::debug!(dataset = %dataset.id, sql, "executing");
        let result = self.session(dataset)?.execute(sql);
        cancel_aware(ctx, result)
    }

    fn count(&mut self, ctx: &TaskContext, dataset: &DatasetHandle, sql: &str) -> Result<u64> {
        ctx.check_canceled()?;
        tracing::debug!(dataset = %dataset.id, sql, "counting");
        let result = self.session(dataset)?.query_count(sql);
        cancel_aware(ctx, result)
    }

    fn should_materialize(
        &self,
        dataset: &DatasetHandle,
        expression: &FilterExpression,
        existing: Option<&str>,
        combine: CombineOperator,
    ) -> bool {
        // a combined subset must not depend on a relation that may be retired
        let builds_on_relation = combine != CombineOperator::Replace
            && existing.is_some_and(|e| e.contains(&format!("{}_", self.config.relation_prefix)));
        expression.buffered
            || expression.predicate_count >= self.config.materialize_predicate_threshold
            || dataset.feature_count >= self.config.materialize_feature_threshold
            || builds_on_relation
    }

    fn materialize(
        &mut self,
        ctx: &TaskContext,
        dataset: &DatasetHandle,
        combined: &str,
    ) -> Result<(String, u64, Artifact)> {
        let table = dataset.require_table()?;
        let (geom, pk) = dataset.require_keys()?;
        let (geom, pk) = (quote_ident(geom), quote_ident(pk));
        self.counter += 1;
        let name = artifact_name(&self.config.relation_prefix, &dataset.id, self.counter);
        let relation = match self.config.relation_schema.as_ref().or(table.schema.as_ref()) {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&name)),
            None => quote_ident(&name),
        };
        let artifact = Artifact {
            kind: ArtifactKind::MaterializedRelation,
            dataset: dataset.id.clone(),
            name: relation.clone(),
        };

        let create = format!(
            "CREATE UNLOGGED TABLE {} AS SELECT {}, {} FROM {} WHERE {}",
            relation,
            pk,
            geom,
            qualified_table(table),
            combined
        );
        // tracked before running so a failed or canceled create is still dropped
        self.pending.push(artifact.clone());
        self.run(ctx, dataset, &create)?;
        ctx.set_progress(40);

        let index = format!(
            "CREATE INDEX {} ON {} USING GIST ({})",
            quote_ident(&format!("{}_gix", name)),
            relation,
            geom
        );
        self.run(ctx, dataset, &index)?;
        ctx.set_progress(70);
        self.run(ctx, dataset, &format!("ANALYZE {}", relation))?;
        let count = self.count(ctx, dataset, &format!("SELECT COUNT(*) FROM {}", relation))?;
        ctx.set_progress(90);

        let subset = format!("{} IN (SELECT {} FROM {})", pk, pk, relation);
        Ok((subset, count, artifact))
    }

    fn drop_relation(&mut self, dataset: &DatasetHandle, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", name);
        tracing::debug!(dataset = %dataset.id, sql = %sql, "dropping artifact");
        self.session(dataset)?.execute(&sql).map(|_| ())
    }
}

fn cancel_aware<T>(ctx: &TaskContext, result: Result<T>) -> Result<T> {
    match result {
        Err(_) if ctx.is_canceled() => Err(FilterError::Canceled),
        other => other,
    }
}

/// Source geometry as an SQL expression in the target SRID
fn inline_source(source: &PreparedGeometry, target: &DatasetHandle) -> Result<String> {
    let source_srid = source.crs.srid();
    let target_srid = target.crs.srid();
    let literal = format!(
        "ST_GeomFromText({}, {})",
        quote_literal(&source.wkt),
        source_srid.or(target_srid).unwrap_or(0)
    );
    if source.crs == target.crs {
        return Ok(literal);
    }
    match target_srid {
        Some(srid) if source_srid.is_some() => Ok(format!("ST_Transform({}, {})", literal, srid)),
        _ => Err(FilterError::CrsMismatch {
            source_crs: source.crs.to_string(),
            target_crs: target.crs.to_string(),
        }),
    }
}

fn buffered(geometry: String, buffer: Option<&BufferSpec>, target: &DatasetHandle) -> String {
    let Some(buffer) = buffer.filter(|b| !b.is_zero()) else {
        return geometry;
    };
    let params = buffer_parameters(buffer);
    match buffer.metres() {
        Some(metres) if target.crs.is_geographic() => format!(
            "ST_Buffer(({})::geography, {}, {})::geometry",
            geometry, metres, params
        ),
        _ => format!(
            "ST_Buffer({}, {}, {})",
            geometry,
            buffer.distance_in(&target.crs),
            params
        ),
    }
}

fn or_join(parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(" OR "))
    }
}

impl SqlBackend {
    fn target_geometry(&self, dataset: &DatasetHandle) -> Result<String> {
        let table = dataset.require_table()?;
        let (geom, _) = dataset.require_keys()?;
        let column = format!("{}.{}", qualified_table(table), quote_ident(geom));
        Ok(if self.make_valid {
            format!("ST_MakeValid({})", column)
        } else {
            column
        })
    }

    /// Source on the same connection: reference its rows instead of inlining WKT
    fn same_database_source<'a>(
        &self,
        dataset: &DatasetHandle,
        input: &'a ExpressionInput,
    ) -> Option<&'a DatasetHandle> {
        let source = input.source_dataset.as_ref()?;
        let prepared = input.source.as_ref()?;
        let shares_connection = source.storage == StorageKind::Sql
            && source.connection.is_some()
            && source.connection == dataset.connection;
        (shares_connection
            && source.table.is_some()
            && source.require_keys().is_ok()
            && !prepared.feature_ids.is_empty()
            && (source.crs == dataset.crs || (source.crs.srid().is_some() && dataset.crs.srid().is_some())))
        .then_some(source)
    }

    fn exists_spatial(
        &self,
        dataset: &DatasetHandle,
        source: &DatasetHandle,
        input: &ExpressionInput,
        target: &str,
    ) -> Result<String> {
        let table = source.require_table()?;
        let (geom, pk) = source.require_keys()?;
        let ids = input
            .source
            .as_ref()
            .map(|p| p.feature_ids.as_slice())
            .unwrap_or_default();
        let alias = quote_ident("__gf_src");
        let mut source_geom = format!("{}.{}", alias, quote_ident(geom));
        if source.crs != dataset.crs {
            if let Some(srid) = dataset.crs.srid() {
                source_geom = format!("ST_Transform({}, {})", source_geom, srid);
            }
        }
        let source_geom = buffered(source_geom, input.buffer.as_ref(), dataset);
        let selection = expression::id_list_expression(&format!("{}.{}", alias, quote_ident(pk)), ids);
        let from = format!("FROM {} AS {} WHERE {}", qualified_table(table), alias, selection);

        let mut parts = Vec::new();
        let positive: Vec<String> = input
            .predicates
            .iter()
            .filter(|p| **p != Predicate::Disjoint)
            .map(|p| format!("{}({}, {})", st_function(*p), target, source_geom))
            .collect();
        if !positive.is_empty() {
            parts.push(format!("EXISTS (SELECT 1 {} AND {})", from, or_join(positive)));
        }
        if input.predicates.contains(&Predicate::Disjoint) {
            // disjoint from the whole selection, not from any one feature
            parts.push(format!(
                "NOT EXISTS (SELECT 1 {} AND ST_Intersects({}, {}))",
                from, target, source_geom
            ));
        }
        Ok(or_join(parts))
    }

    fn inline_spatial(
        &self,
        dataset: &DatasetHandle,
        input: &ExpressionInput,
        target: &str,
    ) -> Result<String> {
        let source = input
            .source
            .as_ref()
            .ok_or_else(|| FilterError::invalid_expression("spatial predicates need a source geometry"))?;
        let source_geom = buffered(inline_source(source, dataset)?, input.buffer.as_ref(), dataset);
        let parts = input
            .predicates
            .iter()
            .map(|p| format!("{}({}, {})", st_function(*p), target, source_geom))
            .collect();
        Ok(or_join(parts))
    }
}

impl Backend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn supports_predicates(&self) -> PredicateSupport {
        PredicateSupport::all_exact()
    }

    fn build_expression(
        &self,
        dataset: &DatasetHandle,
        input: &ExpressionInput,
    ) -> Result<FilterExpression> {
        let attribute = validate_input(BackendKind::Sql, &self.supports_predicates(), dataset, input)?;
        dataset.require_table()?;

        let spatial = if input.predicates.is_empty() {
            None
        } else {
            let target = self.target_geometry(dataset)?;
            Some(match self.same_database_source(dataset, input) {
                Some(source) => self.exists_spatial(dataset, source, input, &target)?,
                None => self.inline_spatial(dataset, input, &target)?,
            })
        };
        let attribute = attribute.map(|a| a.to_sql());
        let text = expression::and_all([spatial.as_deref(), attribute.as_deref()].into_iter().flatten())
            .ok_or_else(|| FilterError::invalid_expression("empty SQL filter"))?;

        Ok(FilterExpression {
            backend: BackendKind::Sql,
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
        let table = qualified_table(dataset.require_table()?);
        let canceler = self.session(dataset)?.canceler();
        let hook = ctx.on_cancel(move || canceler.cancel_statement());

        let combined = expression::combine(existing_subset, &expression.text, combine);
        let result = if self.should_materialize(dataset, expression, existing_subset, combine) {
            self.materialize(ctx, dataset, &combined).map(|(subset, count, artifact)| {
                self.pending.retain(|a| a != &artifact);
                (subset, count, vec![artifact])
            })
        } else {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, combined);
            self.count(ctx, dataset, &sql)
                .map(|count| (combined.clone(), count, Vec::new()))
        };
        ctx.remove_hook(hook);

        let (subset, feature_count, retained) = result?;
        Ok(AppliedFilter {
            subset,
            feature_count,
            backend: BackendKind::Sql,
            retained,
            skipped: 0,
        })
    }

    fn drop_artifacts(
        &mut self,
        _ctx: &TaskContext,
        dataset: &DatasetHandle,
        artifacts: &[Artifact],
    ) -> Result<()> {
        let mut first_error = None;
        for artifact in artifacts {
            if let Err(e) = self.drop_relation(dataset, &artifact.name) {
                tracing::warn!(artifact = %artifact.name, error = %e, "failed to drop artifact");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn cleanup(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if let Some(session) = self.session.as_mut() {
            for artifact in &pending {
                let sql = format!("DROP TABLE IF EXISTS {}", artifact.name);
                tracing::debug!(sql = %sql, "cleanup");
                if let Err(e) = session.execute(&sql) {
                    tracing::warn!(artifact = %artifact.name, error = %e, "cleanup failed to drop artifact");
                }
            }
        }
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }
}

impl Drop for SqlBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}
