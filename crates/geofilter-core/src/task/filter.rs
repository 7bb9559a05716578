//! Filter task: one request applied to one target dataset

use std::sync::Arc;

use super::{Task, TaskContext, TaskKind, TaskOutput};
use crate::backend::{
    AppliedFilter, Artifact, Backend, BackendSelection, ExpressionInput,
};
use crate::cache::{self, PreparedGeometry, SourceGeometryCache};
use crate::dataset::{DatasetHandle, DatasetId};
use crate::error::{FilterError, Result};
use crate::host::{DatasetRegistry, FeatureSource};
use crate::request::{FilterRequest, SourceGeometry};

/// Staged result of a filter task, committed on the owning thread
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub dataset: DatasetId,
    pub applied: AppliedFilter,
    pub selection: BackendSelection,
    /// Backend-specific expression that produced the subset
    pub expression: String,
    pub warnings: Vec<String>,
    /// Whether the source geometry came from the request cache
    pub cache_hit: Option<bool>,
    /// Source features skipped as irreparable
    pub source_skipped: usize,
}

pub struct FilterTask {
    request: Arc<FilterRequest>,
    dataset: DatasetHandle,
    backend: Box<dyn Backend>,
    selection: BackendSelection,
    registry: Arc<dyn DatasetRegistry>,
    features: Arc<dyn FeatureSource>,
    cache: Arc<SourceGeometryCache>,
    existing_subset: Option<String>,
    retired: Vec<Artifact>,
    repair: bool,
}

impl FilterTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Arc<FilterRequest>,
        dataset: DatasetHandle,
        (backend, selection): (Box<dyn Backend>, BackendSelection),
        registry: Arc<dyn DatasetRegistry>,
        features: Arc<dyn FeatureSource>,
        cache: Arc<SourceGeometryCache>,
        existing_subset: Option<String>,
        repair: bool,
    ) -> Self {
        Self {
            request,
            dataset,
            backend,
            selection,
            registry,
            features,
            cache,
            existing_subset: existing_subset.filter(|s| !s.trim().is_empty()),
            retired: Vec::new(),
            repair,
        }
    }

    /// Artifacts of superseded subsets, dropped before filtering
    pub fn with_retired(mut self, artifacts: Vec<Artifact>) -> Self {
        self.retired = artifacts;
        self
    }

    fn resolve(&self, id: &DatasetId) -> Result<DatasetHandle> {
        self.registry
            .resolve(id)
            .ok_or_else(|| FilterError::DatasetUnavailable(id.clone()))
    }

    /// Reference geometry through the request cache, with its dataset handle
    fn prepare_source(
        &self,
        source: &SourceGeometry,
    ) -> Result<(Arc<PreparedGeometry>, Option<DatasetHandle>, bool)> {
        match source {
            SourceGeometry::Wkt { wkt, crs } => {
                let signature = cache::literal_signature(wkt, crs);
                let key = format!("wkt:{}", signature);
                let (prepared, hit) = self.cache.get_or_build(&key, &signature, || {
                    PreparedGeometry::from_wkt(wkt, crs, self.repair)
                })?;
                Ok((prepared, None, hit))
            }
            SourceGeometry::Selection {
                dataset,
                feature_ids,
            } => {
                let handle = self.resolve(dataset)?;
                // recomputed on every use so a changed selection rebuilds
                let ids = match feature_ids {
                    Some(ids) => ids.clone(),
                    None => self.registry.selection(dataset),
                };
                if ids.is_empty() {
                    return Err(FilterError::GeometryInvalid {
                        reason: format!("no features selected in {}", dataset),
                    });
                }
                let signature = cache::selection_signature(&ids);
                let (prepared, hit) = self.cache.get_or_build(dataset.as_str(), &signature, || {
                    let features = self.features.features_by_id(&handle, &ids)?;
                    cache::prepare_source(dataset, &features, &handle.crs, self.repair)
                })?;
                Ok((prepared, Some(handle), hit))
            }
        }
    }

    fn filter(&mut self, ctx: &TaskContext) -> Result<FilterOutcome> {
        ctx.check_canceled()?;
        let dataset = self.resolve(&self.dataset.id)?;
        let mut warnings = Vec::new();

        if !self.retired.is_empty() {
            let retired = std::mem::take(&mut self.retired);
            if let Err(e) = self.backend.drop_artifacts(ctx, &dataset, &retired) {
                warnings.push(format!("could not drop {} retired artifact(s): {}", retired.len(), e));
            }
        }

        let mut input = ExpressionInput {
            predicates: self.request.predicates.clone(),
            buffer: self.request.buffer,
            attribute: self.request.attribute_expression().map(str::to_string),
            ..Default::default()
        };
        let mut cache_hit = None;
        let mut source_skipped = 0;
        if let Some(source) = self.request.source.as_ref().filter(|_| self.request.has_spatial()) {
            let (prepared, source_dataset, hit) = self.prepare_source(source)?;
            if prepared.skipped > 0 {
                warnings.push(format!(
                    "{} source feature(s) skipped for invalid geometry",
                    prepared.skipped
                ));
            }
            source_skipped = prepared.skipped;
            cache_hit = Some(hit);
            input.source = Some(prepared);
            input.source_dataset = source_dataset;
        }
        ctx.set_progress(10);

        let expression = self.backend.build_expression(&dataset, &input)?;
        ctx.set_progress(20);
        let applied = self.backend.apply_filter(
            ctx,
            &dataset,
            &expression,
            self.existing_subset.as_deref(),
            self.request.combine,
        )?;

        if ctx.is_canceled() {
            // never committed, so nothing may keep the new relation alive
            if let Err(e) = self.backend.drop_artifacts(ctx, &dataset, &applied.retained) {
                tracing::warn!(dataset = %dataset.id, error = %e, "failed to drop artifacts of a canceled filter");
            }
            return Err(FilterError::Canceled);
        }
        if applied.skipped > 0 {
            warnings.push(format!(
                "{} target feature(s) skipped for invalid geometry",
                applied.skipped
            ));
        }

        Ok(FilterOutcome {
            dataset: dataset.id.clone(),
            applied,
            selection: self.selection.clone(),
            expression: expression.text,
            warnings,
            cache_hit,
            source_skipped,
        })
    }
}

impl Task for FilterTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Filter
    }

    fn describe(&self) -> String {
        format!("filter {} ({})", self.dataset.id, self.selection.kind)
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput> {
        let outcome = self.filter(ctx)?;
        tracing::info!(
            dataset = %outcome.dataset,
            backend = %outcome.applied.backend,
            features = outcome.applied.feature_count,
            "filter applied"
        );
        Ok(TaskOutput::Filter(Box::new(outcome)))
    }

    fn finalize(&mut self) {
        self.backend.cleanup();
    }
}
