//! Generic-driver backend
//!
//! Universal fallback for datasets without a spatial database behind them.
//! Features are pulled through the host's generic feature access and
//! evaluated in process. Intersects and Disjoint are exact; Within, Contains
//! and Equals are approximated on bounding boxes.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{
    validate_input, AppliedFilter, Artifact, Backend, BackendKind, ExpressionInput, Fidelity,
    FilterExpression, PredicateSupport,
};
use crate::config::GenericConfig;
use crate::dataset::{DatasetHandle, Feature, FeatureId};
use crate::error::{FilterError, Result};
use crate::expression::{self, quote_literal, AttributeFilter};
use crate::geometry::{self, ops, Geometry, Rect};
use crate::host::FeatureSource;
use crate::request::{CombineOperator, Predicate};
use crate::task::TaskContext;

/// Identifier reference understood by the host's expression language
pub const FEATURE_ID: &str = "$id";

/// Tolerance of the bounding-box equality test, in CRS units
const BBOX_TOLERANCE: f64 = 1e-9;

/// In-process evaluation plan of the spatial part
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialPlan {
    pub predicates: Vec<(Predicate, Fidelity)>,
    /// Reference geometry in the target CRS, before buffering
    pub reference: Geometry,
    /// Buffer distance in target CRS units
    pub distance: f64,
}

impl SpatialPlan {
    fn buffered_bbox(&self) -> Option<Rect> {
        self.reference.bbox().map(|r| r.expand(self.distance))
    }

    /// Any predicate holds for `geometry`
    pub fn matches(&self, geometry: &Geometry) -> bool {
        self.predicates
            .iter()
            .any(|(predicate, _)| self.holds(*predicate, geometry))
    }

    fn holds(&self, predicate: Predicate, geometry: &Geometry) -> bool {
        match predicate {
            Predicate::Intersects => ops::within_distance(geometry, &self.reference, self.distance),
            Predicate::Disjoint => !ops::within_distance(geometry, &self.reference, self.distance),
            Predicate::Within => match (geometry.bbox(), self.buffered_bbox()) {
                (Some(g), Some(r)) => r.contains(&g),
                _ => false,
            },
            Predicate::Contains => match (geometry.bbox(), self.buffered_bbox()) {
                (Some(g), Some(r)) => g.contains(&r),
                _ => false,
            },
            Predicate::Equals => match (geometry.bbox(), self.buffered_bbox()) {
                (Some(g), Some(r)) => g.approx_eq(&r, BBOX_TOLERANCE),
                _ => false,
            },
            Predicate::Overlaps | Predicate::Crosses | Predicate::Touches => false,
        }
    }
}

pub struct GenericBackend {
    config: GenericConfig,
    repair: bool,
    features: Arc<dyn FeatureSource>,
}

impl GenericBackend {
    pub fn new(config: GenericConfig, repair: bool, features: Arc<dyn FeatureSource>) -> Self {
        Self {
            config,
            repair,
            features,
        }
    }

    /// Target geometry usable for predicates, repaired when allowed
    fn usable_geometry<'a>(&self, feature: &'a Feature) -> Option<Cow<'a, Geometry>> {
        let geometry = feature.geometry.as_ref()?;
        if geometry::validate(geometry).is_empty() {
            return Some(Cow::Borrowed(geometry));
        }
        if !self.repair {
            return None;
        }
        match geometry::repair(geometry) {
            Ok(outcome) => Some(Cow::Owned(outcome.geometry)),
            Err(e) => {
                tracing::debug!(feature = feature.id, error = %e, "skipping irreparable target geometry");
                None
            }
        }
    }

    fn existing_ids(&self, dataset: &DatasetHandle, subset: &str) -> Result<BTreeSet<FeatureId>> {
        Ok(self
            .features
            .features(dataset, Some(subset))?
            .into_iter()
            .map(|f| f.id)
            .collect())
    }
}

/// Host expression for the spatial part
fn host_expression(predicates: &[Predicate], wkt: &str, distance: f64) -> String {
    let mut reference = format!("geom_from_wkt({})", quote_literal(wkt));
    if distance != 0.0 {
        reference = format!("buffer({}, {})", reference, distance);
    }
    let parts: Vec<String> = predicates
        .iter()
        .map(|p| format!("{}($geometry, {})", p.as_str(), reference))
        .collect();
    if parts.len() == 1 {
        parts.join("")
    } else {
        format!("({})", parts.join(" OR "))
    }
}

impl Backend for GenericBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn supports_predicates(&self) -> PredicateSupport {
        PredicateSupport::default()
            .with(Predicate::Intersects, Fidelity::Exact)
            .with(Predicate::Disjoint, Fidelity::Exact)
            .with(Predicate::Within, Fidelity::Approximate)
            .with(Predicate::Contains, Fidelity::Approximate)
            .with(Predicate::Equals, Fidelity::Approximate)
    }

    fn build_expression(
        &self,
        dataset: &DatasetHandle,
        input: &ExpressionInput,
    ) -> Result<FilterExpression> {
        let support = self.supports_predicates();
        let attribute = validate_input(BackendKind::Generic, &support, dataset, input)?;
        if let Some(filter) = &attribute {
            filter.check_evaluable()?;
        }

        let (spatial, plan) = match input.source.as_deref() {
            Some(source) if !input.predicates.is_empty() => {
                let distance = input
                    .buffer
                    .map(|b| b.distance_in(&dataset.crs))
                    .unwrap_or(0.0);
                if distance < 0.0 {
                    return Err(FilterError::invalid_expression(
                        "negative buffers need a database backend",
                    ));
                }
                let reference = source.geometry_in(&dataset.crs)?;
                let text = host_expression(&input.predicates, &geometry::to_wkt(&reference), distance);
                let plan = SpatialPlan {
                    predicates: input
                        .predicates
                        .iter()
                        .filter_map(|p| support.fidelity(*p).map(|f| (*p, f)))
                        .collect(),
                    reference,
                    distance,
                };
                (Some(text), Some(plan))
            }
            _ => (None, None),
        };
        let attribute = attribute.map(|a| a.to_sql());
        let text = expression::and_all([spatial.as_deref(), attribute.as_deref()].into_iter().flatten())
            .ok_or_else(|| FilterError::invalid_expression("empty generic filter"))?;

        Ok(FilterExpression {
            backend: BackendKind::Generic,
            text,
            spatial,
            attribute,
            predicate_count: input.predicates.len(),
            buffered: plan.as_ref().is_some_and(|p| p.distance != 0.0),
            plan,
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
        let attribute = expression
            .attribute
            .as_deref()
            .map(AttributeFilter::parse)
            .transpose()?;
        let features = self.features.features(dataset, None)?;
        let interval = self.config.cancel_check_interval.max(1);
        let total = features.len().max(1);

        let mut matched = BTreeSet::new();
        let mut skipped = 0;
        for (n, feature) in features.iter().enumerate() {
            if n % interval == 0 {
                ctx.check_canceled()?;
                ctx.set_progress((n * 90 / total) as u32);
            }
            if let Some(filter) = &attribute {
                if !filter.matches(feature)? {
                    continue;
                }
            }
            if let Some(plan) = &expression.plan {
                let Some(geometry) = self.usable_geometry(feature) else {
                    skipped += 1;
                    continue;
                };
                if !plan.matches(&geometry) {
                    continue;
                }
            }
            matched.insert(feature.id);
        }
        ctx.check_canceled()?;

        let existing = existing_subset.map(str::trim).filter(|s| !s.is_empty());
        let ids: Vec<FeatureId> = match (existing, combine) {
            (None, _) | (_, CombineOperator::Replace) => matched.into_iter().collect(),
            (Some(subset), op) => {
                let current = self.existing_ids(dataset, subset)?;
                match op {
                    CombineOperator::And => current.intersection(&matched).copied().collect(),
                    CombineOperator::Or => current.union(&matched).copied().collect(),
                    _ => current.difference(&matched).copied().collect(),
                }
            }
        };
        if skipped > 0 {
            tracing::warn!(dataset = %dataset.id, skipped, "target features skipped for invalid geometry");
        }

        Ok(AppliedFilter {
            subset: expression::id_list_expression(FEATURE_ID, &ids),
            feature_count: ids.len() as u64,
            backend: BackendKind::Generic,
            retained: Vec::new(),
            skipped,
        })
    }

    fn drop_artifacts(
        &mut self,
        _ctx: &TaskContext,
        dataset: &DatasetHandle,
        artifacts: &[Artifact],
    ) -> Result<()> {
        if !artifacts.is_empty() {
            tracing::debug!(dataset = %dataset.id, count = artifacts.len(), "generic driver keeps no artifacts");
        }
        Ok(())
    }

    fn cleanup(&mut self) {}
}
