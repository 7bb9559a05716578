//! Storage backends
//!
//! One filter request is compiled into a backend-specific expression and
//! applied by one of a closed set of backends: a full SQL/spatial database,
//! an embedded spatial database file, or the host's generic feature
//! primitives. Selection happens in [`factory`].

pub mod embedded;
pub mod factory;
pub mod generic;
pub mod retry;
pub mod sql;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::PreparedGeometry;
use crate::dataset::{DatasetHandle, DatasetId};
use crate::error::{FilterError, Result};
use crate::expression::AttributeFilter;
use crate::request::{BufferSpec, CombineOperator, Predicate};
use crate::task::TaskContext;

pub use factory::{choose_backend, create_backend, select_backend, BackendSelection, BackendServices};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sql,
    Embedded,
    Generic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Sql => "sql",
            BackendKind::Embedded => "embedded",
            BackendKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "postgis" | "postgresql" => Ok(BackendKind::Sql),
            "embedded" | "spatialite" | "sqlite" => Ok(BackendKind::Embedded),
            "generic" | "ogr" => Ok(BackendKind::Generic),
            other => Err(FilterError::invalid_value("backend", other)),
        }
    }
}

/// How faithfully a backend evaluates a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    Exact,
    /// Evaluated on bounding boxes
    Approximate,
}

/// Predicate capabilities of a backend; missing predicates are unsupported
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PredicateSupport(BTreeMap<Predicate, Fidelity>);

impl PredicateSupport {
    pub fn all_exact() -> Self {
        Self(Predicate::ALL.into_iter().map(|p| (p, Fidelity::Exact)).collect())
    }

    pub fn with(mut self, predicate: Predicate, fidelity: Fidelity) -> Self {
        self.0.insert(predicate, fidelity);
        self
    }

    pub fn fidelity(&self, predicate: Predicate) -> Option<Fidelity> {
        self.0.get(&predicate).copied()
    }

    /// First unsupported predicate as `UnsupportedPredicate`
    pub fn check(&self, predicates: &[Predicate], backend: BackendKind) -> Result<()> {
        match predicates.iter().find(|p| self.fidelity(**p).is_none()) {
            Some(p) => Err(FilterError::UnsupportedPredicate {
                predicate: *p,
                backend,
            }),
            None => Ok(()),
        }
    }

    /// Requested predicates the backend only approximates
    pub fn approximated(&self, predicates: &[Predicate]) -> Vec<Predicate> {
        predicates
            .iter()
            .copied()
            .filter(|p| self.fidelity(*p) == Some(Fidelity::Approximate))
            .collect()
    }
}

/// Inputs to [`Backend::build_expression`]
#[derive(Debug, Clone, Default)]
pub struct ExpressionInput {
    pub predicates: Vec<Predicate>,
    pub source: Option<Arc<PreparedGeometry>>,
    /// Source dataset handle, when the reference comes from a dataset
    pub source_dataset: Option<DatasetHandle>,
    pub buffer: Option<BufferSpec>,
    pub attribute: Option<String>,
}

/// A backend-specific filter, never empty
#[derive(Debug, Clone)]
pub struct FilterExpression {
    pub backend: BackendKind,
    /// Complete filter text in the backend's language
    pub text: String,
    /// Spatial part alone
    pub spatial: Option<String>,
    /// Normalized attribute part alone
    pub attribute: Option<String>,
    pub predicate_count: usize,
    pub buffered: bool,
    /// In-process evaluation plan (generic driver only)
    pub plan: Option<generic::SpatialPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    MaterializedRelation,
    TempTable,
}

/// A backend-created storage object tracked for cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub dataset: DatasetId,
    /// Qualified, quoted relation name
    pub name: String,
}

/// What a successful apply produced, staged until the task finishes
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFilter {
    pub subset: String,
    pub feature_count: u64,
    pub backend: BackendKind,
    /// Artifacts the subset depends on; dropped when the subset is retired
    pub retained: Vec<Artifact>,
    /// Target features skipped for irreparable geometry
    pub skipped: usize,
}

/// Contract every storage adapter implements
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn supports_predicates(&self) -> PredicateSupport;

    /// Compile the filter for this backend. Pure: touches no storage.
    fn build_expression(
        &self,
        dataset: &DatasetHandle,
        input: &ExpressionInput,
    ) -> Result<FilterExpression>;

    /// Combine with the existing subset and compute the new subset
    fn apply_filter(
        &mut self,
        ctx: &TaskContext,
        dataset: &DatasetHandle,
        expression: &FilterExpression,
        existing_subset: Option<&str>,
        combine: CombineOperator,
    ) -> Result<AppliedFilter>;

    /// Drop artifacts retired from earlier filters
    fn drop_artifacts(
        &mut self,
        ctx: &TaskContext,
        dataset: &DatasetHandle,
        artifacts: &[Artifact],
    ) -> Result<()>;

    /// Drop unretained artifacts and release the session. Idempotent.
    fn cleanup(&mut self);
}

/// Checks shared by every backend before compiling.
///
/// Returns the parsed attribute filter, if any.
pub(crate) fn validate_input(
    backend: BackendKind,
    support: &PredicateSupport,
    dataset: &DatasetHandle,
    input: &ExpressionInput,
) -> Result<Option<AttributeFilter>> {
    dataset.require_keys()?;
    let attribute = input
        .attribute
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty());

    if input.predicates.is_empty() && attribute.is_none() {
        return Err(FilterError::invalid_expression(format!(
            "nothing to filter on for {}",
            dataset.id
        )));
    }
    support.check(&input.predicates, backend)?;
    if !input.predicates.is_empty() && input.source.is_none() {
        return Err(FilterError::invalid_expression(
            "spatial predicates need a source geometry",
        ));
    }

    attribute
        .map(|text| {
            let filter = AttributeFilter::parse(text)?;
            filter.check_fields(dataset)?;
            Ok(filter)
        })
        .transpose()
}

/// Relation names generated by this crate: prefix, dataset slug and a counter
pub(crate) fn artifact_name(prefix: &str, dataset: &DatasetId, counter: u64) -> String {
    let slug = dataset.slug();
    let suffix = ulid::Ulid::new().to_string().to_ascii_lowercase();
    format!("{}_{}_{}_{}", prefix, slug, counter, &suffix[suffix.len() - 6..])
}
