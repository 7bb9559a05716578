//! Filter requests submitted to the orchestrator

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::dataset::{Crs, DatasetId, FeatureId};
use crate::error::{FilterError, Result};
use crate::geometry::transform::METRES_PER_DEGREE;

/// Named spatial relation between a target geometry and the reference geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Intersects,
    Within,
    Contains,
    Overlaps,
    Crosses,
    Touches,
    Disjoint,
    Equals,
}

impl Predicate {
    pub const ALL: [Predicate; 8] = [
        Predicate::Intersects,
        Predicate::Within,
        Predicate::Contains,
        Predicate::Overlaps,
        Predicate::Crosses,
        Predicate::Touches,
        Predicate::Disjoint,
        Predicate::Equals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::Intersects => "intersects",
            Predicate::Within => "within",
            Predicate::Contains => "contains",
            Predicate::Overlaps => "overlaps",
            Predicate::Crosses => "crosses",
            Predicate::Touches => "touches",
            Predicate::Disjoint => "disjoint",
            Predicate::Equals => "equals",
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Predicate {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Predicate::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| FilterError::invalid_value("predicate", s))
    }
}

/// Unit of a buffer distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferUnit {
    /// Units of the target dataset's CRS
    #[default]
    MapUnits,
    Meters,
    Kilometers,
    Feet,
    Degrees,
}

impl BufferUnit {
    pub fn is_metric(&self) -> bool {
        matches!(self, BufferUnit::Meters | BufferUnit::Kilometers | BufferUnit::Feet)
    }
}

impl FromStr for BufferUnit {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "map" | "map_units" | "mapunits" => Ok(BufferUnit::MapUnits),
            "m" | "meter" | "meters" | "metre" | "metres" => Ok(BufferUnit::Meters),
            "km" | "kilometer" | "kilometers" => Ok(BufferUnit::Kilometers),
            "ft" | "foot" | "feet" => Ok(BufferUnit::Feet),
            "deg" | "degree" | "degrees" => Ok(BufferUnit::Degrees),
            other => Err(FilterError::invalid_value("buffer unit", other)),
        }
    }
}

/// End cap style of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCap {
    #[default]
    Round,
    Flat,
    Square,
}

impl EndCap {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndCap::Round => "round",
            EndCap::Flat => "flat",
            EndCap::Square => "square",
        }
    }
}

/// How the buffered geometry is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStyle {
    /// Segments per quarter circle
    pub segments: u32,
    pub end_cap: EndCap,
}

impl Default for BufferStyle {
    fn default() -> Self {
        Self {
            segments: 8,
            end_cap: EndCap::Round,
        }
    }
}

/// Dilation (or erosion, when negative) of the reference geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub distance: f64,
    #[serde(default)]
    pub unit: BufferUnit,
    #[serde(default)]
    pub style: BufferStyle,
}

impl BufferSpec {
    pub fn new(distance: f64, unit: BufferUnit) -> Self {
        Self {
            distance,
            unit,
            style: BufferStyle::default(),
        }
    }

    pub fn with_style(mut self, style: BufferStyle) -> Self {
        self.style = style;
        self
    }

    /// Distance in metres, for metric units
    pub fn metres(&self) -> Option<f64> {
        match self.unit {
            BufferUnit::Meters => Some(self.distance),
            BufferUnit::Kilometers => Some(self.distance * 1000.0),
            BufferUnit::Feet => Some(self.distance * 0.3048),
            BufferUnit::MapUnits | BufferUnit::Degrees => None,
        }
    }

    /// Distance expressed in the units of `crs`
    pub fn distance_in(&self, crs: &Crs) -> f64 {
        match (self.metres(), self.unit, crs.is_geographic()) {
            (Some(m), _, true) => m / METRES_PER_DEGREE,
            (Some(m), _, false) => m,
            (None, BufferUnit::Degrees, false) => self.distance * METRES_PER_DEGREE,
            _ => self.distance,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.distance == 0.0
    }
}

/// Where the reference geometry of a spatial filter comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceGeometry {
    /// Features of a source dataset; `None` means the host's current selection
    Selection {
        dataset: DatasetId,
        feature_ids: Option<Vec<FeatureId>>,
    },
    /// A literal geometry
    Wkt { wkt: String, crs: Crs },
}

impl SourceGeometry {
    pub fn current_selection(dataset: impl Into<String>) -> Self {
        SourceGeometry::Selection {
            dataset: DatasetId::new(dataset),
            feature_ids: None,
        }
    }

    pub fn features(dataset: impl Into<String>, ids: Vec<FeatureId>) -> Self {
        SourceGeometry::Selection {
            dataset: DatasetId::new(dataset),
            feature_ids: Some(ids),
        }
    }

    pub fn source_dataset(&self) -> Option<&DatasetId> {
        match self {
            SourceGeometry::Selection { dataset, .. } => Some(dataset),
            SourceGeometry::Wkt { .. } => None,
        }
    }
}

/// Boolean operator merging a new filter with an already active subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOperator {
    /// Replace the existing subset
    #[default]
    Replace,
    And,
    Or,
    AndNot,
}

impl FromStr for CombineOperator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "replace" | "none" => Ok(CombineOperator::Replace),
            "and" => Ok(CombineOperator::And),
            "or" => Ok(CombineOperator::Or),
            "and_not" | "andnot" => Ok(CombineOperator::AndNot),
            other => Err(FilterError::invalid_value("combine operator", other)),
        }
    }
}

impl fmt::Display for CombineOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombineOperator::Replace => write!(f, "replace"),
            CombineOperator::And => write!(f, "AND"),
            CombineOperator::Or => write!(f, "OR"),
            CombineOperator::AndNot => write!(f, "AND NOT"),
        }
    }
}

/// Which undo timeline records the result of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryScope {
    /// Global when the request targets more than one dataset
    #[default]
    Auto,
    Dataset,
    Global,
}

impl HistoryScope {
    pub fn is_global(&self, target_count: usize) -> bool {
        match self {
            HistoryScope::Auto => target_count > 1,
            HistoryScope::Dataset => false,
            HistoryScope::Global => true,
        }
    }
}

/// A filter to apply to one or more datasets.
///
/// Immutable once submitted; the orchestrator shares it between tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRequest {
    pub targets: Vec<DatasetId>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub buffer: Option<BufferSpec>,
    #[serde(default)]
    pub source: Option<SourceGeometry>,
    #[serde(default)]
    pub combine: CombineOperator,
    #[serde(default)]
    pub forced_backend: Option<BackendKind>,
    #[serde(default)]
    pub history_scope: HistoryScope,
    #[serde(default)]
    pub description: Option<String>,
}

impl FilterRequest {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(|t| DatasetId::new(t)).collect(),
            attribute: None,
            predicates: Vec::new(),
            buffer: None,
            source: None,
            combine: CombineOperator::default(),
            forced_backend: None,
            history_scope: HistoryScope::default(),
            description: None,
        }
    }

    pub fn with_attribute(mut self, expression: impl Into<String>) -> Self {
        self.attribute = Some(expression.into());
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        if !self.predicates.contains(&predicate) {
            self.predicates.push(predicate);
        }
        self
    }

    pub fn with_buffer(mut self, buffer: BufferSpec) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_source(mut self, source: SourceGeometry) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_combine(mut self, combine: CombineOperator) -> Self {
        self.combine = combine;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.forced_backend = Some(backend);
        self
    }

    pub fn with_history_scope(mut self, scope: HistoryScope) -> Self {
        self.history_scope = scope;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn has_spatial(&self) -> bool {
        !self.predicates.is_empty()
    }

    pub fn attribute_expression(&self) -> Option<&str> {
        self.attribute
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    /// Check the request is self-consistent before any backend sees it
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(FilterError::invalid_value("request", "no target datasets"));
        }
        if self.has_spatial() && self.source.is_none() {
            return Err(FilterError::invalid_value(
                "request",
                "spatial predicates need a source geometry",
            ));
        }
        if self.buffer.is_some() && !self.has_spatial() {
            return Err(FilterError::invalid_value(
                "request",
                "a buffer needs at least one spatial predicate",
            ));
        }
        if let Some(buffer) = &self.buffer {
            if !buffer.distance.is_finite() {
                return Err(FilterError::invalid_value("buffer distance", buffer.distance));
            }
        }
        if !self.has_spatial() && self.attribute_expression().is_none() {
            return Err(FilterError::invalid_expression(
                "nothing to filter on: give an attribute expression or a spatial predicate",
            ));
        }
        Ok(())
    }

    /// Human-readable summary used for history entries
    pub fn summary(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        let mut parts = Vec::new();
        if let Some(expr) = self.attribute_expression() {
            parts.push(expr.to_string());
        }
        if self.has_spatial() {
            let names: Vec<&str> = self.predicates.iter().map(Predicate::as_str).collect();
            let mut spatial = names.join(" or ");
            if let Some(buffer) = &self.buffer {
                spatial.push_str(&format!(" (buffer {})", buffer.distance));
            }
            parts.push(spatial);
        }
        let mut summary = parts.join(" and ");
        if self.combine != CombineOperator::Replace {
            summary = format!("{} {}", self.combine, summary);
        }
        summary
    }
}
