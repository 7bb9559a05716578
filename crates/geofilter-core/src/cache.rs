//! Source geometry cache
//!
//! Filtering several target datasets against one source selection needs the
//! same reference geometry for every target. The cache lives for one request
//! and is shared by that request's filter tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::dataset::{Crs, DatasetId, Feature, FeatureId};
use crate::error::{FilterError, Result};
use crate::geometry::{self, Geometry, Rect};
use crate::logging::CacheMetrics;
use crate::trace_time;

/// Reference geometry ready for expression building
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedGeometry {
    /// Source dataset, `None` for literal geometries
    pub source: Option<DatasetId>,
    /// Selected source features, sorted
    pub feature_ids: Vec<FeatureId>,
    pub geometry: Geometry,
    pub wkt: String,
    pub bbox: Option<Rect>,
    pub crs: Crs,
    /// Source features that contributed a geometry
    pub used: usize,
    /// Source features skipped as irreparable
    pub skipped: usize,
}

impl PreparedGeometry {
    /// Prepare a literal WKT geometry
    pub fn from_wkt(wkt: &str, crs: &Crs, repair: bool) -> Result<Self> {
        let parsed = geometry::parse_wkt(wkt)?;
        let geometry = if geometry::validate(&parsed).is_empty() {
            parsed
        } else if repair {
            geometry::repair(&parsed)?.geometry
        } else {
            return Err(FilterError::GeometryInvalid {
                reason: "literal geometry is invalid and repair is disabled".to_string(),
            });
        };
        Ok(Self::assemble(None, Vec::new(), geometry, crs.clone(), 1, 0))
    }

    fn assemble(
        source: Option<DatasetId>,
        feature_ids: Vec<FeatureId>,
        geometry: Geometry,
        crs: Crs,
        used: usize,
        skipped: usize,
    ) -> Self {
        Self {
            source,
            feature_ids,
            wkt: geometry::to_wkt(&geometry),
            bbox: geometry.bbox(),
            geometry,
            crs,
            used,
            skipped,
        }
    }

    /// Geometry expressed in `crs`
    pub fn geometry_in(&self, crs: &Crs) -> Result<Geometry> {
        geometry::transform::transform(&self.geometry, &self.crs, crs)
    }
}

/// Union the selected source features into one reference geometry.
///
/// Invalid geometries are repaired when `repair` is set; features whose
/// geometry is missing or irreparable are skipped and counted.
pub fn prepare_source(
    source: &DatasetId,
    features: &[Feature],
    crs: &Crs,
    repair: bool,
) -> Result<PreparedGeometry> {
    let start = Instant::now();
    let mut parts = Vec::with_capacity(features.len());
    let mut ids = Vec::with_capacity(features.len());
    let mut skipped = 0;

    for feature in features {
        let Some(geom) = &feature.geometry else {
            skipped += 1;
            continue;
        };
        let issues = geometry::validate(geom);
        if issues.is_empty() {
            parts.push(geom.clone());
            ids.push(feature.id);
            continue;
        }
        match repair.then(|| geometry::repair(geom)) {
            Some(Ok(outcome)) => {
                tracing::debug!(
                    source = %source,
                    feature = feature.id,
                    steps = ?outcome.steps,
                    "repaired source geometry"
                );
                parts.push(outcome.geometry);
                ids.push(feature.id);
            }
            _ => {
                tracing::warn!(
                    source = %source,
                    feature = feature.id,
                    issues = ?issues,
                    "skipping invalid source geometry"
                );
                skipped += 1;
            }
        }
    }

    if parts.is_empty() {
        return Err(FilterError::GeometryInvalid {
            reason: format!(
                "no usable geometry in the selection of {} ({} feature(s) skipped)",
                source, skipped
            ),
        });
    }

    ids.sort_unstable();
    let used = parts.len();
    let prepared = PreparedGeometry::assemble(
        Some(source.clone()),
        ids,
        Geometry::collect(parts),
        crs.clone(),
        used,
        skipped,
    );
    trace_time!(start, "prepare_source", used = used, skipped = skipped);
    Ok(prepared)
}

/// Signature of a selection: SHA-256 over the sorted, deduplicated ids
pub fn selection_signature(ids: &[FeatureId]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for id in &sorted {
        hasher.update(id.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Signature of a literal geometry
pub fn literal_signature(wkt: &str, crs: &Crs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(crs.authid().as_bytes());
    hasher.update([0]);
    hasher.update(wkt.trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct Entry {
    signature: String,
    value: Arc<PreparedGeometry>,
}

/// Per-request memo of prepared source geometries
#[derive(Debug, Default)]
pub struct SourceGeometryCache {
    entries: Mutex<HashMap<String, Entry>>,
    metrics: CacheMetrics,
}

impl SourceGeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached geometry for `(source_id, signature)`, building it on a miss.
    ///
    /// A different signature for a known source replaces its entry. Returns
    /// the geometry and whether it came from the cache.
    pub fn get_or_build(
        &self,
        source_id: &str,
        signature: &str,
        build: impl FnOnce() -> Result<PreparedGeometry>,
    ) -> Result<(Arc<PreparedGeometry>, bool)> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| FilterError::Other("source geometry cache poisoned".to_string()))?;

        if let Some(entry) = entries.get(source_id) {
            if entry.signature == signature {
                self.metrics.record_hit();
                tracing::debug!(source = source_id, "source geometry cache hit");
                return Ok((entry.value.clone(), true));
            }
            tracing::debug!(source = source_id, "selection changed, evicting cached geometry");
            entries.remove(source_id);
            self.metrics.record_eviction();
        }

        self.metrics.record_miss();
        // built under the lock so concurrent targets do not repeat the union
        let value = Arc::new(build()?);
        entries.insert(
            source_id.to_string(),
            Entry {
                signature: signature.to_string(),
                value: value.clone(),
            },
        );
        Ok((value, false))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}
