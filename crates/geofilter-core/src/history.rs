//! Undo/redo timelines of applied filters
//!
//! A timeline is a flat vector with a cursor. Position 0 is the unfiltered
//! base; position `k` is the state after entry `k`. Pushing while the cursor
//! is behind the end discards the redo branch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Artifact;
use crate::dataset::DatasetId;
use crate::error::Result;
use crate::store::RecordStore;

/// Record key prefix of persisted histories
pub const HISTORY_PREFIX: &str = "history/";

/// Record key of the global timeline
pub const GLOBAL_HISTORY_KEY: &str = "history/_global";

const ARTIFACTS_KEY: &str = "artifacts";

pub fn history_key(dataset: &DatasetId) -> String {
    format!("{}{}", HISTORY_PREFIX, dataset)
}

/// Bounded timeline with a cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History<T> {
    entries: Vec<T>,
    cursor: usize,
    max_entries: usize,
}

impl<T> History<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Append after the cursor, returning the entries removed (redo branch and overflow)
    pub fn push(&mut self, entry: T) -> Vec<T> {
        let mut removed: Vec<T> = self.entries.drain(self.cursor..).collect();
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let overflow = self.entries.len() - self.max_entries;
            removed.extend(self.entries.drain(..overflow));
        }
        self.cursor = self.entries.len();
        removed
    }

    /// Step back, returning the entry that was undone
    pub fn undo(&mut self) -> Option<&T> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Step forward, returning the entry now current
    pub fn redo(&mut self) -> Option<&T> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor - 1)
    }

    /// Move the cursor to just after the last entry matching `found`
    pub fn seek(&mut self, found: impl Fn(&T) -> bool) -> bool {
        match self.entries.iter().rposition(found) {
            Some(index) => {
                self.cursor = index + 1;
                true
            }
            None => false,
        }
    }

    /// Move the cursor to the unfiltered base, keeping every entry for redo
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Entry at the cursor; `None` at the base
    pub fn current(&self) -> Option<&T> {
        self.cursor.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-establish invariants after deserialization
    fn normalize(&mut self, max_entries: usize) {
        self.max_entries = max_entries.max(1);
        if self.entries.len() > self.max_entries {
            let overflow = self.entries.len() - self.max_entries;
            self.entries.drain(..overflow);
            self.cursor = self.cursor.saturating_sub(overflow);
        }
        self.cursor = self.cursor.min(self.entries.len());
    }
}

/// One applied filter of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub dataset: DatasetId,
    /// Empty means no filter
    pub subset: String,
    pub feature_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl HistoryEntry {
    pub fn new(
        dataset: DatasetId,
        subset: impl Into<String>,
        feature_count: Option<u64>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            dataset,
            subset: subset.into(),
            feature_count,
            timestamp: Utc::now(),
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub const BASE_DESCRIPTION: &'static str = "no filter";

    /// The unfiltered state
    pub fn base(dataset: DatasetId) -> Self {
        Self::new(dataset, "", None, Self::BASE_DESCRIPTION)
    }

    pub fn is_unfiltered(&self) -> bool {
        self.subset.trim().is_empty()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Record the artifacts backing the subset
    pub fn with_artifacts(self, artifacts: &[Artifact]) -> Self {
        if artifacts.is_empty() {
            return self;
        }
        match serde_json::to_value(artifacts) {
            Ok(value) => self.with_metadata(ARTIFACTS_KEY, value),
            Err(e) => {
                tracing::warn!(error = %e, "could not record artifacts in history");
                self
            }
        }
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.metadata
            .get(ARTIFACTS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

fn load_record<T: for<'de> Deserialize<'de>>(store: &dyn RecordStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Timeline of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterHistory {
    pub dataset: DatasetId,
    timeline: History<HistoryEntry>,
}

impl FilterHistory {
    pub fn new(dataset: DatasetId, max_entries: usize) -> Self {
        Self {
            dataset,
            timeline: History::new(max_entries),
        }
    }

    /// Returns entries dropped from the timeline
    pub fn push(&mut self, entry: HistoryEntry) -> Vec<HistoryEntry> {
        self.timeline.push(entry)
    }

    /// State after stepping back; the base entry at position 0
    pub fn undo(&mut self) -> Option<HistoryEntry> {
        self.timeline.undo()?;
        Some(self.current())
    }

    pub fn redo(&mut self) -> Option<HistoryEntry> {
        self.timeline.redo().cloned()
    }

    /// Point the cursor at `entry`, pushing it when the timeline no longer holds it.
    /// Returns entries dropped by the push.
    pub fn sync_to(&mut self, entry: &HistoryEntry) -> Vec<HistoryEntry> {
        if self.timeline.seek(|e| e.timestamp == entry.timestamp && e.subset == entry.subset) {
            return Vec::new();
        }
        if entry.is_unfiltered() && entry.description == HistoryEntry::BASE_DESCRIPTION {
            self.timeline.rewind();
            return Vec::new();
        }
        self.timeline.push(entry.clone())
    }

    pub fn current(&self) -> HistoryEntry {
        self.timeline
            .current()
            .cloned()
            .unwrap_or_else(|| HistoryEntry::base(self.dataset.clone()))
    }

    pub fn can_undo(&self) -> bool {
        self.timeline.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.timeline.can_redo()
    }

    pub fn cursor(&self) -> usize {
        self.timeline.cursor()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        self.timeline.entries()
    }

    pub fn save(&self, store: &dyn RecordStore) -> Result<()> {
        store.put(&history_key(&self.dataset), &serde_json::to_value(self)?)
    }

    pub fn load(store: &dyn RecordStore, dataset: &DatasetId, max_entries: usize) -> Result<Option<Self>> {
        let Some(mut history) = load_record::<Self>(store, &history_key(dataset))? else {
            return Ok(None);
        };
        history.timeline.normalize(max_entries);
        Ok(Some(history))
    }
}

/// Entries of several datasets applied by one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// State of each dataset after the request
    pub entries: BTreeMap<DatasetId, HistoryEntry>,
    /// State of the same datasets before it
    pub previous: BTreeMap<DatasetId, HistoryEntry>,
}

impl GlobalSnapshot {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            timestamp: Utc::now(),
            entries: BTreeMap::new(),
            previous: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, before: HistoryEntry, after: HistoryEntry) {
        self.previous.insert(after.dataset.clone(), before);
        self.entries.insert(after.dataset.clone(), after);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Timeline of multi-dataset requests, replayed as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalHistory {
    timeline: History<GlobalSnapshot>,
}

impl GlobalHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            timeline: History::new(max_entries),
        }
    }

    pub fn push(&mut self, snapshot: GlobalSnapshot) -> Vec<GlobalSnapshot> {
        self.timeline.push(snapshot)
    }

    /// Dataset states to restore when stepping back
    pub fn undo(&mut self) -> Option<BTreeMap<DatasetId, HistoryEntry>> {
        self.timeline.undo().map(|s| s.previous.clone())
    }

    /// Dataset states to restore when stepping forward
    pub fn redo(&mut self) -> Option<BTreeMap<DatasetId, HistoryEntry>> {
        self.timeline.redo().map(|s| s.entries.clone())
    }

    pub fn can_undo(&self) -> bool {
        self.timeline.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.timeline.can_redo()
    }

    pub fn snapshots(&self) -> &[GlobalSnapshot] {
        self.timeline.entries()
    }

    pub fn cursor(&self) -> usize {
        self.timeline.cursor()
    }

    pub fn save(&self, store: &dyn RecordStore) -> Result<()> {
        store.put(GLOBAL_HISTORY_KEY, &serde_json::to_value(self)?)
    }

    pub fn load(store: &dyn RecordStore, max_entries: usize) -> Result<Option<Self>> {
        let Some(mut history) = load_record::<Self>(store, GLOBAL_HISTORY_KEY)? else {
            return Ok(None);
        };
        history.timeline.normalize(max_entries);
        Ok(Some(history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ArtifactKind;
    use crate::store::MemoryRecordStore;

    fn entry(subset: &str) -> HistoryEntry {
        HistoryEntry::new(DatasetId::new("roads"), subset, Some(1), subset)
    }

    fn subsets(history: &FilterHistory) -> Vec<&str> {
        history.entries().iter().map(|e| e.subset.as_str()).collect()
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut history = FilterHistory::new(DatasetId::new("roads"), 10);
        assert!(!history.can_undo());
        history.push(entry("a"));
        history.push(entry("b"));

        assert_eq!(history.undo().unwrap().subset, "a");
        assert_eq!(history.undo().unwrap().subset, "");
        assert!(history.undo().is_none());
        assert_eq!(history.cursor(), 0);

        assert_eq!(history.redo().unwrap().subset, "a");
        assert_eq!(history.redo().unwrap().subset, "b");
        assert!(history.redo().is_none());
        assert_eq!(history.current().subset, "b");
    }

    #[test]
    fn test_undo_redo_round_trip_any_depth() {
        for n in 0..=5 {
            let mut history = FilterHistory::new(DatasetId::new("roads"), 10);
            for i in 0..n {
                history.push(entry(&format!("s{}", i)));
            }
            let top = history.current();
            for _ in 0..n {
                assert!(history.undo().is_some());
            }
            assert!(history.undo().is_none());
            assert!(history.current().is_unfiltered());
            for _ in 0..n {
                assert!(history.redo().is_some());
            }
            assert!(history.redo().is_none());
            assert_eq!(history.current().subset, top.subset);
            assert_eq!(history.cursor(), n);
        }
    }

    #[test]
    fn test_sync_to_seeks_or_pushes() {
        let mut history = FilterHistory::new(DatasetId::new("roads"), 10);
        history.push(entry("a"));
        let b = entry("b");
        history.push(b.clone());

        assert!(history.sync_to(&HistoryEntry::base(DatasetId::new("roads"))).is_empty());
        assert_eq!(history.cursor(), 0);
        assert!(history.sync_to(&b).is_empty());
        assert_eq!(history.cursor(), 2);

        // a state the timeline lost is appended
        history.undo();
        let removed = history.sync_to(&entry("c"));
        assert_eq!(removed.len(), 1);
        assert_eq!(subsets(&history), vec!["a", "c"]);
        assert_eq!(history.current().subset, "c");
    }

    #[test]
    fn test_push_truncates_redo_branch() {
        let mut history = FilterHistory::new(DatasetId::new("roads"), 10);
        for s in ["a", "b", "c"] {
            history.push(entry(s));
        }
        history.undo();
        history.undo();
        let removed = history.push(entry("d"));
        assert_eq!(subsets(&history), vec!["a", "d"]);
        assert_eq!(
            removed.iter().map(|e| e.subset.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert!(!history.can_redo());
    }

    #[test]
    fn test_bounded_length_drops_oldest() {
        let mut timeline: History<u32> = History::new(3);
        for n in 1..=3 {
            assert!(timeline.push(n).is_empty());
        }
        assert_eq!(timeline.push(4), vec![1]);
        assert_eq!(timeline.entries(), &[2, 3, 4]);
        assert_eq!(timeline.cursor(), 3);
        assert_eq!(timeline.current(), Some(&4));
    }

    #[test]
    fn test_artifacts_in_metadata() {
        let artifact = Artifact {
            kind: ArtifactKind::MaterializedRelation,
            dataset: DatasetId::new("roads"),
            name: "\"public\".\"gf_mv_roads_1\"".to_string(),
        };
        let e = entry("x").with_artifacts(std::slice::from_ref(&artifact));
        assert_eq!(e.artifacts(), vec![artifact]);
        assert!(entry("y").artifacts().is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let store = MemoryRecordStore::new();
        let mut history = FilterHistory::new(DatasetId::new("roads"), 10);
        history.push(entry("a"));
        history.push(entry("b"));
        history.undo();
        history.save(&store).unwrap();

        let loaded = FilterHistory::load(&store, &DatasetId::new("roads"), 10)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, history);
        assert!(FilterHistory::load(&store, &DatasetId::new("other"), 10)
            .unwrap()
            .is_none());

        // a smaller bound on load keeps the cursor in range
        let shrunk = FilterHistory::load(&store, &DatasetId::new("roads"), 1)
            .unwrap()
            .unwrap();
        assert_eq!(subsets(&shrunk), vec!["b"]);
        assert_eq!(shrunk.cursor(), 0);
    }

    #[test]
    fn test_global_undo_restores_previous_states() {
        let mut global = GlobalHistory::new(10);
        let mut snapshot = GlobalSnapshot::new("two layers");
        snapshot.record(
            HistoryEntry::base(DatasetId::new("a")),
            HistoryEntry::new(DatasetId::new("a"), "x > 1", Some(3), "f"),
        );
        snapshot.record(
            HistoryEntry::new(DatasetId::new("b"), "old", Some(9), "g"),
            HistoryEntry::new(DatasetId::new("b"), "y > 1", Some(4), "f"),
        );
        global.push(snapshot);

        let restored = global.undo().unwrap();
        assert!(restored[&DatasetId::new("a")].is_unfiltered());
        assert_eq!(restored[&DatasetId::new("b")].subset, "old");
        assert!(global.undo().is_none());

        let replayed = global.redo().unwrap();
        assert_eq!(replayed[&DatasetId::new("a")].subset, "x > 1");

        let store = MemoryRecordStore::new();
        global.save(&store).unwrap();
        assert_eq!(GlobalHistory::load(&store, 10).unwrap().unwrap(), global);
    }
}
