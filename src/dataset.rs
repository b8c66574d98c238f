//! Thread-safe dataset produced by one retrieval.
//!
//! Maps group keys to flat `field path -> value` maps. Both levels accept
//! concurrent inserts, so sibling extraction tasks write without
//! coordinating. Read the dataset through [`Dataset::snapshot`] once the
//! retrieval has joined; earlier reads may see partially written groups.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Serialize, Serializer};

use crate::extraction::{Extractor, FieldPath};
use crate::query::FieldSink;

/// Sorted fields of one group.
pub type GroupFields = BTreeMap<String, String>;

/// Sorted `group key -> fields` view of a dataset.
pub type DatasetMap = BTreeMap<String, GroupFields>;

/// Field map of one group, shared between the dataset and its writers.
#[derive(Debug, Clone, Default)]
pub struct GroupEntry {
    fields: Arc<DashMap<String, String>>,
}

impl GroupEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value at a field path, replacing any previous value.
    pub fn insert(&self, path: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(path.into(), value.into());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.fields.get(path).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy the fields into a sorted map.
    pub fn to_sorted(&self) -> GroupFields {
        self.fields
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl FieldSink for GroupEntry {
    fn record(&mut self, path: &FieldPath, value: String) {
        self.insert(path.as_str(), value);
    }
}

impl Extractor for GroupEntry {
    fn extract(&self, path: &FieldPath) -> Option<String> {
        self.get(path.as_str())
    }
}

/// The group key to field map aggregate.
///
/// Cloning is cheap; clones share the same underlying maps.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    groups: Arc<DashMap<String, GroupEntry>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `key`, creating it if needed.
    ///
    /// # Arguments
    /// * `key` - Group key
    ///
    /// # Returns
    /// A handle sharing the group's field map
    pub fn entry(&self, key: &str) -> GroupEntry {
        if let Some(existing) = self.groups.get(key) {
            return existing.value().clone();
        }
        self.groups.entry(key.to_string()).or_default().value().clone()
    }

    /// Get the entry for `key` if the group has been written to.
    pub fn get(&self, key: &str) -> Option<GroupEntry> {
        self.groups.get(key).map(|e| e.value().clone())
    }

    /// Writer that creates the group's entry on its first write.
    pub fn writer(&self, key: &str) -> GroupWriter {
        GroupWriter {
            dataset: self.clone(),
            key: key.to_string(),
            entry: None,
        }
    }

    /// Store one value, creating the group if needed.
    pub fn record(&self, key: &str, path: &FieldPath, value: impl Into<String>) {
        self.entry(key).insert(path.as_str(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Copy the dataset into sorted maps.
    pub fn snapshot(&self) -> DatasetMap {
        self.groups
            .iter()
            .map(|e| (e.key().clone(), e.value().to_sorted()))
            .collect()
    }

    pub fn into_sorted(self) -> DatasetMap {
        self.snapshot()
    }

    /// One record per group, sorted by key.
    pub fn records(&self) -> Vec<GroupRecord> {
        self.snapshot()
            .into_iter()
            .map(|(group, fields)| GroupRecord { group, fields })
            .collect()
    }
}

impl Serialize for Dataset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// [`FieldSink`] for one group that defers creating the entry.
#[derive(Debug, Clone)]
pub struct GroupWriter {
    dataset: Dataset,
    key: String,
    entry: Option<GroupEntry>,
}

impl GroupWriter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_written(&self) -> bool {
        self.entry.is_some()
    }
}

impl FieldSink for GroupWriter {
    fn record(&mut self, path: &FieldPath, value: String) {
        let entry = self
            .entry
            .get_or_insert_with(|| self.dataset.entry(&self.key));
        entry.insert(path.as_str(), value);
    }
}

/// Owned, sorted copy of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRecord {
    pub group: String,
    pub fields: GroupFields,
}

impl Extractor for GroupRecord {
    fn extract(&self, path: &FieldPath) -> Option<String> {
        self.fields.get(path.as_str()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_entries_share_storage() {
        let dataset = Dataset::new();
        let a = dataset.entry("CS101");
        let b = dataset.entry("CS101");

        a.insert("name", "1");
        b.insert("name.0", "Intro to CS");

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get("CS101").unwrap().len(), 2);
    }

    #[test]
    fn test_writer_creates_entry_lazily() {
        let dataset = Dataset::new();
        let mut writer = dataset.writer("CS102");
        assert!(!dataset.contains("CS102"));

        writer.record(&"name".into(), "1".to_string());

        assert!(writer.has_written());
        assert_eq!(dataset.get("CS102").unwrap().get("name").as_deref(), Some("1"));
    }

    #[test]
    fn test_concurrent_writers() {
        let dataset = Dataset::new();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dataset = dataset.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        dataset.record(&format!("G{}", i % 5), &FieldPath::from_dotted(&format!("f{}.{}", t, i)), "x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = dataset.snapshot();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.values().map(BTreeMap::len).sum::<usize>(), 400);
    }

    #[test]
    fn test_records_are_sorted_and_extractable() {
        let dataset = Dataset::new();
        dataset.record("MATH200", &"name".into(), "1");
        dataset.record("MATH200", &"name.0".into(), "Linear Algebra");
        dataset.record("CS101", &"name".into(), "0");

        let records = dataset.records();
        assert_eq!(records[0].group, "CS101");
        assert_eq!(records[1].first_occurrence(&"name".into()).as_deref(), Some("Linear Algebra"));
        assert_eq!(records[0].count(&"name".into()), 0);
        assert_eq!(dataset.keys(), vec!["CS101", "MATH200"]);
    }

    #[test]
    fn test_serializes_as_sorted_map() {
        let dataset = Dataset::new();
        dataset.record("B", &"x".into(), "1");
        dataset.record("A", &"y".into(), "2");

        let json = serde_json::to_string(&dataset).unwrap();
        assert_eq!(json, r#"{"A":{"y":"2"},"B":{"x":"1"}}"#);
    }
}
