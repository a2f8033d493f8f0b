//! Multi-version row storage.
//!
//! Every committed write appends a version stamped with the commit clock.
//! Readers pick the newest version at or before their read point.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// A row address: (table, key).
pub(crate) type RowId = (String, String);

/// Pending writes of a transaction; `None` deletes the row.
pub(crate) type WriteSet = BTreeMap<RowId, Option<Value>>;

#[derive(Debug, Clone)]
struct Version {
    committed_at: u64,
    value: Option<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    clock: u64,
    tables: HashMap<String, BTreeMap<String, Vec<Version>>>,
}

impl Store {
    /// Commit clock of the most recent commit.
    pub(crate) fn now(&self) -> u64 {
        self.clock
    }

    fn versions(&self, id: &RowId) -> Option<&Vec<Version>> {
        self.tables.get(&id.0).and_then(|rows| rows.get(&id.1))
    }

    /// Row value as of commit `at`.
    pub(crate) fn read(&self, id: &RowId, at: u64) -> Option<&Value> {
        self.versions(id)?
            .iter()
            .rev()
            .find(|version| version.committed_at <= at)
            .and_then(|version| version.value.as_ref())
    }

    /// Latest committed row value.
    pub(crate) fn latest(&self, id: &RowId) -> Option<&Value> {
        self.read(id, self.clock)
    }

    /// Commit that last wrote the row, if it was ever written.
    pub(crate) fn last_modified(&self, id: &RowId) -> Option<u64> {
        self.versions(id)?.last().map(|version| version.committed_at)
    }

    /// Check if the row was written by a commit after `snapshot`.
    pub(crate) fn modified_since(&self, id: &RowId, snapshot: u64) -> bool {
        self.last_modified(id).is_some_and(|at| at > snapshot)
    }

    /// Keys of `table` that have any history.
    pub(crate) fn keys(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows of `table` visible as of commit `at`, ordered by key.
    pub(crate) fn scan(&self, table: &str, at: u64) -> BTreeMap<String, Value> {
        let Some(rows) = self.tables.get(table) else {
            return BTreeMap::new();
        };
        rows.iter()
            .filter_map(|(key, versions)| {
                versions
                    .iter()
                    .rev()
                    .find(|version| version.committed_at <= at)
                    .and_then(|version| version.value.clone())
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    /// Apply a write set as one new commit, returning its clock value.
    pub(crate) fn apply(&mut self, writes: WriteSet) -> u64 {
        if writes.is_empty() {
            return self.clock;
        }
        self.clock += 1;
        let committed_at = self.clock;
        for ((table, key), value) in writes {
            self.tables
                .entry(table)
                .or_default()
                .entry(key)
                .or_default()
                .push(Version {
                    committed_at,
                    value,
                });
        }
        committed_at
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn id(table: &str, key: &str) -> RowId {
        (table.to_string(), key.to_string())
    }

    #[test]
    fn test_versions_visible_by_commit() {
        let mut store = Store::default();
        assert_eq!(store.now(), 0);

        let first = store.apply(WriteSet::from([(id("trades", "t1"), Some(json!(1)))]));
        let second = store.apply(WriteSet::from([(id("trades", "t1"), Some(json!(2)))]));
        assert_eq!((first, second), (1, 2));

        assert_eq!(store.read(&id("trades", "t1"), 0), None);
        assert_eq!(store.read(&id("trades", "t1"), 1), Some(&json!(1)));
        assert_eq!(store.latest(&id("trades", "t1")), Some(&json!(2)));
        assert!(store.modified_since(&id("trades", "t1"), 1));
        assert!(!store.modified_since(&id("trades", "t1"), 2));
    }

    #[test]
    fn test_delete_and_scan() {
        let mut store = Store::default();
        store.apply(WriteSet::from([
            (id("trades", "a"), Some(json!("a"))),
            (id("trades", "b"), Some(json!("b"))),
        ]));
        store.apply(WriteSet::from([(id("trades", "a"), None)]));

        assert_eq!(store.scan("trades", 1).len(), 2);
        let now = store.scan("trades", store.now());
        assert_eq!(now.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(store.keys("trades"), vec!["a", "b"]);
        assert!(store.scan("missing", 1).is_empty());
    }

    #[test]
    fn test_empty_write_set_does_not_tick() {
        let mut store = Store::default();
        assert_eq!(store.apply(WriteSet::new()), 0);
        assert_eq!(store.now(), 0);
    }
}
