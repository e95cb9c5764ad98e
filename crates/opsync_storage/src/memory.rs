//! In-memory store for testing and ephemeral sessions.

use crate::error::StorageResult;
use crate::queue::{OperationQueue, QueueEntry};
use crate::version::VersionStore;
use opsync_protocol::{Operation, OperationId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// An in-memory operation queue and version store.
///
/// Contents are lost when the store is dropped. Useful for tests and for
/// sessions that never go offline for long.
///
/// # Thread Safety
///
/// This store is thread-safe; internal locking keeps pushes and deletes
/// consistent.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    entries: Vec<QueueEntry>,
    next_id: OperationId,
    versions: HashMap<String, u64>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryState {
                entries: Vec::new(),
                next_id: 1,
                versions: HashMap::new(),
            }),
        }
    }

    /// Returns the total number of pending records across all projects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if no records are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    fn append(&self, project_id: &str, record: Value) -> OperationId {
        let mut state = self.inner.write();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(QueueEntry {
            id,
            project_id: project_id.to_string(),
            record,
        });
        id
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue for InMemoryStore {
    fn push(&self, operation: &Operation) -> StorageResult<OperationId> {
        let record = QueueEntry::from_operation(0, operation)?.record;
        Ok(self.append(&operation.project_id, record))
    }

    fn push_record(&self, project_id: &str, record: Value) -> StorageResult<OperationId> {
        Ok(self.append(project_id, record))
    }

    fn pull_oldest(&self, project_id: &str, limit: usize) -> StorageResult<Vec<Value>> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .filter(|e| e.project_id == project_id)
            .take(limit)
            .map(QueueEntry::to_record)
            .collect())
    }

    fn delete(&self, ids: &[OperationId]) -> StorageResult<usize> {
        let ids: HashSet<_> = ids.iter().copied().collect();
        let mut state = self.inner.write();
        let before = state.entries.len();
        state.entries.retain(|e| !ids.contains(&e.id));
        Ok(before - state.entries.len())
    }

    fn count(&self, project_id: &str) -> StorageResult<usize> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .filter(|e| e.project_id == project_id)
            .count())
    }

    fn projects(&self) -> StorageResult<Vec<String>> {
        let projects: BTreeSet<_> = self
            .inner
            .read()
            .entries
            .iter()
            .map(|e| e.project_id.clone())
            .collect();
        Ok(projects.into_iter().collect())
    }
}

impl VersionStore for InMemoryStore {
    fn load_version(&self, project_id: &str) -> StorageResult<Option<u64>> {
        Ok(self.inner.read().versions.get(project_id).copied())
    }

    fn save_version(&self, project_id: &str, version: u64) -> StorageResult<()> {
        self.inner
            .write()
            .versions
            .insert(project_id.to_string(), version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(project: &str, kind: &str) -> Operation {
        Operation::new(kind, project, "main", json!({}), "dev")
    }

    #[test]
    fn push_assigns_ascending_ids() {
        let store = InMemoryStore::new();
        let a = store.push(&op("p", "a")).unwrap();
        let b = store.push(&op("p", "b")).unwrap();
        let c = store.push(&op("q", "c")).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn pull_is_fifo_and_project_scoped() {
        let store = InMemoryStore::new();
        store.push(&op("p", "first")).unwrap();
        store.push(&op("q", "other")).unwrap();
        store.push(&op("p", "second")).unwrap();
        store.push(&op("p", "third")).unwrap();

        let records = store.pull_oldest("p", 2).unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r["type"].clone()).collect();
        assert_eq!(kinds, vec![json!("first"), json!("second")]);
        assert_eq!(store.count("p").unwrap(), 3);
        assert_eq!(store.count("q").unwrap(), 1);
    }

    #[test]
    fn delete_twice_is_noop() {
        let store = InMemoryStore::new();
        let a = store.push(&op("p", "a")).unwrap();
        let b = store.push(&op("p", "b")).unwrap();

        assert_eq!(store.delete(&[a, b]).unwrap(), 2);
        assert_eq!(store.delete(&[a, b]).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn projects_are_listed_once() {
        let store = InMemoryStore::new();
        store.push(&op("b", "x")).unwrap();
        store.push(&op("a", "x")).unwrap();
        store.push(&op("b", "x")).unwrap();
        assert_eq!(store.projects().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn versions_per_project() {
        let store = InMemoryStore::new();
        assert_eq!(store.load_version("p").unwrap(), None);
        store.save_version("p", 5).unwrap();
        store.save_version("q", 9).unwrap();
        assert_eq!(store.load_version("p").unwrap(), Some(5));
        assert_eq!(store.load_version("q").unwrap(), Some(9));
    }
}
