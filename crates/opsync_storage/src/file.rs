//! Directory-backed store for persistent queues.

use crate::error::{StorageError, StorageResult};
use crate::queue::{OperationQueue, QueueEntry};
use crate::version::VersionStore;
use fs2::FileExt;
use opsync_protocol::{Operation, OperationId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = "LOCK";
const QUEUE_FILE: &str = "queue.jsonl";
const META_FILE: &str = "queue.meta.json";
const VERSIONS_FILE: &str = "versions.json";

/// A directory-backed operation queue and version store.
///
/// # Layout
///
/// - `queue.jsonl`: one [`QueueEntry`] per line, in push order
/// - `queue.meta.json`: the next identifier to assign
/// - `versions.json`: project id to last acknowledged version
/// - `LOCK`: held exclusively while the store is open
///
/// # Durability
///
/// - `push` appends one line and syncs the file before returning
/// - `delete` and `save_version` rewrite their file through a temporary file
///   and a rename, so a crash leaves either the old or the new contents
///
/// A truncated or corrupt line (for example after a crash mid-append) is
/// skipped with a warning when the store is opened.
///
/// # Example
///
/// ```no_run
/// use opsync_storage::{FileStore, OperationQueue};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("sync-data")).unwrap();
/// println!("{} pending", store.count("project-1").unwrap());
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    _lock_file: File,
    state: RwLock<FileState>,
}

#[derive(Debug)]
struct FileState {
    entries: Vec<QueueEntry>,
    next_id: OperationId,
    versions: HashMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueMeta {
    next_id: OperationId,
}

impl FileStore {
    /// Opens or creates a store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the directory,
    /// or an I/O error if it cannot be created or read.
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        let (entries, skipped) = load_entries(&path.join(QUEUE_FILE))?;
        let meta: Option<QueueMeta> = read_json(&path.join(META_FILE))?;
        let versions: HashMap<String, u64> =
            read_json(&path.join(VERSIONS_FILE))?.unwrap_or_default();

        let after_last = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let next_id = meta.map(|m| m.next_id).unwrap_or(1).max(after_last);

        debug!(
            path = %path.display(),
            pending = entries.len(),
            next_id,
            "opened file store"
        );

        let store = Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
            state: RwLock::new(FileState {
                entries,
                next_id,
                versions,
            }),
        };

        // Drop unreadable lines so later appends start on a clean line.
        if skipped > 0 {
            let state = store.state.read();
            store.rewrite_queue(&state.entries, state.next_id)?;
            drop(state);
        }
        Ok(store)
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the total number of pending records across all projects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if no records are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Returns every stored version.
    #[must_use]
    pub fn versions(&self) -> HashMap<String, u64> {
        self.state.read().versions.clone()
    }

    fn append(&self, project_id: &str, record: Value) -> StorageResult<OperationId> {
        let mut state = self.state.write();
        let entry = QueueEntry {
            id: state.next_id,
            project_id: project_id.to_string(),
            record,
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(QUEUE_FILE))?;
        file.write_all(&line)?;
        file.sync_data()?;

        let id = entry.id;
        state.next_id = id + 1;
        state.entries.push(entry);
        Ok(id)
    }

    fn rewrite_queue(&self, entries: &[QueueEntry], next_id: OperationId) -> StorageResult<()> {
        let mut contents = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut contents, entry)?;
            contents.push(b'\n');
        }
        write_atomic(&self.path.join(QUEUE_FILE), &contents)?;
        write_json_atomic(
            &self.path.join(META_FILE),
            &QueueMeta { next_id },
        )
    }
}

impl OperationQueue for FileStore {
    fn push(&self, operation: &Operation) -> StorageResult<OperationId> {
        let record = QueueEntry::from_operation(0, operation)?.record;
        self.append(&operation.project_id, record)
    }

    fn push_record(&self, project_id: &str, record: Value) -> StorageResult<OperationId> {
        self.append(project_id, record)
    }

    fn pull_oldest(&self, project_id: &str, limit: usize) -> StorageResult<Vec<Value>> {
        Ok(self
            .state
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
        let mut state = self.state.write();
        let remaining: Vec<QueueEntry> = state
            .entries
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .cloned()
            .collect();
        let removed = state.entries.len() - remaining.len();

        if removed > 0 {
            self.rewrite_queue(&remaining, state.next_id)?;
            state.entries = remaining;
        }
        Ok(removed)
    }

    fn count(&self, project_id: &str) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .entries
            .iter()
            .filter(|e| e.project_id == project_id)
            .count())
    }

    fn projects(&self) -> StorageResult<Vec<String>> {
        let projects: BTreeSet<_> = self
            .state
            .read()
            .entries
            .iter()
            .map(|e| e.project_id.clone())
            .collect();
        Ok(projects.into_iter().collect())
    }
}

impl VersionStore for FileStore {
    fn load_version(&self, project_id: &str) -> StorageResult<Option<u64>> {
        Ok(self.state.read().versions.get(project_id).copied())
    }

    fn save_version(&self, project_id: &str, version: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        let mut versions = state.versions.clone();
        versions.insert(project_id.to_string(), version);
        write_json_atomic(&self.path.join(VERSIONS_FILE), &versions)?;
        state.versions = versions;
        Ok(())
    }
}

fn load_entries(path: &Path) -> StorageResult<(Vec<QueueEntry>, usize)> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut skipped = 0;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueueEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping corrupt queue record");
                skipped += 1;
            }
        }
    }
    Ok((entries, skipped))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            StorageError::Corrupted(format!("{}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn op(project: &str, kind: &str) -> Operation {
        Operation::new(kind, project, "main", json!({"k": kind}), "dev")
    }

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.push(&op("p", "a")).unwrap();
            store.push(&op("p", "b")).unwrap();
            store.save_version("p", 12).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let records = store.pull_oldest("p", 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "a");
        assert_eq!(records[1]["type"], "b");
        assert_eq!(store.load_version("p").unwrap(), Some(12));
    }

    #[test]
    fn deleted_ids_are_not_reused() {
        let dir = tempdir().unwrap();
        let last = {
            let store = FileStore::open(dir.path()).unwrap();
            let a = store.push(&op("p", "a")).unwrap();
            let b = store.push(&op("p", "b")).unwrap();
            store.delete(&[a, b]).unwrap();
            b
        };

        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
        let next = store.push(&op("p", "c")).unwrap();
        assert!(next > last);
    }

    #[test]
    fn delete_persists() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            let a = store.push(&op("p", "a")).unwrap();
            store.push(&op("p", "b")).unwrap();
            assert_eq!(store.delete(&[a]).unwrap(), 1);
            assert_eq!(store.delete(&[a]).unwrap(), 0);
        }

        let store = FileStore::open(dir.path()).unwrap();
        let records = store.pull_oldest("p", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], "b");
    }

    #[test]
    fn failed_delete_keeps_entries() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let a = store.push(&op("p", "a")).unwrap();
        store.push(&op("p", "b")).unwrap();

        // A directory where the rewrite's temp file goes makes it fail.
        let blocker = dir.path().join("queue.tmp");
        fs::create_dir(&blocker).unwrap();
        assert!(matches!(store.delete(&[a]), Err(StorageError::Io(_))));
        assert_eq!(store.count("p").unwrap(), 2);

        fs::remove_dir(&blocker).unwrap();
        assert_eq!(store.delete(&[a]).unwrap(), 1);
        assert_eq!(store.count("p").unwrap(), 1);
    }

    #[test]
    fn corrupt_line_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.push(&op("p", "a")).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(QUEUE_FILE))
            .unwrap();
        file.write_all(b"{\"id\": 2, \"projectId\": \"p\", \"rec").unwrap();
        drop(file);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.count("p").unwrap(), 1);

        store.push(&op("p", "b")).unwrap();
        drop(store);
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.count("p").unwrap(), 2);
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _store = FileStore::open(dir.path()).unwrap();
        let second = FileStore::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn raw_records_keep_their_shape() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let id = store
            .push_record("p", json!({"kind": "legacy", "nodes": [1, 2]}))
            .unwrap();

        let records = store.pull_oldest("p", 1).unwrap();
        assert_eq!(records[0]["id"], id);
        assert_eq!(records[0]["kind"], "legacy");
        assert!(records[0].get("type").is_none());
    }
}
