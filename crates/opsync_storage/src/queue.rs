//! Operation queue trait definition.

use crate::error::StorageResult;
use opsync_protocol::{Operation, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An ordered, project-scoped append log of pending operations.
///
/// # Invariants
///
/// - `push` assigns strictly ascending identifiers
/// - `pull_oldest` returns records in push order
/// - stored records are never rewritten, only deleted
/// - deleting an identifier that is already gone is a no-op
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait OperationQueue: Send + Sync {
    /// Appends an operation and returns its assigned identifier.
    ///
    /// Any identifier already set on `operation` is ignored.
    fn push(&self, operation: &Operation) -> StorageResult<OperationId>;

    /// Appends a raw record for `project_id`.
    ///
    /// Used for records written by older clients, whose shape may not match
    /// the current [`Operation`] layout.
    fn push_record(&self, project_id: &str, record: Value) -> StorageResult<OperationId>;

    /// Returns up to `limit` of the oldest raw records for a project.
    ///
    /// Every returned record is a JSON object carrying its `id`.
    fn pull_oldest(&self, project_id: &str, limit: usize) -> StorageResult<Vec<Value>>;

    /// Deletes records by identifier and returns how many were removed.
    fn delete(&self, ids: &[OperationId]) -> StorageResult<usize>;

    /// Returns the number of pending records for a project.
    fn count(&self, project_id: &str) -> StorageResult<usize>;

    /// Returns the projects that have pending records.
    fn projects(&self) -> StorageResult<Vec<String>>;
}

/// A stored queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Queue-assigned identifier.
    pub id: OperationId,
    /// Owning project.
    pub project_id: String,
    /// Raw record as written.
    pub record: Value,
}

impl QueueEntry {
    /// Creates an entry from an operation.
    pub fn from_operation(id: OperationId, operation: &Operation) -> StorageResult<Self> {
        let record = serde_json::to_value(operation)?;
        Ok(Self {
            id,
            project_id: operation.project_id.clone(),
            record,
        })
    }

    /// Returns the record as handed to readers: an object with `id` set.
    ///
    /// Non-object records are wrapped as `{"id": .., "payload": record}`.
    pub fn to_record(&self) -> Value {
        match &self.record {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("id".to_string(), Value::from(self.id));
                Value::Object(map)
            }
            other => {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::from(self.id));
                map.insert("payload".to_string(), other.clone());
                Value::Object(map)
            }
        }
    }
}
