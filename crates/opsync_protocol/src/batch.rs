//! Operation batches.

use crate::operation::{Operation, OperationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bounded, ordered slice of operations plus envelope metadata.
///
/// Batches are built fresh for every network exchange and never persisted.
/// Operations keep the order in which the queue returned them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBatch {
    /// Batch identifier (UUID v4).
    pub id: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Owning project.
    pub project_id: String,
    /// Sending client.
    pub device_id: String,
    /// Version the client believes is authoritative before this batch.
    pub last_sync_version: u64,
    /// Operations in queue order.
    pub operations: Vec<Operation>,
}

impl OperationBatch {
    /// Creates a batch with a fresh identifier.
    pub fn new(
        project_id: impl Into<String>,
        device_id: impl Into<String>,
        last_sync_version: u64,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            project_id: project_id.into(),
            device_id: device_id.into(),
            last_sync_version,
            operations,
        }
    }

    /// Returns the number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the batch carries no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the identifiers of persisted operations, in batch order.
    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.operations.iter().filter_map(|op| op.id).collect()
    }

    /// Returns true if the batch contains an operation with this identifier.
    pub fn contains(&self, id: OperationId) -> bool {
        self.operations.iter().any(|op| op.id == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_ids_preserve_order() {
        let ops = vec![
            Operation::new("a", "p", "t", json!({}), "d").with_id(3),
            Operation::new("b", "p", "t", json!({}), "d"),
            Operation::new("c", "p", "t", json!({}), "d").with_id(1),
        ];
        let batch = OperationBatch::new("p", "d", 7, ops);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.operation_ids(), vec![3, 1]);
        assert!(batch.contains(1));
        assert!(!batch.contains(2));
        assert_eq!(batch.last_sync_version, 7);
    }

    #[test]
    fn batches_get_distinct_ids() {
        let a = OperationBatch::new("p", "d", 0, Vec::new());
        let b = OperationBatch::new("p", "d", 0, Vec::new());
        assert_ne!(a.id, b.id);
        assert!(a.is_empty());
    }
}
