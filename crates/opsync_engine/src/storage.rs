//! Storage port: the orchestrator's view of the local operation queue.

use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use opsync_protocol::{Operation, OperationId, DEFAULT_TIMELINE_ID};
use opsync_storage::OperationQueue;
use serde_json::Value;
use std::sync::Arc;

/// Reads and deletes queued operations for one project.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Returns up to `limit` of the oldest pending operations, in order.
    async fn get_pending_operations(&self, limit: usize) -> EngineResult<Vec<Operation>>;

    /// Deletes acknowledged operations. Unknown ids are ignored.
    async fn delete_operations(&self, ids: &[OperationId]) -> EngineResult<()>;

    /// Returns the number of pending operations.
    async fn get_operations_count(&self) -> EngineResult<usize>;
}

/// Storage port over an [`OperationQueue`].
///
/// Records are decoded tolerantly so that entries written by older clients
/// still sync. See [`operation_from_record`] for the defaults.
pub struct QueueStoragePort {
    queue: Arc<dyn OperationQueue>,
    project_id: String,
}

impl QueueStoragePort {
    /// Creates a port for one project's slice of the queue.
    pub fn new(queue: Arc<dyn OperationQueue>, project_id: impl Into<String>) -> Self {
        Self {
            queue,
            project_id: project_id.into(),
        }
    }

    /// Returns the project this port reads.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

#[async_trait]
impl StoragePort for QueueStoragePort {
    async fn get_pending_operations(&self, limit: usize) -> EngineResult<Vec<Operation>> {
        let records = self.queue.pull_oldest(&self.project_id, limit)?;
        Ok(records
            .iter()
            .map(|record| operation_from_record(record, &self.project_id))
            .collect())
    }

    async fn delete_operations(&self, ids: &[OperationId]) -> EngineResult<()> {
        self.queue.delete(ids)?;
        Ok(())
    }

    async fn get_operations_count(&self) -> EngineResult<usize> {
        Ok(self.queue.count(&self.project_id)?)
    }
}

/// Rebuilds an [`Operation`] from a raw queue record.
///
/// Missing fields default as follows:
///
/// | field | default |
/// |---|---|
/// | `type` | `"unknown"` |
/// | `projectId` | `default_project` |
/// | `timelineId` | `"main"` |
/// | `payload` | the whole record |
/// | `timestamp` | now |
/// | `deviceId` | `"unknown"` |
///
/// Timestamps may be RFC 3339 strings or epoch milliseconds.
pub fn operation_from_record(record: &Value, default_project: &str) -> Operation {
    let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);

    let id = record.get("id").and_then(|id| match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    });

    let payload = match record.get("payload") {
        Some(payload) if !payload.is_null() => payload.clone(),
        _ => record.clone(),
    };

    Operation {
        id,
        op_type: text("type").unwrap_or_else(|| "unknown".to_string()),
        project_id: text("projectId").unwrap_or_else(|| default_project.to_string()),
        timeline_id: text("timelineId").unwrap_or_else(|| DEFAULT_TIMELINE_ID.to_string()),
        layer_id: text("layerId"),
        payload,
        timestamp: record
            .get("timestamp")
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        device_id: text("deviceId").unwrap_or_else(|| "unknown".to_string()),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
