//! Client operations.

use crate::error::ProtocolResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Locally unique operation identifier, assigned by the queue on persist.
pub type OperationId = u64;

/// Layer an operation targets when it does not name one.
pub const BASE_LAYER_ID: &str = "base";

/// Timeline used when a stored record does not carry one.
pub const DEFAULT_TIMELINE_ID: &str = "main";

/// A single mutation intended for the server.
///
/// Operations are immutable once created. The queue never rewrites a stored
/// operation; it only deletes it after the server acknowledges it.
///
/// # Fields
///
/// - `id`: assigned by the queue, `None` until persisted
/// - `op_type`: tag identifying the mutation kind (serialized as `type`)
/// - `payload`: opaque structured data, never interpreted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Queue-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<OperationId>,
    /// Mutation kind.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Owning project.
    pub project_id: String,
    /// Timeline within the project.
    pub timeline_id: String,
    /// Target layer, [`BASE_LAYER_ID`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    /// Opaque mutation data.
    #[serde(default)]
    pub payload: Value,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
    /// Originating client.
    pub device_id: String,
}

impl Operation {
    /// Creates a new, not yet persisted operation stamped with the current time.
    pub fn new(
        op_type: impl Into<String>,
        project_id: impl Into<String>,
        timeline_id: impl Into<String>,
        payload: Value,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            op_type: op_type.into(),
            project_id: project_id.into(),
            timeline_id: timeline_id.into(),
            layer_id: None,
            payload,
            timestamp: Utc::now(),
            device_id: device_id.into(),
        }
    }

    /// Sets the target layer.
    pub fn with_layer(mut self, layer_id: impl Into<String>) -> Self {
        self.layer_id = Some(layer_id.into());
        self
    }

    /// Sets the identifier.
    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the creation instant.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the target layer, falling back to [`BASE_LAYER_ID`].
    pub fn layer_id(&self) -> &str {
        self.layer_id.as_deref().unwrap_or(BASE_LAYER_ID)
    }

    /// Returns true once the queue has assigned an identifier.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
