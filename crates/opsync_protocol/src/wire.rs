//! Request/response wire shapes.
//!
//! These mirror the JSON documents exchanged with the sync server. Field names
//! are camelCase on the wire. Identifiers may arrive as numbers or strings, so
//! they are carried as [`WireId`] until a network port maps them back to
//! [`OperationId`]s.

use crate::batch::OperationBatch;
use crate::error::ProtocolResult;
use crate::operation::{Operation, OperationId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use uuid::Uuid;

/// Prefix marking identifiers generated for operations that were never
/// persisted locally.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Generates a fresh temporary identifier.
pub fn temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple())
}

/// Encodes any wire message to JSON bytes.
pub fn to_json<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decodes any wire message from JSON bytes.
pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// An operation identifier as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    /// Numeric identifier.
    Number(Number),
    /// String identifier (numeric string or temporary id).
    Text(String),
}

impl WireId {
    /// Wraps a persisted operation identifier.
    pub fn from_id(id: OperationId) -> Self {
        Self::Number(Number::from(id))
    }

    /// Maps the identifier back to a persisted operation id.
    ///
    /// Temporary identifiers and anything that is not a non-negative integer
    /// map to `None`.
    pub fn as_operation_id(&self) -> Option<OperationId> {
        match self {
            WireId::Number(n) => n.as_u64(),
            WireId::Text(s) if s.starts_with(TEMP_ID_PREFIX) => None,
            WireId::Text(s) => s.parse::<u64>().ok(),
        }
    }

    /// Returns true for identifiers carrying the temporary prefix.
    pub fn is_temporary(&self) -> bool {
        matches!(self, WireId::Text(s) if s.starts_with(TEMP_ID_PREFIX))
    }
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireId::Number(n) => write!(f, "{}", n),
            WireId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for WireId {
    fn from(value: &str) -> Self {
        WireId::Text(value.to_string())
    }
}

/// An operation as sent to or received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    /// Identifier; temporary for operations that were never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WireId>,
    /// Mutation kind.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Owning project (present on server-originated operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Timeline within the project.
    pub timeline_id: String,
    /// Target layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    /// Opaque mutation data.
    #[serde(default)]
    pub payload: Value,
    /// Originating client.
    pub device_id: String,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
}

impl WireOperation {
    /// Builds the wire form of a local operation.
    ///
    /// Operations without an identifier get a fresh temporary one.
    pub fn from_operation(op: &Operation) -> Self {
        let id = match op.id {
            Some(id) => WireId::from_id(id),
            None => WireId::Text(temp_id()),
        };
        Self {
            id: Some(id),
            op_type: op.op_type.clone(),
            project_id: None,
            timeline_id: op.timeline_id.clone(),
            layer_id: Some(op.layer_id().to_string()),
            payload: op.payload.clone(),
            device_id: op.device_id.clone(),
            timestamp: op.timestamp,
        }
    }

    /// Sets the owning project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Converts back into an [`Operation`], using `default_project` when the
    /// wire form does not name one.
    pub fn into_operation(self, default_project: &str) -> Operation {
        Operation {
            id: self.id.as_ref().and_then(WireId::as_operation_id),
            op_type: self.op_type,
            project_id: self
                .project_id
                .unwrap_or_else(|| default_project.to_string()),
            timeline_id: self.timeline_id,
            layer_id: self.layer_id,
            payload: self.payload,
            timestamp: self.timestamp,
            device_id: self.device_id,
        }
    }
}

/// One request/response exchange sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Operations in queue order.
    pub operations: Vec<WireOperation>,
    /// Owning project.
    pub project_id: String,
    /// Version the client believes is authoritative.
    pub last_sync_version: u64,
    /// Sending client.
    pub device_id: String,
}

impl SyncRequest {
    /// Builds the wire request for a batch.
    pub fn from_batch(batch: &OperationBatch) -> Self {
        Self {
            operations: batch
                .operations
                .iter()
                .map(WireOperation::from_operation)
                .collect(),
            project_id: batch.project_id.clone(),
            last_sync_version: batch.last_sync_version,
            device_id: batch.device_id.clone(),
        }
    }
}

/// The server's answer to a [`SyncRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Whether the batch was applied.
    pub success: bool,
    /// Server version after the exchange.
    #[serde(default)]
    pub sync_version: Option<u64>,
    /// Identifiers the server committed.
    #[serde(default)]
    pub applied_operations: Vec<WireId>,
    /// Error messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Opaque conflict descriptions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Value>,
    /// Operations the client is missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_operations: Vec<WireOperation>,
}

/// The server's answer to a catch-up fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsResponse {
    /// Whether the fetch succeeded.
    pub success: bool,
    /// Server version at the time of the fetch.
    #[serde(default)]
    pub sync_version: Option<u64>,
    /// Operations after the requested version, oldest first.
    #[serde(default)]
    pub operations: Vec<WireOperation>,
    /// Error messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn applied_ids_accept_numbers_and_strings() {
        let response: SyncResponse = serde_json::from_value(json!({
            "success": true,
            "syncVersion": 10,
            "appliedOperations": ["1", 2, "temp_abc", -4, "NaN"]
        }))
        .unwrap();

        let ids: Vec<_> = response
            .applied_operations
            .iter()
            .filter_map(WireId::as_operation_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(response.applied_operations[2].is_temporary());
    }

    #[test]
    fn request_assigns_temp_ids() {
        let persisted = Operation::new("a", "p", "t", json!({}), "d").with_id(5);
        let fresh = Operation::new("b", "p", "t", json!({}), "d");
        let batch = OperationBatch::new("p", "d", 3, vec![persisted, fresh]);

        let request = SyncRequest::from_batch(&batch);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["projectId"], "p");
        assert_eq!(value["lastSyncVersion"], 3);
        assert_eq!(value["operations"][0]["id"], 5);
        assert_eq!(value["operations"][0]["layerId"], "base");
        assert!(request.operations[1].id.as_ref().unwrap().is_temporary());
    }

    #[test]
    fn response_defaults_optional_fields() {
        let response: SyncResponse = from_json(br#"{"success":false}"#).unwrap();
        assert!(!response.success);
        assert_eq!(response.sync_version, None);
        assert!(response.applied_operations.is_empty());
        assert!(response.server_operations.is_empty());
    }

    #[test]
    fn wire_operation_uses_default_project() {
        let wire = WireOperation {
            id: Some(WireId::from("12")),
            op_type: "node.move".into(),
            project_id: None,
            timeline_id: "t".into(),
            layer_id: None,
            payload: json!({"x": 4}),
            device_id: "other".into(),
            timestamp: Utc::now(),
        };

        let op = wire.into_operation("p9");
        assert_eq!(op.id, Some(12));
        assert_eq!(op.project_id, "p9");
    }

    proptest! {
        #[test]
        fn numeric_strings_map_to_ids(id in any::<u64>()) {
            prop_assert_eq!(WireId::Text(id.to_string()).as_operation_id(), Some(id));
            prop_assert_eq!(WireId::from_id(id).as_operation_id(), Some(id));
        }

        #[test]
        fn temp_ids_never_map(suffix in "[0-9a-z]{0,16}") {
            let id = WireId::Text(format!("{}{}", TEMP_ID_PREFIX, suffix));
            prop_assert_eq!(id.as_operation_id(), None);
        }
    }
}
