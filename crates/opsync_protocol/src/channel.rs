//! Push-channel frames.
//!
//! The client sends one [`BroadcastEnvelope`] per operation. The server
//! either echoes the envelope to the other collaborators of the project or
//! answers the sender with an [`OperationAck`] / [`OperationRejection`]
//! correlated by operation id.

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::WireOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope type tag for operation broadcasts.
pub const OPERATION_BROADCAST: &str = "OPERATION_BROADCAST";

/// Payload of a broadcast envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    /// The broadcast operation.
    pub operation: WireOperation,
    /// Server version after applying the operation, when the server relays it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_version: Option<u64>,
}

/// An operation pushed over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    /// Always [`OPERATION_BROADCAST`].
    #[serde(rename = "type")]
    pub kind: String,
    /// The operation.
    pub payload: BroadcastPayload,
    /// Sending user.
    pub user_id: String,
    /// Owning project.
    pub project_id: String,
    /// Send instant.
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEnvelope {
    /// Wraps an operation for sending.
    pub fn new(
        operation: WireOperation,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: OPERATION_BROADCAST.to_string(),
            payload: BroadcastPayload {
                operation,
                sync_version: None,
            },
            user_id: user_id.into(),
            project_id: project_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Returns the correlation id (the operation id as a string).
    pub fn operation_id(&self) -> Option<String> {
        self.payload.operation.id.as_ref().map(|id| id.to_string())
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Positive correlation reply to a pushed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAck {
    /// Correlation id.
    pub operation_id: String,
    /// Whether the server applied the operation.
    pub success: bool,
    /// Server version after applying the operation.
    #[serde(default)]
    pub sync_version: Option<u64>,
    /// Opaque conflict descriptions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Value>,
}

/// Negative correlation reply to a pushed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRejection {
    /// Correlation id.
    pub operation_id: String,
    /// Error message.
    pub error: String,
}

/// Any frame the server may send down the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Operation from another collaborator (or an echo of our own).
    Broadcast(BroadcastEnvelope),
    /// Correlation error.
    Rejection(OperationRejection),
    /// Correlation result.
    Ack(OperationAck),
}

impl ServerFrame {
    /// Decodes a text frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        if let ServerFrame::Broadcast(envelope) = &frame {
            if envelope.kind != OPERATION_BROADCAST {
                return Err(ProtocolError::invalid_structure(format!(
                    "unknown envelope type: {}",
                    envelope.kind
                )));
            }
        }
        Ok(frame)
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
