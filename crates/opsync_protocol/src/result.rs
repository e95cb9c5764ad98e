//! Exchange results.

use crate::operation::{Operation, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The server's (or a peer's) answer to a batch or to a catch-up fetch.
///
/// `processed_operations` only ever holds identifiers that were part of the
/// submitted batch. Network ports drop temporary or malformed identifiers
/// before building this value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Whether the server accepted the exchange.
    pub success: bool,
    /// Identifiers the server committed.
    #[serde(default)]
    pub processed_operations: Vec<OperationId>,
    /// Server version after applying the exchange.
    #[serde(default)]
    pub sync_version: Option<u64>,
    /// Error messages.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Opaque conflict descriptions, forwarded upward untouched.
    #[serde(default)]
    pub conflicts: Vec<Value>,
    /// Operations the client is missing.
    #[serde(default)]
    pub server_operations: Vec<Operation>,
}

impl SyncResult {
    /// Creates a successful result.
    pub fn success(processed_operations: Vec<OperationId>, sync_version: Option<u64>) -> Self {
        Self {
            success: true,
            processed_operations,
            sync_version,
            ..Self::default()
        }
    }

    /// Creates a failed result carrying one error message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    /// Sets the server version.
    pub fn with_sync_version(mut self, version: u64) -> Self {
        self.sync_version = Some(version);
        self
    }

    /// Sets the operations the client is missing.
    pub fn with_server_operations(mut self, operations: Vec<Operation>) -> Self {
        self.server_operations = operations;
        self
    }

    /// Sets the conflicts.
    pub fn with_conflicts(mut self, conflicts: Vec<Value>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Returns true if the result carries operations the client is missing.
    pub fn has_server_operations(&self) -> bool {
        !self.server_operations.is_empty()
    }

    /// Joins all error messages, or a generic message when there are none.
    pub fn error_message(&self) -> String {
        if self.errors.is_empty() {
            "sync rejected by server".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}
