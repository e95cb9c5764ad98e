//! Orchestrator status and statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// The current state of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not started, or stopped.
    Stopped,
    /// Idle between cycles; timers armed.
    Running,
    /// Timers disarmed until resumed.
    Paused,
    /// A cycle is exchanging batches with the server.
    Syncing,
    /// Retries exhausted or authentication failed.
    Error,
}

impl SyncStatus {
    /// Returns true while a cycle is exchanging batches.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Syncing)
    }

    /// Returns true if `start` may begin from this status.
    pub fn can_start(&self) -> bool {
        matches!(self, SyncStatus::Stopped | SyncStatus::Error)
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Stopped => "stopped",
            SyncStatus::Running => "running",
            SyncStatus::Paused => "paused",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Operations acknowledged by the server.
    pub total_processed: u64,
    /// Batches the server accepted.
    pub successful_syncs: u64,
    /// Cycles that ended in failure.
    pub failed_syncs: u64,
    /// Last time the queue was drained or found empty.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last failure time.
    pub last_error_time: Option<DateTime<Utc>>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Consecutive failed cycles.
    pub current_retry_count: u32,
    /// Operations still queued.
    pub pending_operations: usize,
    /// Delay of the currently scheduled retry.
    pub next_retry_delay: Option<Duration>,
}
