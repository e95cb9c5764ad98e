//! Typed event registry.

use crate::state::{SyncStats, SyncStatus};
use opsync_protocol::{Operation, OperationBatch, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Something observers may want to know about.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle found pending operations and began sending them.
    SyncStarted,
    /// The server accepted a batch.
    SyncCompleted {
        /// Statistics after the batch.
        stats: SyncStats,
    },
    /// Retries were exhausted, or authentication failed.
    SyncFailed {
        /// Human-readable reason.
        reason: String,
        /// Statistics at the time of failure.
        stats: SyncStats,
    },
    /// A batch was acknowledged.
    BatchProcessed {
        /// The batch as sent.
        batch: OperationBatch,
        /// The server's answer.
        result: SyncResult,
    },
    /// The orchestrator moved between statuses.
    StatusChanged {
        /// Previous status.
        old: SyncStatus,
        /// New status.
        new: SyncStatus,
    },
    /// Operations from the server or other collaborators arrived.
    ServerOperationsReceived {
        /// The operations, in server order.
        operations: Vec<Operation>,
        /// Server version they bring the client to, if known.
        version: Option<u64>,
    },
}

impl SyncEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::SyncStarted => SyncEventKind::SyncStarted,
            SyncEvent::SyncCompleted { .. } => SyncEventKind::SyncCompleted,
            SyncEvent::SyncFailed { .. } => SyncEventKind::SyncFailed,
            SyncEvent::BatchProcessed { .. } => SyncEventKind::BatchProcessed,
            SyncEvent::StatusChanged { .. } => SyncEventKind::StatusChanged,
            SyncEvent::ServerOperationsReceived { .. } => SyncEventKind::ServerOperationsReceived,
        }
    }
}

/// Discriminant of [`SyncEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    /// See [`SyncEvent::SyncStarted`].
    SyncStarted,
    /// See [`SyncEvent::SyncCompleted`].
    SyncCompleted,
    /// See [`SyncEvent::SyncFailed`].
    SyncFailed,
    /// See [`SyncEvent::BatchProcessed`].
    BatchProcessed,
    /// See [`SyncEvent::StatusChanged`].
    StatusChanged,
    /// See [`SyncEvent::ServerOperationsReceived`].
    ServerOperationsReceived,
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned by [`EventRegistry::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listeners keyed by event kind.
///
/// Listeners run synchronously on the emitting task, in registration order.
/// A panicking listener is logged and skipped; the rest still run.
pub struct EventRegistry {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<SyncEventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a listener for one kind of event.
    pub fn on<F>(&self, kind: SyncEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Returns how many listeners are registered for a kind.
    pub fn listener_count(&self, kind: SyncEventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers an event to every listener of its kind.
    pub fn emit(&self, event: &SyncEvent) {
        let kind = event.kind();
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let listeners: Vec<Listener> = match self.listeners.read().get(&kind) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = ?kind, "sync event listener panicked");
            }
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventRegistry")
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
