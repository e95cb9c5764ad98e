//! # opsync Engine
//!
//! Offline-first operation sync for opsync clients.
//!
//! This crate provides:
//! - Sync orchestrator state machine (stopped → running ⇄ paused, syncing, error)
//! - Batching of queued operations in FIFO order
//! - Retry with exponential backoff
//! - Version tracking and catch-up when the server is ahead
//! - Request/response (HTTP) and push-channel network ports
//! - Typed events for observers
//!
//! ## Architecture
//!
//! Domain code appends operations to an [`opsync_storage::OperationQueue`].
//! The [`SyncOrchestrator`] drains that queue through a [`StoragePort`] on a
//! timer or on demand, hands each batch to a [`NetworkPort`] and, depending
//! on the answer, deletes acknowledged operations, advances the stored
//! version, schedules a retry or catches up with the server.
//!
//! ## Key Invariants
//!
//! - Server is authoritative
//! - Operations leave the queue only after the server acknowledges them
//! - Queue order is preserved within a project
//! - At most one sync cycle runs at a time
//! - The stored version never decreases

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod config;
mod error;
mod events;
mod http;
mod orchestrator;
mod state;
mod storage;
mod transport;

pub use channel::{ChannelFrameSink, FrameSink, PushChannelNetwork, DEFAULT_OPERATION_TIMEOUT};
pub use config::SyncConfig;
pub use error::{message_indicates_auth, EngineResult, SyncError};
pub use events::{EventRegistry, Listener, ListenerId, SyncEvent, SyncEventKind};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{
    acknowledged_ids, HttpClient, HttpMethod, HttpNetwork, HttpRequest, HttpResponse,
    LoopbackClient, LoopbackServer, OPERATIONS_PATH,
};
pub use orchestrator::{OrchestratorBuilder, SyncOrchestrator};
pub use state::{SyncStats, SyncStatus};
pub use storage::{operation_from_record, QueueStoragePort, StoragePort};
pub use transport::{DeliveryMode, MockNetwork, NetworkPort, RemoteOperationsHandler};
