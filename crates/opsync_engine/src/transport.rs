//! Network port abstraction.

use crate::error::EngineResult;
use async_trait::async_trait;
use opsync_protocol::{Operation, OperationBatch, SyncResult};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// How operations from other collaborators reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The client asks for them (request/response).
    Polling,
    /// The server sends them down a persistent channel.
    Push,
}

/// Callback receiving operations the server pushed unprompted.
pub type RemoteOperationsHandler = Arc<dyn Fn(Vec<Operation>, Option<u64>) + Send + Sync>;

/// A network port exchanges batches and catch-up requests with the server.
///
/// Ordinary failures (server rejection, transport error, bad response) are
/// reported as a failed [`SyncResult`]. An `Err` is reserved for failures
/// the orchestrator must treat specially, chiefly
/// [`SyncError::AuthenticationFailed`](crate::SyncError::AuthenticationFailed).
#[async_trait]
pub trait NetworkPort: Send + Sync {
    /// Sends a batch and returns the server's answer.
    async fn send_operations(&self, batch: &OperationBatch) -> EngineResult<SyncResult>;

    /// Fetches operations the client is missing since `since_version`.
    async fn get_operations(&self, project_id: &str, since_version: u64)
        -> EngineResult<SyncResult>;

    /// Returns true if the port believes the server is reachable.
    fn is_online(&self) -> bool;

    /// Returns how remote operations are delivered.
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Polling
    }

    /// Installs the callback for operations pushed by the server.
    ///
    /// Polling ports never push, so the default ignores the handler.
    fn set_remote_listener(&self, _handler: RemoteOperationsHandler) {}
}

/// A scripted network port for testing.
///
/// Queued responses are returned in order. With nothing queued, every
/// persisted operation of a batch is acknowledged and the version advances
/// by the batch length.
pub struct MockNetwork {
    online: AtomicBool,
    mode: DeliveryMode,
    send_responses: Mutex<VecDeque<EngineResult<SyncResult>>>,
    fetch_responses: Mutex<VecDeque<EngineResult<SyncResult>>>,
    sent: Mutex<Vec<OperationBatch>>,
    fetches: Mutex<Vec<(String, u64)>>,
    gate: Mutex<Option<Arc<Notify>>>,
    remote: RwLock<Option<RemoteOperationsHandler>>,
}

impl MockNetwork {
    /// Creates an online polling mock.
    pub fn new() -> Self {
        Self::with_mode(DeliveryMode::Polling)
    }

    /// Creates an online mock reporting the given delivery mode.
    pub fn with_mode(mode: DeliveryMode) -> Self {
        Self {
            online: AtomicBool::new(true),
            mode,
            send_responses: Mutex::new(VecDeque::new()),
            fetch_responses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            remote: RwLock::new(None),
        }
    }

    /// Sets the online state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Queues the answer to the next `send_operations` call.
    pub fn push_send_response(&self, response: EngineResult<SyncResult>) {
        self.send_responses.lock().push_back(response);
    }

    /// Queues the answer to the next `get_operations` call.
    pub fn push_fetch_response(&self, response: EngineResult<SyncResult>) {
        self.fetch_responses.lock().push_back(response);
    }

    /// Returns every batch sent so far.
    pub fn sent_batches(&self) -> Vec<OperationBatch> {
        self.sent.lock().clone()
    }

    /// Returns every `(project, since)` catch-up request so far.
    pub fn fetch_requests(&self) -> Vec<(String, u64)> {
        self.fetches.lock().clone()
    }

    /// Makes subsequent sends wait until the returned handle is notified.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Releases the held send and lets later sends through immediately.
    pub fn release_sends(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_one();
        }
    }

    /// Simulates the server pushing operations.
    ///
    /// Returns false if no listener is installed.
    pub fn deliver_remote(&self, operations: Vec<Operation>, version: Option<u64>) -> bool {
        let handler = self.remote.read().clone();
        match handler {
            Some(handler) => {
                handler(operations, version);
                true
            }
            None => false,
        }
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkPort for MockNetwork {
    async fn send_operations(&self, batch: &OperationBatch) -> EngineResult<SyncResult> {
        self.sent.lock().push(batch.clone());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripted = self.send_responses.lock().pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(SyncResult::success(
                batch.operation_ids(),
                Some(batch.last_sync_version + batch.len() as u64),
            )),
        }
    }

    async fn get_operations(
        &self,
        project_id: &str,
        since_version: u64,
    ) -> EngineResult<SyncResult> {
        self.fetches
            .lock()
            .push((project_id.to_string(), since_version));

        let scripted = self.fetch_responses.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(SyncResult::success(Vec::new(), None)))
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }

    fn set_remote_listener(&self, handler: RemoteOperationsHandler) {
        *self.remote.write() = Some(handler);
    }
}
