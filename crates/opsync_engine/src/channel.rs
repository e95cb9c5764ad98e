//! Push-channel network port.
//!
//! Operations travel over a persistent bidirectional text channel (in
//! practice a WebSocket). Each outgoing operation is wrapped in an
//! `OPERATION_BROADCAST` envelope and answered asynchronously by a
//! correlation frame carrying the same operation id. The connection itself
//! is owned by the application: it hands outgoing frames to a [`FrameSink`]
//! and feeds incoming frames to [`PushChannelNetwork::handle_frame`].

use crate::config::SyncConfig;
use crate::error::{EngineResult, SyncError};
use crate::transport::{DeliveryMode, NetworkPort, RemoteOperationsHandler};
use async_trait::async_trait;
use futures::future::try_join_all;
use opsync_protocol::{
    BroadcastEnvelope, Operation, OperationAck, OperationBatch, ServerFrame, SyncResult,
    WireOperation,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound half of a push channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Sends one text frame.
    async fn send_frame(&self, frame: String) -> Result<(), String>;

    /// Returns true while the channel can carry frames.
    fn is_open(&self) -> bool;
}

/// Frame sink writing into a tokio channel.
///
/// The receiving end is usually drained by the task that owns the socket.
#[derive(Debug, Clone)]
pub struct ChannelFrameSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelFrameSink {
    /// Creates a sink and the receiver its frames arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Wraps an existing sender.
    pub fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelFrameSink {
    async fn send_frame(&self, frame: String) -> Result<(), String> {
        self.tx
            .send(frame)
            .map_err(|_| "push channel closed".to_string())
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct PendingAck {
    token: u64,
    sender: oneshot::Sender<EngineResult<OperationAck>>,
}

type PendingTable = Mutex<HashMap<String, PendingAck>>;

/// Removes a pending entry when its sender gives up (timeout, cancellation
/// or a failed send). The token keeps a later registration of the same id
/// from being removed.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if table.get(&self.id).is_some_and(|entry| entry.token == self.token) {
            table.remove(&self.id);
        }
    }
}

/// Network port over a push channel.
pub struct PushChannelNetwork {
    sink: Arc<dyn FrameSink>,
    user_id: String,
    device_id: String,
    operation_timeout: Duration,
    pending: PendingTable,
    next_token: AtomicU64,
    connected: AtomicBool,
    remote: RwLock<Option<RemoteOperationsHandler>>,
    catch_up: Option<Arc<dyn NetworkPort>>,
}

impl PushChannelNetwork {
    /// Creates a connected port.
    ///
    /// `device_id` identifies this client; broadcasts carrying it are
    /// treated as echoes of our own operations.
    pub fn new(
        sink: Arc<dyn FrameSink>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            user_id: user_id.into(),
            device_id: device_id.into(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            remote: RwLock::new(None),
            catch_up: None,
        }
    }

    /// Sets the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Applies the push-channel settings of `config`.
    pub fn with_config(self, config: &SyncConfig) -> Self {
        self.with_operation_timeout(config.operation_timeout())
    }

    /// Returns the per-operation timeout.
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Sets the port used for catch-up fetches.
    pub fn with_catch_up(mut self, port: Arc<dyn NetworkPort>) -> Self {
        self.catch_up = Some(port);
        self
    }

    /// Returns how many operations await a correlation reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Marks the channel connected again after a reconnect.
    pub fn handle_connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!(user_id = %self.user_id, "push channel connected");
    }

    /// Fails every pending operation and marks the port offline.
    pub fn handle_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(pending = drained.len(), "push channel closed with operations in flight");
        }
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(SyncError::ChannelClosed));
        }
    }

    /// Processes one incoming text frame.
    pub fn handle_frame(&self, text: &str) {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable push frame");
                return;
            }
        };

        match frame {
            ServerFrame::Ack(ack) => {
                let id = ack.operation_id.clone();
                self.resolve(&id, Ok(ack));
            }
            ServerFrame::Rejection(rejection) => {
                let id = rejection.operation_id.clone();
                self.resolve(
                    &id,
                    Err(SyncError::Rejected {
                        operation_id: rejection.operation_id,
                        message: rejection.error,
                    }),
                );
            }
            ServerFrame::Broadcast(envelope) => self.handle_broadcast(envelope),
        }
    }

    /// Feeds frames from `incoming` until it closes, then disconnects.
    pub fn spawn_reader(
        self: &Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let port = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                port.handle_frame(&frame);
            }
            port.handle_disconnect();
        })
    }

    fn resolve(&self, id: &str, result: EngineResult<OperationAck>) {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.sender.send(result);
            }
            None => warn!(operation_id = id, "no pending operation for push reply; ignoring"),
        }
    }

    fn handle_broadcast(&self, envelope: BroadcastEnvelope) {
        let operation = &envelope.payload.operation;
        let is_echo = operation.device_id == self.device_id
            || envelope
                .operation_id()
                .is_some_and(|id| self.pending.lock().contains_key(&id));
        if is_echo {
            debug!(operation_id = ?envelope.operation_id(), "ignoring echo of local operation");
            return;
        }

        let version = envelope.payload.sync_version;
        let project_id = envelope.project_id;
        let operation = envelope.payload.operation.into_operation(&project_id);

        let handler = self.remote.read().clone();
        match handler {
            Some(handler) => handler(vec![operation], version),
            None => debug!(project_id = %project_id, "no remote listener; dropping broadcast"),
        }
    }

    async fn send_one(&self, project_id: &str, operation: &Operation) -> EngineResult<OperationAck> {
        let wire = WireOperation::from_operation(operation).with_project(project_id);
        let envelope = BroadcastEnvelope::new(wire, self.user_id.as_str(), project_id);
        let id = envelope
            .operation_id()
            .ok_or_else(|| SyncError::Protocol("operation without correlation id".into()))?;

        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(SyncError::DuplicateOperation(id));
            }
            pending.insert(id.clone(), PendingAck { token, sender: tx });
        }
        let _guard = PendingGuard {
            table: &self.pending,
            id: id.clone(),
            token,
        };

        let frame = envelope.encode()?;
        self.sink
            .send_frame(frame)
            .await
            .map_err(SyncError::transport_retryable)?;

        match tokio::time::timeout(self.operation_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ChannelClosed),
            Err(_) => Err(SyncError::Timeout(id)),
        }
    }
}

#[async_trait]
impl NetworkPort for PushChannelNetwork {
    async fn send_operations(&self, batch: &OperationBatch) -> EngineResult<SyncResult> {
        if !self.is_online() {
            return Ok(SyncResult::failure("push channel is not connected"));
        }

        let sends = batch
            .operations
            .iter()
            .map(|op| self.send_one(&batch.project_id, op));

        let acks = match try_join_all(sends).await {
            Ok(acks) => acks,
            Err(e) if e.is_authentication_failure() => return Err(e),
            Err(e) => {
                warn!(batch_id = %batch.id, error = %e, "push batch failed");
                return Ok(SyncResult::failure(e.to_string()));
            }
        };

        if let Some(ack) = acks.iter().find(|ack| !ack.success) {
            return Ok(SyncResult::failure(format!(
                "operation {} was not applied",
                ack.operation_id
            )));
        }

        let sync_version = acks.iter().filter_map(|ack| ack.sync_version).max();
        let conflicts = acks.into_iter().flat_map(|ack| ack.conflicts).collect();

        Ok(SyncResult::success(batch.operation_ids(), sync_version).with_conflicts(conflicts))
    }

    async fn get_operations(
        &self,
        project_id: &str,
        since_version: u64,
    ) -> EngineResult<SyncResult> {
        match &self.catch_up {
            Some(port) => port.get_operations(project_id, since_version).await,
            None => Ok(SyncResult::success(Vec::new(), None)),
        }
    }

    fn is_online(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.sink.is_open()
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Push
    }

    fn set_remote_listener(&self, handler: RemoteOperationsHandler) {
        *self.remote.write() = Some(handler);
    }
}
