//! Sync orchestrator state machine.
//!
//! The orchestrator drains the local queue through a [`StoragePort`] in
//! batches, hands each batch to a [`NetworkPort`] and reacts to the outcome:
//!
//! ```text
//!             start              pause
//!   Stopped ────────▶ Running ◀────────▶ Paused
//!      ▲               │  ▲     resume
//!      │          cycle│  │done
//!      │ stop          ▼  │
//!      └─────────── Syncing ──▶ Error (retries exhausted / auth failure)
//! ```
//!
//! Public methods never return transport or server errors; callers observe
//! them through [`SyncOrchestrator::status`], [`SyncOrchestrator::stats`] and
//! the event registry.

use crate::config::SyncConfig;
use crate::error::{message_indicates_auth, EngineResult, SyncError};
use crate::events::{EventRegistry, ListenerId, SyncEvent, SyncEventKind};
use crate::state::{SyncStats, SyncStatus};
use crate::storage::StoragePort;
use crate::transport::{DeliveryMode, NetworkPort};
use chrono::Utc;
use opsync_protocol::{Operation, OperationBatch, OperationId, SyncResult};
use opsync_storage::VersionStore;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Builds a [`SyncOrchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    project_id: String,
    device_id: String,
    config: SyncConfig,
    storage: Option<Arc<dyn StoragePort>>,
    network: Option<Arc<dyn NetworkPort>>,
    versions: Option<Arc<dyn VersionStore>>,
}

impl OrchestratorBuilder {
    /// Starts a builder for one project on one device.
    pub fn new(project_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            device_id: device_id.into(),
            config: SyncConfig::default(),
            storage: None,
            network: None,
            versions: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the storage port.
    pub fn storage(mut self, storage: Arc<dyn StoragePort>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the network port.
    pub fn network(mut self, network: Arc<dyn NetworkPort>) -> Self {
        self.network = Some(network);
        self
    }

    /// Sets the version store.
    pub fn versions(mut self, versions: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Validates the configuration, loads the stored version and wires the
    /// network port's remote listener.
    pub fn build(self) -> EngineResult<SyncOrchestrator> {
        self.config.validate()?;
        if self.project_id.is_empty() {
            return Err(SyncError::InvalidConfig("project id must not be empty".into()));
        }
        if self.device_id.is_empty() {
            return Err(SyncError::InvalidConfig("device id must not be empty".into()));
        }

        let storage = self.storage.ok_or(SyncError::MissingDependency("storage port"))?;
        let network = self.network.ok_or(SyncError::MissingDependency("network port"))?;
        let versions = self.versions.ok_or(SyncError::MissingDependency("version store"))?;

        let version = versions.load_version(&self.project_id)?.unwrap_or(0);
        debug!(project_id = %self.project_id, version, "loaded sync version");

        let inner = Arc::new(Inner {
            project_id: self.project_id,
            device_id: self.device_id,
            config: self.config,
            storage,
            network,
            versions,
            status: RwLock::new(SyncStatus::Stopped),
            stats: RwLock::new(SyncStats::default()),
            last_sync_version: AtomicU64::new(version),
            version_lock: Mutex::new(()),
            processing: AtomicBool::new(false),
            events: EventRegistry::new(),
            timers: Mutex::new(Timers::default()),
        });

        let weak = Arc::downgrade(&inner);
        let listener = move |operations: Vec<Operation>, version: Option<u64>| {
            if let Some(inner) = weak.upgrade() {
                inner.receive_remote(operations, version);
            }
        };
        inner.network.set_remote_listener(Arc::new(listener));

        Ok(SyncOrchestrator { inner })
    }
}

/// Drives sync for one project.
///
/// Cheap to clone; clones share state. Timers hold only weak references, so
/// dropping the last handle ends them.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    project_id: String,
    device_id: String,
    config: SyncConfig,
    storage: Arc<dyn StoragePort>,
    network: Arc<dyn NetworkPort>,
    versions: Arc<dyn VersionStore>,
    status: RwLock<SyncStatus>,
    stats: RwLock<SyncStats>,
    last_sync_version: AtomicU64,
    /// Serializes version compare-and-persist.
    version_lock: Mutex<()>,
    processing: AtomicBool,
    events: EventRegistry,
    timers: Mutex<Timers>,
}

#[derive(Default)]
struct Timers {
    interval: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        if let Some(handle) = self.interval.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

/// Holds the single-cycle guard; released on drop.
struct CycleGuard {
    inner: Arc<Inner>,
}

impl CycleGuard {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                inner: Arc::clone(inner),
            })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.inner.processing.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    /// Shorthand for [`OrchestratorBuilder::new`].
    pub fn builder(
        project_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(project_id, device_id)
    }

    /// Starts periodic sync.
    ///
    /// Idempotent: warns if already running, paused or syncing. From the
    /// error state it starts over with a reset retry counter. Must be called
    /// within a tokio runtime for the interval timer to run.
    pub fn start(&self) {
        let current = self.status();
        if !current.can_start() {
            warn!(project_id = %self.inner.project_id, status = %current, "sync already started");
            return;
        }
        if current == SyncStatus::Error {
            self.inner.reset_retries();
        }

        self.inner.set_status(SyncStatus::Running);
        self.inner.arm_interval();
        info!(project_id = %self.inner.project_id, "sync started");
    }

    /// Stops sync and disarms every timer.
    ///
    /// A cycle already exchanging with the server finishes its bookkeeping
    /// but makes no further status transitions.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    /// Disarms timers until [`resume`](Self::resume). Only valid while running.
    pub fn pause(&self) {
        let current = self.status();
        if current != SyncStatus::Running {
            warn!(project_id = %self.inner.project_id, status = %current, "pause ignored");
            return;
        }
        self.inner.timers.lock().abort_all();
        self.inner.set_status(SyncStatus::Paused);
        info!(project_id = %self.inner.project_id, "sync paused");
    }

    /// Re-arms timers after [`pause`](Self::pause). Only valid while paused.
    pub fn resume(&self) {
        let current = self.status();
        if current != SyncStatus::Paused {
            warn!(project_id = %self.inner.project_id, status = %current, "resume ignored");
            return;
        }
        self.inner.set_status(SyncStatus::Running);
        self.inner.arm_interval();
        info!(project_id = %self.inner.project_id, "sync resumed");
    }

    /// Runs one cycle now and waits for it.
    ///
    /// Returns false without doing anything if a cycle is already in flight
    /// or the orchestrator is stopped or paused.
    pub async fn force_sync(&self) -> bool {
        match self.inner.begin_manual_cycle() {
            Some(guard) => {
                self.inner.run_cycle(guard).await;
                true
            }
            None => false,
        }
    }

    /// Starts one cycle in the background.
    ///
    /// Returns false under the same conditions as
    /// [`force_sync`](Self::force_sync), or when called outside a tokio
    /// runtime.
    pub fn trigger_sync(&self) -> bool {
        let Some(guard) = self.inner.begin_manual_cycle() else {
            return false;
        };
        self.inner.spawn_cycle(guard)
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.read()
    }

    /// Returns a copy of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns the last server version the client has acknowledged.
    pub fn last_sync_version(&self) -> u64 {
        self.inner.version()
    }

    /// Returns the project this orchestrator syncs.
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Returns the device id sent with every batch.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns true while a cycle is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Subscribes to one kind of event.
    pub fn on<F>(&self, kind: SyncEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Unsubscribes. Returns false if the listener was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("project_id", &self.inner.project_id)
            .field("status", &self.status())
            .field("last_sync_version", &self.last_sync_version())
            .finish()
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            error!("no tokio runtime; sync task not started");
            None
        }
    }
}

impl Inner {
    fn status(&self) -> SyncStatus {
        *self.status.read()
    }

    fn version(&self) -> u64 {
        self.last_sync_version.load(Ordering::Acquire)
    }

    fn set_status(&self, new: SyncStatus) {
        let old = std::mem::replace(&mut *self.status.write(), new);
        if old != new {
            debug!(project_id = %self.project_id, %old, %new, "sync status changed");
            self.events.emit(&SyncEvent::StatusChanged { old, new });
        }
    }

    /// Moves `from` to `to` atomically; returns false if the status was
    /// something else.
    fn transition(&self, from: SyncStatus, to: SyncStatus) -> bool {
        {
            let mut status = self.status.write();
            if *status != from {
                return false;
            }
            *status = to;
        }
        debug!(project_id = %self.project_id, old = %from, new = %to, "sync status changed");
        self.events
            .emit(&SyncEvent::StatusChanged { old: from, new: to });
        true
    }

    fn shutdown(&self) {
        self.timers.lock().abort_all();
        if self.status() != SyncStatus::Stopped {
            self.set_status(SyncStatus::Stopped);
            info!(project_id = %self.project_id, "sync stopped");
        }
    }

    fn reset_retries(&self) {
        let mut stats = self.stats.write();
        stats.current_retry_count = 0;
        stats.next_retry_delay = None;
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.timers.lock().retry.take() {
            handle.abort();
        }
    }

    fn begin_manual_cycle(self: &Arc<Self>) -> Option<CycleGuard> {
        let Some(guard) = CycleGuard::acquire(self) else {
            debug!(project_id = %self.project_id, "sync already in progress");
            return None;
        };

        match self.status() {
            SyncStatus::Running => Some(guard),
            SyncStatus::Error => {
                self.reset_retries();
                self.set_status(SyncStatus::Running);
                Some(guard)
            }
            status => {
                warn!(project_id = %self.project_id, %status, "manual sync ignored");
                None
            }
        }
    }

    fn arm_interval(self: &Arc<Self>) {
        let period = match self.network.delivery_mode() {
            DeliveryMode::Polling => self.config.sync_interval(),
            DeliveryMode::Push => self.config.push_interval(),
        };
        let weak = Arc::downgrade(self);

        let handle = spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.status() != SyncStatus::Running {
                    continue;
                }
                if let Some(guard) = CycleGuard::acquire(&inner) {
                    inner.spawn_cycle(guard);
                }
            }
        });

        let mut timers = self.timers.lock();
        if let Some(old) = std::mem::replace(&mut timers.interval, handle) {
            old.abort();
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = spawn(async move {
            time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.status() != SyncStatus::Running {
                return;
            }
            if let Some(guard) = CycleGuard::acquire(&inner) {
                inner.spawn_cycle(guard);
            }
        });

        let mut timers = self.timers.lock();
        if let Some(old) = std::mem::replace(&mut timers.retry, handle) {
            old.abort();
        }
    }

    /// Runs a cycle on its own task.
    ///
    /// Timer tasks hand cycles off here, so disarming a timer never cancels
    /// a cycle part way through a batch.
    fn spawn_cycle(self: &Arc<Self>, guard: CycleGuard) -> bool {
        let inner = Arc::clone(self);
        spawn(async move { inner.run_cycle(guard).await }).is_some()
    }

    async fn run_cycle(self: &Arc<Self>, guard: CycleGuard) {
        let _guard = guard;

        if !self.network.is_online() {
            debug!(project_id = %self.project_id, "network offline; skipping sync");
            return;
        }

        match self.drain().await {
            Ok(()) => {}
            Err(e) if e.is_authentication_failure() => self.fail_authentication(&e),
            Err(e) if !e.is_retryable() => self.fail_permanently(e.to_string()),
            Err(e) => self.record_failure(e.to_string()),
        }

        self.transition(SyncStatus::Syncing, SyncStatus::Running);
    }

    async fn drain(self: &Arc<Self>) -> EngineResult<()> {
        let mut started = false;
        let mut reconciliations = 0u32;

        loop {
            let operations = self
                .storage
                .get_pending_operations(self.config.batch_size)
                .await?;

            if operations.is_empty() {
                if !started {
                    self.note_idle().await?;
                }
                return Ok(());
            }

            if !started {
                started = true;
                self.transition(SyncStatus::Running, SyncStatus::Syncing);
                self.events.emit(&SyncEvent::SyncStarted);
            }

            let batch = OperationBatch::new(
                self.project_id.as_str(),
                self.device_id.as_str(),
                self.version(),
                operations,
            );
            debug!(
                project_id = %self.project_id,
                batch_id = %batch.id,
                operations = batch.len(),
                version = batch.last_sync_version,
                "sending batch"
            );

            let result = self.network.send_operations(&batch).await?;

            if self.status() == SyncStatus::Stopped {
                if result.success {
                    self.apply_success(&batch, &result).await?;
                }
                debug!(project_id = %self.project_id, "stopped during exchange; ending cycle");
                return Ok(());
            }

            if result.success {
                if self.apply_success(&batch, &result).await? {
                    continue;
                }
                warn!(
                    project_id = %self.project_id,
                    batch_id = %batch.id,
                    "server acknowledged none of the batch; deferring to next cycle"
                );
                return Ok(());
            }

            if result.errors.iter().any(|e| message_indicates_auth(e)) {
                return Err(SyncError::AuthenticationFailed(result.error_message()));
            }

            let local = self.version();
            let server_ahead = result.sync_version.filter(|v| *v > local);
            if server_ahead.is_none() && !result.has_server_operations() {
                return Err(SyncError::ServerError(result.error_message()));
            }

            reconciliations += 1;
            if reconciliations > self.config.max_retries {
                return Err(SyncError::CatchUpFailed(format!(
                    "still behind after {} attempts: {}",
                    self.config.max_retries,
                    result.error_message()
                )));
            }

            if result.has_server_operations() {
                info!(
                    project_id = %self.project_id,
                    operations = result.server_operations.len(),
                    "server returned missing operations; applying before retry"
                );
                self.forward(result.server_operations, result.sync_version);
                if let Some(version) = result.sync_version {
                    self.adopt_version(version)?;
                }
            } else if let Some(server_version) = server_ahead {
                self.catch_up(server_version).await?;
            }
        }
    }

    /// Deletes acknowledged ids and records the success. Returns false if
    /// nothing from the batch was acknowledged.
    async fn apply_success(
        &self,
        batch: &OperationBatch,
        result: &SyncResult,
    ) -> EngineResult<bool> {
        let acknowledged: Vec<OperationId> = result
            .processed_operations
            .iter()
            .copied()
            .filter(|id| batch.contains(*id))
            .collect();

        if !acknowledged.is_empty() {
            self.storage.delete_operations(&acknowledged).await?;
        }
        if let Some(version) = result.sync_version {
            self.adopt_version(version)?;
        }
        let pending = self.storage.get_operations_count().await?;

        let stats = {
            let mut stats = self.stats.write();
            stats.total_processed += acknowledged.len() as u64;
            stats.successful_syncs += 1;
            stats.current_retry_count = 0;
            stats.next_retry_delay = None;
            stats.last_error = None;
            stats.last_error_time = None;
            stats.last_sync_time = Some(Utc::now());
            stats.pending_operations = pending;
            stats.clone()
        };
        self.cancel_retry();

        info!(
            project_id = %self.project_id,
            batch_id = %batch.id,
            processed = acknowledged.len(),
            pending,
            version = self.version(),
            "batch synced"
        );
        self.events.emit(&SyncEvent::BatchProcessed {
            batch: batch.clone(),
            result: result.clone(),
        });
        self.events.emit(&SyncEvent::SyncCompleted { stats });

        Ok(!acknowledged.is_empty())
    }

    async fn note_idle(&self) -> EngineResult<()> {
        let pending = self.storage.get_operations_count().await?;
        {
            let mut stats = self.stats.write();
            stats.pending_operations = pending;
            stats.last_sync_time = Some(Utc::now());
            stats.current_retry_count = 0;
            stats.next_retry_delay = None;
        }
        self.cancel_retry();
        Ok(())
    }

    async fn catch_up(&self, server_version: u64) -> EngineResult<()> {
        let local = self.version();
        info!(
            project_id = %self.project_id,
            local,
            server = server_version,
            "behind server; catching up"
        );

        let result = self.network.get_operations(&self.project_id, local).await?;
        if !result.success {
            return Err(SyncError::CatchUpFailed(result.error_message()));
        }
        if result.has_server_operations() {
            self.forward(result.server_operations, Some(server_version));
        }
        self.adopt_version(server_version)
    }

    fn forward(&self, operations: Vec<Operation>, version: Option<u64>) {
        self.events
            .emit(&SyncEvent::ServerOperationsReceived { operations, version });
    }

    fn receive_remote(&self, operations: Vec<Operation>, version: Option<u64>) {
        debug!(
            project_id = %self.project_id,
            operations = operations.len(),
            ?version,
            "remote operations received"
        );
        self.forward(operations, version);
        if let Some(version) = version {
            if let Err(e) = self.adopt_version(version) {
                error!(project_id = %self.project_id, error = %e, "failed to persist sync version");
            }
        }
    }

    fn adopt_version(&self, version: u64) -> EngineResult<()> {
        let _lock = self.version_lock.lock();
        let local = self.version();
        if version < local {
            warn!(
                project_id = %self.project_id,
                local,
                reported = version,
                "ignoring server version lower than local"
            );
            return Ok(());
        }
        if version == local {
            return Ok(());
        }

        self.versions.save_version(&self.project_id, version)?;
        self.last_sync_version.store(version, Ordering::Release);
        debug!(project_id = %self.project_id, version, "sync version advanced");
        Ok(())
    }

    fn record_failure(self: &Arc<Self>, message: String) {
        let stopped = self.status() == SyncStatus::Stopped;
        let mut stats = self.stats.write();
        stats.failed_syncs += 1;
        stats.last_error = Some(message.clone());
        stats.last_error_time = Some(Utc::now());

        if stopped {
            debug!(project_id = %self.project_id, error = %message, "sync failed after stop");
            return;
        }

        if stats.current_retry_count < self.config.max_retries {
            stats.current_retry_count += 1;
            let retry = stats.current_retry_count;
            let delay = self.config.retry_delay_for(retry);
            stats.next_retry_delay = Some(delay);
            drop(stats);

            warn!(
                project_id = %self.project_id,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "sync failed; retry scheduled"
            );
            self.schedule_retry(delay);
        } else {
            stats.next_retry_delay = None;
            let snapshot = stats.clone();
            drop(stats);

            error!(
                project_id = %self.project_id,
                retries = self.config.max_retries,
                error = %message,
                "sync failed; retries exhausted"
            );
            self.enter_error(message, snapshot);
        }
    }

    /// Records a failure that retrying cannot fix and enters the error state.
    fn fail_permanently(&self, message: String) {
        let snapshot = {
            let mut stats = self.stats.write();
            stats.failed_syncs += 1;
            stats.last_error = Some(message.clone());
            stats.last_error_time = Some(Utc::now());
            stats.next_retry_delay = None;
            stats.clone()
        };
        self.cancel_retry();

        if self.status() == SyncStatus::Stopped {
            debug!(project_id = %self.project_id, error = %message, "sync failed after stop");
            return;
        }
        error!(project_id = %self.project_id, error = %message, "sync failed; not retryable");
        self.enter_error(message, snapshot);
    }

    fn enter_error(&self, reason: String, stats: SyncStats) {
        self.set_status(SyncStatus::Error);
        self.events.emit(&SyncEvent::SyncFailed { reason, stats });
    }

    fn fail_authentication(&self, err: &SyncError) {
        let stats = {
            let mut stats = self.stats.write();
            stats.failed_syncs += 1;
            stats.last_error = Some(err.to_string());
            stats.last_error_time = Some(Utc::now());
            stats.next_retry_delay = None;
            stats.clone()
        };

        error!(project_id = %self.project_id, error = %err, "authentication rejected; stopping sync");
        if self.status() != SyncStatus::Stopped {
            self.set_status(SyncStatus::Error);
        }
        self.events.emit(&SyncEvent::SyncFailed {
            reason: format!("Authentication failed. Sign in again to resume syncing. ({err})"),
            stats,
        });
        self.shutdown();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers.get_mut().abort_all();
    }
}
