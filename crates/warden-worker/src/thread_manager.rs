//! Worker thread lifecycle and request/response plumbing.
//!
//! [`ThreadManager`] owns the worker's [`LifecycleState`] and the pending
//! message map. Each started worker gets a generation number; a pump task on
//! the supervisor runtime reads the worker's replies, resolves pending records
//! by request id, and detects the thread's exit.
//!
//! Every pending record has exactly one owner at a time: whoever removes it
//! from the map (the pump on response, the sender on timeout, or a mass
//! rejection on crash/stop/clear) is the one that delivers its outcome. A
//! response for a record that is already gone is dropped.
//!
//! ## State transitions
//!
//! ```text
//! Stopped ──start──▶ Starting ──ready──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!    ▲                  │                   │
//!    │     init failure │                   │ unexpected exit
//!    └──────────────────┘                   ▼
//!                        Starting ◀──── Crashed
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use warden_config::ThreadManagerConfig;
use warden_core::log_worker_event;
use warden_core::types::{Component, LifecycleState, Priority, Timestamp, now};
use warden_core::{Result, WardenError};

use crate::dispatcher::WorkerBackend;
use crate::events::{EventBus, EventKind};
use crate::protocol::{Envelope, HeartbeatReport, WorkerCommand, WorkerReply, WorkerResponse};
use crate::worker::{self, WorkerChannels, panic_message};

/// Creates a fresh backend for every worker start.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn WorkerBackend> + Send + Sync>;

/// Minimum wait for a killed worker thread to exit.
const MIN_KILL_WAIT: Duration = Duration::from_millis(100);

/// Snapshot of the worker's lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: LifecycleState,
    pub is_running: bool,
    pub generation: u64,
    pub thread_name: Option<String>,
    pub started_at: Option<Timestamp>,
    pub uptime_ms: Option<u64>,
    /// Successful restarts
    pub restart_count: u32,
    /// Failed starts plus crashes
    pub error_count: u64,
    /// Worker threads spawned so far
    pub spawn_count: u64,
    pub last_error: Option<String>,
    pub actions: Vec<String>,
    pub pending_messages: usize,
}

/// Request/response counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageStats {
    pub pending: usize,
    pub average_age_ms: u64,
    pub oldest_age_ms: u64,
    pub total_sent: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_timeouts: u64,
    pub total_retries: u64,
    pub late_responses: u64,
}

/// A pending record as exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct PendingMessageInfo {
    pub request_id: String,
    pub correlation_id: String,
    pub message_type: String,
    pub priority: Priority,
    pub attempt: u32,
    pub sent_at: Timestamp,
    pub age_ms: u64,
}

struct PendingMessage {
    correlation_id: String,
    message_type: String,
    priority: Priority,
    attempt: u32,
    sent_at: Timestamp,
    sent_instant: Instant,
    responder: oneshot::Sender<Result<WorkerResponse>>,
}

impl PendingMessage {
    fn info(&self, request_id: &str) -> PendingMessageInfo {
        PendingMessageInfo {
            request_id: request_id.to_string(),
            correlation_id: self.correlation_id.clone(),
            message_type: self.message_type.clone(),
            priority: self.priority,
            attempt: self.attempt,
            sent_at: self.sent_at,
            age_ms: self.sent_instant.elapsed().as_millis() as u64,
        }
    }
}

struct WorkerExit {
    acknowledged: bool,
    reason: String,
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    kill: Option<oneshot::Sender<()>>,
    exited: Option<oneshot::Receiver<WorkerExit>>,
}

#[derive(Default)]
struct WorkerState {
    lifecycle: LifecycleState,
    generation: u64,
    handle: Option<WorkerHandle>,
    thread_name: Option<String>,
    started_at: Option<Timestamp>,
    started_instant: Option<Instant>,
    actions: Vec<String>,
    restart_count: u32,
    error_count: u64,
    last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    late: AtomicU64,
    spawns: AtomicU64,
}

struct Inner {
    config: RwLock<ThreadManagerConfig>,
    factory: BackendFactory,
    bus: EventBus,
    /// Serializes start/stop/restart
    op_lock: Mutex<()>,
    state: Mutex<WorkerState>,
    pending: Mutex<HashMap<String, PendingMessage>>,
    probes: Mutex<HashMap<String, oneshot::Sender<HeartbeatReport>>>,
    counters: Counters,
}

/// Owner of the worker thread.
#[derive(Clone)]
pub struct ThreadManager {
    inner: Arc<Inner>,
}

impl ThreadManager {
    pub fn new<F>(config: ThreadManagerConfig, bus: EventBus, factory: F) -> Self
    where
        F: Fn() -> Box<dyn WorkerBackend> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                factory: Arc::new(factory),
                bus,
                op_lock: Mutex::new(()),
                state: Mutex::new(WorkerState::default()),
                pending: Mutex::new(HashMap::new()),
                probes: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the worker and wait for readiness. No-op while running.
    #[instrument(skip(self))]
    pub async fn start_worker(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        self.start_locked().await
    }

    /// Stop the worker. Always ends `Stopped`; pending messages are rejected.
    #[instrument(skip(self))]
    pub async fn stop_worker(&self, graceful: bool, reason: &str) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        self.stop_locked(graceful, reason).await
    }

    /// Graceful stop followed by start.
    #[instrument(skip(self))]
    pub async fn restart_worker(&self, reason: &str) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        info!(reason, "Restarting worker");
        self.stop_locked(true, &format!("restart: {reason}")).await?;
        self.start_locked().await?;

        let mut state = self.inner.state.lock().await;
        state.restart_count += 1;
        info!(restart_count = state.restart_count, "Worker restarted");
        Ok(())
    }

    /// Terminate the running worker without a stop request.
    ///
    /// The exit is handled as a crash. Returns once the crash has been
    /// processed or the shutdown grace period elapsed.
    pub async fn kill_worker(&self) -> Result<()> {
        let (kill, exited) = {
            let mut state = self.inner.state.lock().await;
            if !state.lifecycle.is_running() {
                return Err(WardenError::WorkerNotRunning {
                    state: state.lifecycle,
                });
            }
            match state.handle.as_mut() {
                Some(handle) => (handle.kill.take(), handle.exited.take()),
                None => (None, None),
            }
        };

        warn!("Killing worker thread");
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if let Some(exited) = exited {
            let wait = self.inner.config.read().await.shutdown_grace().max(MIN_KILL_WAIT);
            if tokio::time::timeout(wait, exited).await.is_err() {
                warn!("Killed worker did not exit in time");
            }
        }
        Ok(())
    }

    async fn start_locked(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock().await;
            match state.lifecycle {
                LifecycleState::Running => {
                    debug!(generation = state.generation, "Worker already running");
                    return Ok(());
                }
                LifecycleState::Starting | LifecycleState::Stopping => {
                    return Err(WardenError::internal(format!(
                        "worker is {} outside a lifecycle operation",
                        state.lifecycle
                    )));
                }
                LifecycleState::Stopped | LifecycleState::Crashed => {}
            }
            state.lifecycle = LifecycleState::Starting;
            state.generation += 1;
            state.generation
        };

        let config = self.inner.config.read().await.clone();
        let thread_name = format!("warden-worker-{generation}");
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let backend = (self.inner.factory)();
        let channels = WorkerChannels {
            commands: cmd_rx,
            replies: reply_tx,
            kill: kill_rx,
        };
        self.inner.counters.spawns.fetch_add(1, Ordering::Relaxed);
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker::run(backend, channels));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let err = WardenError::worker_spawn(e.to_string());
                self.abort_start(generation, &err, &config).await;
                return Err(err);
            }
        };

        tokio::spawn(pump(
            self.inner.clone(),
            generation,
            reply_rx,
            thread,
            ready_tx,
            exit_tx,
        ));
        self.inner.state.lock().await.handle = Some(WorkerHandle {
            commands: cmd_tx,
            kill: Some(kill_tx),
            exited: Some(exit_rx),
        });

        let err = match tokio::time::timeout(config.startup_timeout(), ready_rx).await {
            Ok(Ok(Ok(actions))) => {
                {
                    let mut state = self.inner.state.lock().await;
                    state.lifecycle = LifecycleState::Running;
                    state.thread_name = Some(thread_name.clone());
                    state.started_at = Some(now());
                    state.started_instant = Some(Instant::now());
                    state.actions = actions.clone();
                }
                log_worker_event!(generation, "started", thread = %thread_name, actions = actions.len());
                self.inner.bus.publish(
                    Component::ThreadManager,
                    EventKind::WorkerStarted {
                        generation,
                        thread_name,
                        actions,
                    },
                );
                return Ok(());
            }
            Ok(Ok(Err(message))) => WardenError::WorkerInit { message },
            Ok(Err(_)) => WardenError::worker_spawn("worker exited before reporting readiness"),
            Err(_) => WardenError::WorkerStartupTimeout {
                timeout_ms: config.startup_timeout_ms,
            },
        };

        self.abort_start(generation, &err, &config).await;
        Err(err)
    }

    /// Tear down a worker that never became ready.
    async fn abort_start(&self, generation: u64, err: &WardenError, config: &ThreadManagerConfig) {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state.lifecycle = LifecycleState::Stopped;
            state.error_count += 1;
            state.last_error = Some(err.to_string());
            state.handle.take()
        };

        if let Some(mut handle) = handle {
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
            if let Some(exited) = handle.exited.take() {
                let wait = config.shutdown_grace().max(MIN_KILL_WAIT);
                if tokio::time::timeout(wait, exited).await.is_err() {
                    warn!(generation, "Worker thread did not exit after failed start, detaching");
                }
            }
        }

        error!(generation, error = %err, "Worker failed to start");
        self.inner.bus.publish(
            Component::ThreadManager,
            EventKind::WorkerError {
                generation,
                message: err.to_string(),
                crashed: false,
            },
        );
    }

    async fn stop_locked(&self, graceful: bool, reason: &str) -> Result<()> {
        let (generation, handle) = {
            let mut state = self.inner.state.lock().await;
            let lifecycle = state.lifecycle;
            match lifecycle {
                LifecycleState::Stopped => {
                    debug!("Worker already stopped");
                    return Ok(());
                }
                LifecycleState::Crashed => {
                    state.lifecycle = LifecycleState::Stopped;
                    state.handle = None;
                    let generation = state.generation;
                    drop(state);
                    self.inner.bus.publish(
                        Component::ThreadManager,
                        EventKind::WorkerStopped {
                            generation,
                            reason: reason.to_string(),
                        },
                    );
                    return Ok(());
                }
                _ => {}
            }
            state.lifecycle = LifecycleState::Stopping;
            (state.generation, state.handle.take())
        };

        let rejected = self
            .inner
            .reject_pending(|| WardenError::WorkerStopped {
                reason: reason.to_string(),
            })
            .await;
        self.inner.probes.lock().await.clear();

        if let Some(handle) = handle {
            let grace = self.inner.config.read().await.shutdown_grace();
            self.shut_down(generation, handle, graceful, grace).await;
        }

        {
            let mut state = self.inner.state.lock().await;
            state.lifecycle = LifecycleState::Stopped;
            state.thread_name = None;
            state.started_at = None;
            state.started_instant = None;
            state.actions.clear();
        }

        log_worker_event!(generation, "stopped", reason = %reason, rejected);
        self.inner.bus.publish(
            Component::ThreadManager,
            EventKind::WorkerStopped {
                generation,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Ask the worker to shut down, forcing termination after `grace`.
    async fn shut_down(&self, generation: u64, mut handle: WorkerHandle, graceful: bool, grace: Duration) {
        let mut exited = handle.exited.take();
        let mut done = false;

        if graceful && handle.commands.send(WorkerCommand::Shutdown).is_ok() {
            if let Some(rx) = exited.as_mut() {
                match tokio::time::timeout(grace, rx).await {
                    Ok(Ok(exit)) => {
                        debug!(generation, acknowledged = exit.acknowledged, reason = %exit.reason, "Worker exited");
                        done = true;
                    }
                    Ok(Err(_)) => done = true,
                    Err(_) => {
                        warn!(generation, grace_ms = grace.as_millis() as u64, "Worker ignored shutdown, forcing");
                    }
                }
            }
        }

        if !done {
            if let Some(kill) = handle.kill.take() {
                let _ = kill.send(());
            }
            if let Some(rx) = exited.as_mut() {
                if tokio::time::timeout(grace.max(MIN_KILL_WAIT), rx).await.is_err() {
                    warn!(generation, "Worker thread did not exit, detaching");
                }
            }
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Deliver `envelope` to the worker and wait for its response.
    ///
    /// Resent on timeout up to `max_retries` times with a fresh request id;
    /// other failures are returned immediately.
    pub async fn send_message(&self, mut envelope: Envelope) -> Result<WorkerResponse> {
        let correlation_id = envelope.ensure_correlation_id();
        let timeout = match envelope.timeout() {
            Some(timeout) => Some(timeout),
            None => self.inner.config.read().await.default_message_timeout(),
        };
        let attempts = envelope.max_retries.saturating_add(1);

        let mut attempt = 1;
        loop {
            match self.send_once(&envelope, attempt, timeout).await {
                Err(WardenError::Timeout { .. }) if attempt < attempts => {
                    self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        correlation_id = %correlation_id,
                        attempt,
                        max_attempts = attempts,
                        "Message timed out, resending"
                    );
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn send_once(
        &self,
        envelope: &Envelope,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> Result<WorkerResponse> {
        let max_pending = self.inner.config.read().await.max_pending_messages;
        let request_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();

        // The record is registered and the request queued under the state
        // lock, so a stop or crash either sees the record or is seen here.
        {
            let state = self.inner.state.lock().await;
            let commands = match (&state.handle, state.lifecycle) {
                (Some(handle), LifecycleState::Running) => &handle.commands,
                (_, lifecycle) => return Err(WardenError::WorkerNotRunning { state: lifecycle }),
            };

            let mut pending = self.inner.pending.lock().await;
            if pending.len() >= max_pending {
                return Err(WardenError::QueueFull { capacity: max_pending });
            }
            let command = WorkerCommand::Request {
                request_id: request_id.clone(),
                envelope: envelope.clone(),
            };
            if commands.send(command).is_err() {
                return Err(WardenError::ChannelClosed {
                    message: "worker command channel closed".into(),
                });
            }
            pending.insert(
                request_id.clone(),
                PendingMessage {
                    correlation_id: envelope.correlation_id.clone().unwrap_or_default(),
                    message_type: envelope.message_type.clone(),
                    priority: envelope.priority,
                    attempt,
                    sent_at: now(),
                    sent_instant: Instant::now(),
                    responder: tx,
                },
            );
        }
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);

        let delivered = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    if self.inner.pending.lock().await.remove(&request_id).is_some() {
                        self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        debug!(request_id = %request_id, attempt, "Pending message timed out");
                        return Err(WardenError::timeout(request_id, limit.as_millis() as u64));
                    }
                    // Another owner removed the record and is delivering the outcome.
                    rx.await
                }
            },
            None => rx.await,
        };

        delivered.unwrap_or_else(|_| Err(WardenError::internal("pending responder dropped")))
    }

    /// Heartbeat round trip bounded by `timeout`.
    pub async fn probe(&self, timeout: Duration) -> Result<HeartbeatReport> {
        let commands = {
            let state = self.inner.state.lock().await;
            match (&state.handle, state.lifecycle) {
                (Some(handle), LifecycleState::Running) => handle.commands.clone(),
                (_, lifecycle) => return Err(WardenError::WorkerNotRunning { state: lifecycle }),
            }
        };

        let probe_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.probes.lock().await.insert(probe_id.clone(), tx);

        if commands
            .send(WorkerCommand::Heartbeat {
                probe_id: probe_id.clone(),
            })
            .is_err()
        {
            self.inner.probes.lock().await.remove(&probe_id);
            return Err(WardenError::ChannelClosed {
                message: "worker command channel closed".into(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(WardenError::worker_crashed("worker exited during heartbeat")),
            Err(_) => {
                self.inner.probes.lock().await.remove(&probe_id);
                Err(WardenError::timeout(probe_id, timeout.as_millis() as u64))
            }
        }
    }

    // =========================================================================
    // Pending messages
    // =========================================================================

    /// Pending records, oldest first.
    pub async fn pending_messages(&self) -> Vec<PendingMessageInfo> {
        let pending = self.inner.pending.lock().await;
        let mut infos: Vec<PendingMessageInfo> = pending.iter().map(|(id, p)| p.info(id)).collect();
        infos.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        infos
    }

    /// Reject every pending record with `Cancelled`; returns how many.
    pub async fn clear_pending_messages(&self, reason: &str) -> usize {
        let cleared = self
            .inner
            .reject_pending(|| WardenError::cancelled(reason.to_string()))
            .await;
        if cleared > 0 {
            info!(cleared, reason, "Cleared pending messages");
        }
        cleared
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_status(&self) -> WorkerStatus {
        let pending_messages = self.inner.pending.lock().await.len();
        let state = self.inner.state.lock().await;
        WorkerStatus {
            state: state.lifecycle,
            is_running: state.lifecycle.is_running(),
            generation: state.generation,
            thread_name: state.thread_name.clone(),
            started_at: state.started_at,
            uptime_ms: state.started_instant.map(|t| t.elapsed().as_millis() as u64),
            restart_count: state.restart_count,
            error_count: state.error_count,
            spawn_count: self.inner.counters.spawns.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
            actions: state.actions.clone(),
            pending_messages,
        }
    }

    pub async fn get_message_stats(&self) -> MessageStats {
        let (pending, average_age_ms, oldest_age_ms) = {
            let pending = self.inner.pending.lock().await;
            let ages: Vec<u64> = pending
                .values()
                .map(|p| p.sent_instant.elapsed().as_millis() as u64)
                .collect();
            let total: u64 = ages.iter().sum();
            let average = if ages.is_empty() { 0 } else { total / ages.len() as u64 };
            (ages.len(), average, ages.iter().copied().max().unwrap_or(0))
        };

        let c = &self.inner.counters;
        MessageStats {
            pending,
            average_age_ms,
            oldest_age_ms,
            total_sent: c.sent.load(Ordering::Relaxed),
            total_succeeded: c.succeeded.load(Ordering::Relaxed),
            total_failed: c.failed.load(Ordering::Relaxed),
            total_timeouts: c.timeouts.load(Ordering::Relaxed),
            total_retries: c.retries.load(Ordering::Relaxed),
            late_responses: c.late.load(Ordering::Relaxed),
        }
    }

    /// Name of the current worker thread.
    pub async fn worker_thread_id(&self) -> Option<String> {
        self.inner.state.lock().await.thread_name.clone()
    }

    pub async fn is_worker_running(&self) -> bool {
        self.inner.state.lock().await.lifecycle.is_running()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.state.lock().await.lifecycle
    }

    /// Generation of the most recently started worker.
    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    pub async fn config(&self) -> ThreadManagerConfig {
        self.inner.config.read().await.clone()
    }

    /// Applies to subsequent sends and lifecycle operations.
    pub async fn update_config(&self, config: ThreadManagerConfig) {
        *self.inner.config.write().await = config;
        debug!("Thread manager config updated");
    }
}

impl Inner {
    async fn resolve(&self, response: WorkerResponse) {
        let record = self.pending.lock().await.remove(&response.request_id);
        match record {
            Some(record) => {
                if response.success {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                let _ = record.responder.send(Ok(response));
            }
            None => {
                self.counters.late.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %response.request_id, "Dropping late response");
            }
        }
    }

    async fn reject_pending<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> WardenError,
    {
        let drained: Vec<PendingMessage> = self.pending.lock().await.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for record in drained {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = record.responder.send(Err(make_error()));
        }
        count
    }

    /// Called by the pump once the worker thread has exited.
    async fn handle_exit(&self, generation: u64, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.lifecycle != LifecycleState::Running {
                return;
            }
            state.lifecycle = LifecycleState::Crashed;
            state.handle = None;
            state.started_instant = None;
            state.error_count += 1;
            state.last_error = Some(reason.to_string());
        }

        let rejected = self
            .reject_pending(|| WardenError::worker_crashed(reason.to_string()))
            .await;
        self.probes.lock().await.clear();

        error!(generation, rejected, reason, "Worker crashed");
        log_worker_event!(generation, "crashed", reason, rejected);
        self.bus.publish(
            Component::ThreadManager,
            EventKind::WorkerError {
                generation,
                message: reason.to_string(),
                crashed: true,
            },
        );
    }
}

/// Reads worker replies until the worker thread exits.
async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    thread: std::thread::JoinHandle<()>,
    ready: oneshot::Sender<std::result::Result<Vec<String>, String>>,
    exited: oneshot::Sender<WorkerExit>,
) {
    let mut ready = Some(ready);
    let mut acknowledged = false;

    while let Some(reply) = replies.recv().await {
        match reply {
            WorkerReply::Ready { actions } => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(actions));
                }
            }
            WorkerReply::InitFailed { message } => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(message));
                }
            }
            WorkerReply::Response(response) => inner.resolve(response).await,
            WorkerReply::Heartbeat(report) => {
                if let Some(tx) = inner.probes.lock().await.remove(&report.probe_id) {
                    let _ = tx.send(report);
                }
            }
            WorkerReply::ShutdownAck => {
                debug!(generation, "Worker acknowledged shutdown");
                acknowledged = true;
            }
        }
    }
    drop(ready);

    let reason = match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) if acknowledged => "worker shut down".to_string(),
        Ok(Ok(())) => "worker thread exited unexpectedly".to_string(),
        Ok(Err(payload)) => format!("worker thread panicked: {}", panic_message(&*payload)),
        Err(e) => format!("failed to join worker thread: {e}"),
    };

    inner.handle_exit(generation, &reason).await;
    let _ = exited.send(WorkerExit { acknowledged, reason });
}
