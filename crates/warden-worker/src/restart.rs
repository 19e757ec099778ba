//! Restart policy and circuit breaker.
//!
//! [`RestartManager`] decides whether a worker restart may proceed and then
//! cycles the worker through [`ThreadManager::restart_worker`]. While
//! management is started it listens on the event bus for crashes and
//! unhealthy reports and restarts the worker automatically.
//!
//! ## Breaker
//!
//! ```text
//!            max consecutive failures
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ cooldown elapsed
//!     │ trial succeeds                   ▼
//!     └────────────────────────────── HalfOpen ──trial fails──▶ Open (cooldown grown)
//! ```
//!
//! Failures are counted within `restart_window_ms`; the attempt count resets
//! after `healthy_reset_ms` without a restart. Consecutive attempts are spaced
//! by a jittered exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use warden_config::RestartManagerConfig;
use warden_core::types::{Component, Timestamp, now};
use warden_core::{Result, WardenError};

use crate::events::{EventBus, EventKind, ServiceEvent};
use crate::thread_manager::ThreadManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot returned by [`RestartManager::get_restart_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RestartStats {
    /// Whether a restart triggered now would be attempted
    pub can_restart: bool,
    pub is_managing: bool,
    pub auto_restart: bool,
    pub current_restart_count: u32,
    pub circuit_breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub current_cooldown_ms: u64,
    pub cooldown_remaining_ms: Option<u64>,
    pub restart_in_progress: bool,
    pub last_restart_at: Option<Timestamp>,
    pub last_reason: Option<String>,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_refused: u64,
}

enum Admission {
    Proceed { attempt: u32, delay: Duration, trial: bool },
    Refuse { detail: &'static str, retry_after_ms: Option<u64> },
}

#[derive(Debug, Clone)]
struct RestartState {
    breaker: BreakerState,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    consecutive_failures: u32,
    failure_window_start: Option<Instant>,
    attempts: u32,
    last_restart: Option<Instant>,
    last_restart_at: Option<Timestamp>,
    last_reason: Option<String>,
    in_progress: bool,
    total_attempts: u64,
    total_successes: u64,
    total_failures: u64,
    total_refused: u64,
}

impl RestartState {
    fn new(config: &RestartManagerConfig) -> Self {
        Self {
            breaker: BreakerState::Closed,
            opened_at: None,
            current_cooldown: config.cooldown(),
            consecutive_failures: 0,
            failure_window_start: None,
            attempts: 0,
            last_restart: None,
            last_restart_at: None,
            last_reason: None,
            in_progress: false,
            total_attempts: 0,
            total_successes: 0,
            total_failures: 0,
            total_refused: 0,
        }
    }

    /// Apply the time-based resets.
    fn refresh(&mut self, config: &RestartManagerConfig, at: Instant) {
        if self.breaker == BreakerState::Closed
            && let Some(start) = self.failure_window_start
            && at.duration_since(start) > config.restart_window()
        {
            self.consecutive_failures = 0;
            self.failure_window_start = None;
        }
        if let Some(last) = self.last_restart
            && at.duration_since(last) >= config.healthy_reset()
        {
            self.attempts = 0;
        }
    }

    fn cooldown_remaining(&self, at: Instant) -> Option<Duration> {
        match (self.breaker, self.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                Some(self.current_cooldown.saturating_sub(at.duration_since(opened)))
            }
            _ => None,
        }
    }

    fn admit(&mut self, config: &RestartManagerConfig, at: Instant) -> Admission {
        self.refresh(config, at);

        if self.in_progress {
            self.total_refused += 1;
            return Admission::Refuse {
                detail: "restart already in progress",
                retry_after_ms: None,
            };
        }

        let trial = match self.breaker {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => true,
            BreakerState::Open => match self.cooldown_remaining(at) {
                Some(remaining) if !remaining.is_zero() => {
                    self.total_refused += 1;
                    return Admission::Refuse {
                        detail: "circuit breaker open",
                        retry_after_ms: Some(remaining.as_millis().max(1) as u64),
                    };
                }
                _ => {
                    self.breaker = BreakerState::HalfOpen;
                    true
                }
            },
        };

        let delay = match self.consecutive_failures {
            0 => Duration::ZERO,
            failures => backoff_delay(config, failures - 1),
        };
        self.in_progress = true;
        self.attempts += 1;
        self.total_attempts += 1;
        Admission::Proceed {
            attempt: self.attempts,
            delay,
            trial,
        }
    }

    fn succeeded(&mut self, config: &RestartManagerConfig, reason: &str) {
        self.breaker = BreakerState::Closed;
        self.opened_at = None;
        self.current_cooldown = config.cooldown();
        self.consecutive_failures = 0;
        self.failure_window_start = None;
        self.total_successes += 1;
        self.stamp(reason);
    }

    /// Record a gated failure. Returns true when the breaker opened.
    fn failed(&mut self, config: &RestartManagerConfig, reason: &str, trial: bool, at: Instant) -> bool {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.failure_window_start.get_or_insert(at);
        self.stamp(reason);

        if trial {
            let grown = self.current_cooldown.as_secs_f64() * config.cooldown_multiplier;
            let capped = grown.min(config.max_cooldown().as_secs_f64()).max(0.0);
            self.current_cooldown = Duration::from_secs_f64(capped);
        } else if self.consecutive_failures < config.max_restart_attempts {
            return false;
        }
        self.breaker = BreakerState::Open;
        self.opened_at = Some(at);
        true
    }

    fn stamp(&mut self, reason: &str) {
        self.last_restart = Some(Instant::now());
        self.last_restart_at = Some(now());
        self.last_reason = Some(reason.to_string());
    }
}

/// Jittered exponential delay before restart attempt `attempt` (zero-based).
fn backoff_delay(config: &RestartManagerConfig, attempt: u32) -> Duration {
    let max_ms = config.backoff_max_ms as f64;
    let base_ms = config.backoff_initial_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped_ms = base_ms.min(max_ms);

    // ±25%
    let jitter_range = capped_ms * 0.25;
    let jitter = if jitter_range > 0.0 {
        rand::rng().random_range(-jitter_range..jitter_range)
    } else {
        0.0
    };
    let final_ms = (capped_ms + jitter).max(0.0).min(max_ms);
    Duration::from_secs_f64(final_ms / 1000.0)
}

struct RestartInner {
    config: RwLock<RestartManagerConfig>,
    threads: ThreadManager,
    bus: EventBus,
    state: Mutex<RestartState>,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

#[derive(Clone)]
pub struct RestartManager {
    inner: Arc<RestartInner>,
}

impl RestartManager {
    pub fn new(config: RestartManagerConfig, threads: ThreadManager, bus: EventBus) -> Self {
        let state = RestartState::new(&config);
        Self {
            inner: Arc::new(RestartInner {
                config: RwLock::new(config),
                threads,
                bus,
                state: Mutex::new(state),
                task: Mutex::new(None),
            }),
        }
    }

    /// Restart the worker if the breaker and attempt budget allow it.
    #[instrument(skip(self))]
    pub async fn trigger_restart(&self, reason: &str) -> Result<()> {
        let config = self.inner.config.read().await.clone();
        let admission = self.inner.state.lock().await.admit(&config, Instant::now());

        let (attempt, delay, trial) = match admission {
            Admission::Proceed { attempt, delay, trial } => (attempt, delay, trial),
            Admission::Refuse { detail, retry_after_ms } => {
                warn!(reason, detail, retry_after_ms, "Restart refused");
                self.inner.bus.publish(
                    Component::RestartManager,
                    EventKind::RestartRefused {
                        reason: reason.to_string(),
                        retry_after_ms,
                    },
                );
                return Err(WardenError::RestartRefused {
                    reason: format!("{detail} ({reason})"),
                    retry_after_ms,
                });
            }
        };

        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Backing off before restart");
            tokio::time::sleep(delay).await;
        }

        info!(reason, attempt, trial, "Restarting worker");
        let result = self.inner.threads.restart_worker(reason).await;

        let mut state = self.inner.state.lock().await;
        state.in_progress = false;
        match result {
            Ok(()) => {
                state.succeeded(&config, reason);
                drop(state);
                self.publish_success(reason, attempt);
                Ok(())
            }
            Err(e) => {
                let opened = state.failed(&config, reason, trial, Instant::now());
                let cooldown_ms = state.current_cooldown.as_millis() as u64;
                drop(state);
                if opened {
                    error!(reason, cooldown_ms, "Circuit breaker opened");
                }
                Err(self.publish_failure(reason, attempt, e))
            }
        }
    }

    /// Restart regardless of the breaker. Success closes it; failure leaves it as is.
    #[instrument(skip(self))]
    pub async fn force_restart(&self, reason: &str) -> Result<()> {
        let config = self.inner.config.read().await.clone();
        let attempt = {
            let mut state = self.inner.state.lock().await;
            state.refresh(&config, Instant::now());
            state.attempts += 1;
            state.total_attempts += 1;
            state.attempts
        };

        info!(reason, attempt, "Forcing worker restart");
        let result = self.inner.threads.restart_worker(reason).await;

        let mut state = self.inner.state.lock().await;
        match result {
            Ok(()) => {
                state.succeeded(&config, reason);
                drop(state);
                self.publish_success(reason, attempt);
                Ok(())
            }
            Err(e) => {
                state.total_failures += 1;
                state.stamp(reason);
                drop(state);
                Err(self.publish_failure(reason, attempt, e))
            }
        }
    }

    fn publish_success(&self, reason: &str, attempt: u32) {
        info!(reason, attempt, "Restart succeeded");
        self.inner.bus.publish(
            Component::RestartManager,
            EventKind::RestartSuccess {
                reason: reason.to_string(),
                attempt,
            },
        );
    }

    fn publish_failure(&self, reason: &str, attempt: u32, cause: WardenError) -> WardenError {
        let message = cause.to_string();
        error!(reason, attempt, error = %message, "Restart failed");
        self.inner.bus.publish(
            Component::RestartManager,
            EventKind::RestartFailed {
                reason: reason.to_string(),
                attempt,
                message: message.clone(),
            },
        );
        WardenError::RestartFailed {
            reason: reason.to_string(),
            message,
        }
    }

    /// React to crash and unhealthy events. No-op if already managing.
    pub async fn start_management(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let events = self.inner.bus.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(manage_loop(self.clone(), events, stop_rx));
        *task = Some((handle, stop_tx));
        info!("Restart management started");
    }

    /// Stop reacting to events. A restart already under way completes first.
    pub async fn stop_management(&self) {
        let task = self.inner.task.lock().await.take();
        if let Some((handle, stop)) = task {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Restart management task ended abnormally");
            }
            info!("Restart management stopped");
        }
    }

    pub async fn is_managing(&self) -> bool {
        self.inner.task.lock().await.is_some()
    }

    pub async fn get_restart_stats(&self) -> RestartStats {
        let config = self.inner.config.read().await.clone();
        let at = Instant::now();
        let mut state = self.inner.state.lock().await.clone();
        state.refresh(&config, at);

        let cooldown_remaining = state.cooldown_remaining(at);
        let can_restart = !state.in_progress
            && match state.breaker {
                BreakerState::Closed | BreakerState::HalfOpen => true,
                BreakerState::Open => cooldown_remaining.is_none_or(|r| r.is_zero()),
            };

        RestartStats {
            can_restart,
            is_managing: self.is_managing().await,
            auto_restart: config.auto_restart,
            current_restart_count: state.attempts,
            circuit_breaker_state: state.breaker,
            consecutive_failures: state.consecutive_failures,
            current_cooldown_ms: state.current_cooldown.as_millis() as u64,
            cooldown_remaining_ms: cooldown_remaining.map(|r| r.as_millis() as u64),
            restart_in_progress: state.in_progress,
            last_restart_at: state.last_restart_at,
            last_reason: state.last_reason,
            total_attempts: state.total_attempts,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_refused: state.total_refused,
        }
    }

    pub async fn config(&self) -> RestartManagerConfig {
        self.inner.config.read().await.clone()
    }

    /// A new base cooldown applies immediately while the breaker is closed.
    pub async fn update_config(&self, config: RestartManagerConfig) {
        {
            let mut state = self.inner.state.lock().await;
            if state.breaker == BreakerState::Closed {
                state.current_cooldown = config.cooldown();
            }
        }
        *self.inner.config.write().await = config;
        debug!("Restart manager config updated");
    }

    /// Keep restarting until the worker is back, management stops, or a
    /// restart is refused without a retry time.
    async fn recover(&self, reason: &str, stop: &mut watch::Receiver<bool>) {
        let mut first = true;
        loop {
            if *stop.borrow() {
                return;
            }
            if !first && self.inner.threads.is_worker_running().await {
                debug!("Worker already running, ending recovery");
                return;
            }
            first = false;

            let wait = match self.trigger_restart(reason).await {
                Ok(()) => return,
                Err(WardenError::RestartFailed { .. }) => None,
                Err(WardenError::RestartRefused {
                    retry_after_ms: Some(ms),
                    ..
                }) => Some(Duration::from_millis(ms)),
                Err(e) => {
                    debug!(error = %e, "Automatic recovery abandoned");
                    return;
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

async fn manage_loop(
    manager: RestartManager,
    mut events: broadcast::Receiver<ServiceEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Restart manager lagged behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let (generation, reason) = match &event.kind {
            EventKind::WorkerError {
                generation,
                message,
                crashed: true,
            } => (*generation, format!("worker crashed: {message}")),
            EventKind::WorkerUnhealthy {
                generation,
                consecutive_missed_checks,
            } => (
                *generation,
                format!("worker unhealthy after {consecutive_missed_checks} missed checks"),
            ),
            _ => continue,
        };

        if !manager.inner.config.read().await.auto_restart {
            debug!(reason = %reason, "Automatic restart disabled, ignoring");
            continue;
        }
        if generation != manager.inner.threads.generation().await {
            debug!(generation, "Ignoring signal from a previous worker");
            continue;
        }

        manager.recover(&reason, &mut stop).await;
    }
}
