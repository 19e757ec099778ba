//! Event bus shared by all supervisor components.
//!
//! Every component publishes onto one [`EventBus`], tagging each
//! [`ServiceEvent`] with its source [`Component`]. The façade hands out
//! receivers so callers subscribe once instead of per component.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use warden_core::types::{Component, Priority, Timestamp, now};
use warden_core::ErrorKind;

/// Default broadcast capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Worker reported readiness
    WorkerStarted {
        generation: u64,
        thread_name: String,
        actions: Vec<String>,
    },
    /// Worker was stopped on request
    WorkerStopped { generation: u64, reason: String },
    /// Worker failed to start or exited unexpectedly
    WorkerError {
        generation: u64,
        message: String,
        /// True when a running worker died
        crashed: bool,
    },
    /// Missed-check threshold crossed
    WorkerUnhealthy {
        generation: u64,
        consecutive_missed_checks: u32,
    },
    /// A probe succeeded after the worker was unhealthy
    WorkerRecovered { generation: u64 },
    MemoryThresholdExceeded { rss_mb: u64, threshold_mb: u64 },
    RestartSuccess { reason: String, attempt: u32 },
    RestartFailed {
        reason: String,
        attempt: u32,
        message: String,
    },
    RestartRefused {
        reason: String,
        retry_after_ms: Option<u64>,
    },
    /// Recorded by the error handler
    Error { kind: ErrorKind, message: String },
    MessageEvicted {
        correlation_id: String,
        priority: Priority,
    },
    MessageExpired { correlation_id: String },
}

impl EventKind {
    /// Short snake_case name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerStarted { .. } => "worker_started",
            Self::WorkerStopped { .. } => "worker_stopped",
            Self::WorkerError { .. } => "worker_error",
            Self::WorkerUnhealthy { .. } => "worker_unhealthy",
            Self::WorkerRecovered { .. } => "worker_recovered",
            Self::MemoryThresholdExceeded { .. } => "memory_threshold_exceeded",
            Self::RestartSuccess { .. } => "restart_success",
            Self::RestartFailed { .. } => "restart_failed",
            Self::RestartRefused { .. } => "restart_refused",
            Self::Error { .. } => "error",
            Self::MessageEvicted { .. } => "message_evicted",
            Self::MessageExpired { .. } => "message_expired",
        }
    }
}

/// An event tagged with its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub source: Component,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast channel for [`ServiceEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all subscribers. Having none is not an error.
    pub fn publish(&self, source: Component, kind: EventKind) {
        trace!(source = %source, event = kind.name(), "publishing event");
        let _ = self.tx.send(ServiceEvent {
            source,
            timestamp: now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
