//! Messages exchanged across the supervisor/worker boundary.
//!
//! The supervisor sends [`WorkerCommand`]s over one channel and the worker
//! answers with [`WorkerReply`]s over another. Responses are matched to
//! requests by `request_id` only; completion order is unspecified.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use warden_core::types::{Priority, Timestamp};

/// A unit of work addressed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Action name looked up in the worker's registry
    pub message_type: String,
    /// Action parameters, opaque to the supervisor
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Deadline for a single delivery attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra attempts made after a timeout
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            priority: Priority::Normal,
            timeout_ms: None,
            max_retries: 0,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Return the correlation id, assigning a fresh one if absent.
    pub fn ensure_correlation_id(&mut self) -> String {
        self.correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }
}

/// Structured failure reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    pub action: String,
}

impl ResponseError {
    pub fn new(code: impl Into<String>, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.action, self.message)
    }
}

/// The worker's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl WorkerResponse {
    pub fn ok(request_id: impl Into<String>, correlation_id: Option<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            correlation_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, correlation_id: Option<String>, error: ResponseError) -> Self {
        Self {
            request_id: request_id.into(),
            correlation_id,
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Resident and virtual memory of the worker's process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

impl MemoryUsage {
    pub fn rss_mb(&self) -> u64 {
        self.rss_bytes / (1024 * 1024)
    }
}

/// Answer to a heartbeat probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub probe_id: String,
    pub timestamp: Timestamp,
    pub memory: MemoryUsage,
    /// Requests currently executing inside the worker
    pub in_flight: usize,
    /// Requests completed since the worker started
    pub handled: u64,
    pub uptime_ms: u64,
}

/// Supervisor to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Request { request_id: String, envelope: Envelope },
    Heartbeat { probe_id: String },
    Shutdown,
}

/// Worker to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Backend initialized; the registry is fixed from here on
    Ready { actions: Vec<String> },
    /// Backend initialization failed; the worker exits without accepting work
    InitFailed { message: String },
    Response(WorkerResponse),
    Heartbeat(HeartbeatReport),
    ShutdownAck,
}
