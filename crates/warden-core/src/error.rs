//! Error types for Warden operations.
//!
//! This module defines [`WardenError`], the error enum shared by the supervisor
//! components and the worker boundary. Every failure is classified into an
//! [`ErrorKind`] so callers and the error handler can aggregate by category
//! without matching on individual variants.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LifecycleState;

/// Result type alias using [`WardenError`].
pub type Result<T> = std::result::Result<T, WardenError>;

/// Error codes carried in structured worker responses.
pub mod codes {
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const HANDLER_PANIC: &str = "HANDLER_PANIC";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
}

/// Comprehensive error type for all Warden operations.
///
/// Callers always receive either a value or one of these; nothing is retried
/// silently unless the envelope carries an explicit retry budget.
#[derive(Debug, Error)]
pub enum WardenError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is not valid YAML/JSON for the schema
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {}", .errors.join("; "))]
    ConfigValidation { errors: Vec<String> },

    /// Unknown configuration section name
    #[error("Unknown configuration section: {section}")]
    UnknownConfigSection { section: String },

    // =========================================================================
    // Worker Lifecycle Errors
    // =========================================================================
    /// Worker thread could not be spawned
    #[error("Failed to spawn worker: {message}")]
    WorkerSpawn { message: String },

    /// Worker backend initialization failed; the worker reported unready
    #[error("Worker initialization failed: {message}")]
    WorkerInit { message: String },

    /// Worker did not report readiness in time
    #[error("Worker did not become ready within {timeout_ms}ms")]
    WorkerStartupTimeout { timeout_ms: u64 },

    /// Operation requires a running worker
    #[error("Worker is not running (state: {state})")]
    WorkerNotRunning { state: LifecycleState },

    /// Worker exited unexpectedly while the message was in flight
    #[error("Worker crashed: {reason}")]
    WorkerCrashed { reason: String },

    /// Worker was stopped while the message was in flight
    #[error("Worker stopped: {reason}")]
    WorkerStopped { reason: String },

    // =========================================================================
    // Messaging Errors
    // =========================================================================
    /// Pending message exceeded its deadline
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// Pending or queued message was cancelled
    #[error("Request cancelled: {reason}")]
    Cancelled { reason: String },

    /// Message queue rejected or evicted the message
    #[error("Message queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Worker does not know the requested action
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    /// Worker handled the action but reported a failure
    #[error("Action {action} failed [{code}]: {message}")]
    ActionFailed {
        action: String,
        code: String,
        message: String,
    },

    /// Priority string could not be mapped
    #[error("Invalid priority: {value}")]
    InvalidPriority { value: String },

    /// Worker channel closed unexpectedly
    #[error("Worker channel closed: {message}")]
    ChannelClosed { message: String },

    // =========================================================================
    // Restart Errors
    // =========================================================================
    /// Circuit breaker refused the restart
    #[error("Restart refused: {reason}")]
    RestartRefused {
        reason: String,
        retry_after_ms: Option<u64>,
    },

    /// Restart sequence ran but the worker did not come back
    #[error("Restart failed ({reason}): {message}")]
    RestartFailed { reason: String, message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Log directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in Warden)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Classification of errors for aggregation and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Config file missing, unparsable, or rejected
    Configuration,
    /// Worker failed to start
    SpawnFailure,
    /// Worker not running when a message was sent
    NotRunning,
    /// Worker died unexpectedly
    WorkerCrashed,
    /// Worker stopped on request while messages were pending
    WorkerStopped,
    /// Message deadline exceeded
    Timeout,
    /// Message cancelled by caller or shutdown
    Cancelled,
    /// Queue backpressure
    QueueFull,
    /// Action outside the registry
    UnknownAction,
    /// Action handler returned an error or panicked
    HandlerFailure,
    /// Malformed input from a caller
    Validation,
    /// Circuit breaker open
    RestartExhausted,
    /// Restart attempted but failed
    RestartFailure,
    /// Filesystem failure
    Io,
    /// Everything else
    Internal,
}

impl ErrorKind {
    /// Stable upper-case code, used in responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION",
            Self::SpawnFailure => "SPAWN_FAILURE",
            Self::NotRunning => "WORKER_NOT_RUNNING",
            Self::WorkerCrashed => "WORKER_CRASHED",
            Self::WorkerStopped => "WORKER_STOPPED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::QueueFull => "QUEUE_FULL",
            Self::UnknownAction => "UNKNOWN_ACTION",
            Self::HandlerFailure => "HANDLER_FAILURE",
            Self::Validation => "VALIDATION",
            Self::RestartExhausted => "RESTART_EXHAUSTED",
            Self::RestartFailure => "RESTART_FAILURE",
            Self::Io => "IO",
            Self::Internal => "INTERNAL",
        }
    }
}

impl ErrorKind {
    /// Whether sending the same request again may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NotRunning | Self::WorkerCrashed | Self::WorkerStopped | Self::QueueFull
        )
    }

    /// Whether the failure concerns the whole worker rather than one message.
    pub fn is_worker_error(&self) -> bool {
        matches!(self, Self::SpawnFailure | Self::WorkerCrashed | Self::WorkerStopped)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::SpawnFailure => write!(f, "spawn_failure"),
            Self::NotRunning => write!(f, "not_running"),
            Self::WorkerCrashed => write!(f, "worker_crashed"),
            Self::WorkerStopped => write!(f, "worker_stopped"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::QueueFull => write!(f, "queue_full"),
            Self::UnknownAction => write!(f, "unknown_action"),
            Self::HandlerFailure => write!(f, "handler_failure"),
            Self::Validation => write!(f, "validation"),
            Self::RestartExhausted => write!(f, "restart_exhausted"),
            Self::RestartFailure => write!(f, "restart_failure"),
            Self::Io => write!(f, "io"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl WardenError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a worker spawn error
    pub fn worker_spawn(message: impl Into<String>) -> Self {
        Self::WorkerSpawn {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(request_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            request_id: request_id.into(),
            timeout_ms,
        }
    }

    /// Create a worker crash error
    pub fn worker_crashed(reason: impl Into<String>) -> Self {
        Self::WorkerCrashed {
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Build the error for an unsuccessful worker response.
    pub fn from_response(action: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        let action = action.into();
        if code == codes::UNKNOWN_ACTION {
            return Self::UnknownAction { action };
        }
        Self::ActionFailed {
            action,
            code: code.to_string(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound { .. }
            | Self::ConfigInvalid { .. }
            | Self::ConfigValidation { .. }
            | Self::UnknownConfigSection { .. } => ErrorKind::Configuration,
            Self::WorkerSpawn { .. } | Self::WorkerInit { .. } | Self::WorkerStartupTimeout { .. } => {
                ErrorKind::SpawnFailure
            }
            Self::WorkerNotRunning { .. } => ErrorKind::NotRunning,
            Self::WorkerCrashed { .. } | Self::ChannelClosed { .. } => ErrorKind::WorkerCrashed,
            Self::WorkerStopped { .. } => ErrorKind::WorkerStopped,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::UnknownAction { .. } => ErrorKind::UnknownAction,
            Self::ActionFailed { code, .. } if code == codes::INVALID_PARAMS => ErrorKind::Validation,
            Self::ActionFailed { .. } => ErrorKind::HandlerFailure,
            Self::InvalidPriority { .. } => ErrorKind::Validation,
            Self::RestartRefused { .. } => ErrorKind::RestartExhausted,
            Self::RestartFailed { .. } => ErrorKind::RestartFailure,
            Self::DirectoryCreation { .. } => ErrorKind::Io,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Stable upper-case code for this error.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => Some("Pass --config with an existing YAML file or omit it for defaults"),
            Self::ConfigInvalid { .. } => Some("Check YAML syntax and field names against the documented sections"),
            Self::WorkerInit { .. } => Some("Check the worker backend's initialization and its device settings"),
            Self::WorkerStartupTimeout { .. } => {
                Some("Increase thread_manager.startup_timeout_ms or check backend initialization")
            }
            Self::RestartRefused { .. } => {
                Some("Wait for the circuit breaker cooldown or call restart_worker explicitly")
            }
            Self::QueueFull { .. } => Some("Raise message_queue.capacity or reduce request rate"),
            Self::WorkerNotRunning { .. } => Some("Start the service before sending messages"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_error() {
        let err = WardenError::config_not_found("/etc/warden/config.yaml");
        assert!(err.to_string().contains("Configuration not found"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_timeout_classification() {
        let err = WardenError::timeout("req-7", 250);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.kind().is_recoverable());
        assert!(err.to_string().contains("req-7"));
    }

    #[test]
    fn test_crash_is_worker_error() {
        let err = WardenError::worker_crashed("thread panicked");
        assert_eq!(err.code(), "WORKER_CRASHED");
        assert!(err.kind().is_worker_error());
        assert!(err.kind().is_recoverable());
    }

    #[test]
    fn test_handler_failure_is_message_local() {
        let err = WardenError::from_response("read", codes::HANDLER_ERROR, "device offline");
        assert!(!err.kind().is_worker_error());
        assert!(!err.kind().is_recoverable());
        assert!(err.guidance().is_none());
    }

    #[test]
    fn test_from_response_unknown_action() {
        let err = WardenError::from_response("does_not_exist", codes::UNKNOWN_ACTION, "ignored");
        assert_eq!(err.kind(), ErrorKind::UnknownAction);
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn test_from_response_handler_error() {
        let err = WardenError::from_response("read", codes::HANDLER_ERROR, "device offline");
        assert_eq!(err.kind(), ErrorKind::HandlerFailure);
        assert!(err.to_string().contains("device offline"));
    }

    #[test]
    fn test_validation_message_joins_errors() {
        let err = WardenError::ConfigValidation {
            errors: vec!["a must be > 0".into(), "b must be > 0".into()],
        };
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: a must be > 0; b must be > 0"
        );
    }

    #[test]
    fn test_not_running_display() {
        let err = WardenError::WorkerNotRunning {
            state: LifecycleState::Crashed,
        };
        assert_eq!(err.to_string(), "Worker is not running (state: crashed)");
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }
}
