//! Error aggregation.
//!
//! [`ErrorHandler`] is the terminal sink for failures from every component. It
//! keeps a bounded, insertion-ordered history (oldest evicted first), counts
//! errors by kind and source, and derives a sliding-window error rate. It
//! never fails and never panics, so it is safe to call from any error path.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;
use warden_config::ErrorHandlerConfig;
use warden_core::types::{Component, Timestamp, now};
use warden_core::{ErrorKind, WardenError};

use crate::events::{EventBus, EventKind};

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: Timestamp,
    pub source: Component,
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    /// Whether resending the same request may succeed
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Filter for [`ErrorHandler::get_errors`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorQuery {
    pub source: Option<Component>,
    pub kind: Option<ErrorKind>,
    /// Maximum records returned, newest first
    pub limit: Option<usize>,
}

/// Aggregated error statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    /// Errors recorded since the last clear, including evicted ones
    pub total_errors: u64,
    pub history_len: usize,
    pub errors_in_window: usize,
    pub error_rate_per_minute: f64,
    pub most_common_error: Option<ErrorKind>,
    /// Newest first
    pub recent_errors: Vec<ErrorRecord>,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    pub by_source: BTreeMap<Component, u64>,
}

#[derive(Default)]
struct ErrorState {
    history: VecDeque<ErrorRecord>,
    window: VecDeque<Instant>,
    total: u64,
    by_kind: BTreeMap<ErrorKind, u64>,
    by_source: BTreeMap<Component, u64>,
}

impl ErrorState {
    fn prune_window(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ErrorHandler {
    config: RwLock<ErrorHandlerConfig>,
    bus: EventBus,
    state: Mutex<ErrorState>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig, bus: EventBus) -> Self {
        Self {
            config: RwLock::new(config),
            bus,
            state: Mutex::new(ErrorState::default()),
        }
    }

    /// Record a [`WardenError`] raised by `source`.
    pub async fn handle_error(&self, source: Component, error: &WardenError, context: Option<Value>) -> ErrorRecord {
        self.push(source, error.kind(), error.to_string(), context).await
    }

    /// Record a failure that is not a [`WardenError`].
    pub async fn record(
        &self,
        source: Component,
        kind: ErrorKind,
        message: impl Into<String>,
        context: Option<Value>,
    ) -> ErrorRecord {
        self.push(source, kind, message.into(), context).await
    }

    async fn push(&self, source: Component, kind: ErrorKind, message: String, context: Option<Value>) -> ErrorRecord {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: now(),
            source,
            kind,
            code: kind.code().to_string(),
            message,
            recoverable: kind.is_recoverable(),
            context,
        };

        let config = self.config.read().await.clone();
        {
            let mut state = self.state.lock().await;
            let at = Instant::now();
            state.history.push_back(record.clone());
            while state.history.len() > config.max_history {
                state.history.pop_front();
            }
            state.window.push_back(at);
            state.prune_window(at, config.rate_window());
            state.total += 1;
            *state.by_kind.entry(kind).or_default() += 1;
            *state.by_source.entry(source).or_default() += 1;
        }

        if kind.is_worker_error() {
            error!(source = %source, kind = %kind, message = %record.message, "Worker failure recorded");
        } else {
            warn!(source = %source, kind = %kind, message = %record.message, "Error recorded");
        }
        self.bus.publish(
            Component::ErrorHandler,
            EventKind::Error {
                kind,
                message: record.message.clone(),
            },
        );
        record
    }

    pub async fn get_error_stats(&self) -> ErrorStats {
        let config = self.config.read().await.clone();
        let mut state = self.state.lock().await;
        state.prune_window(Instant::now(), config.rate_window());

        let window_minutes = config.rate_window().as_secs_f64() / 60.0;
        let errors_in_window = state.window.len();
        let error_rate_per_minute = if window_minutes > 0.0 {
            errors_in_window as f64 / window_minutes
        } else {
            0.0
        };

        // Ties go to the kind that sorts first.
        let most_common_error = state
            .by_kind
            .iter()
            .fold(None::<(ErrorKind, u64)>, |best, (kind, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*kind, *count)),
            })
            .map(|(kind, _)| kind);

        ErrorStats {
            total_errors: state.total,
            history_len: state.history.len(),
            errors_in_window,
            error_rate_per_minute,
            most_common_error,
            recent_errors: state.history.iter().rev().take(config.recent_errors).cloned().collect(),
            by_kind: state.by_kind.clone(),
            by_source: state.by_source.clone(),
        }
    }

    /// Matching records, newest first.
    pub async fn get_errors(&self, query: &ErrorQuery) -> Vec<ErrorRecord> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .rev()
            .filter(|r| query.source.is_none_or(|s| r.source == s))
            .filter(|r| query.kind.is_none_or(|k| r.kind == k))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Empty the history and reset counters. Returns how many records were dropped.
    pub async fn clear_error_history(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.history.len();
        *state = ErrorState::default();
        debug!(cleared, "Error history cleared");
        cleared
    }

    /// A smaller `max_history` trims the oldest records immediately.
    pub async fn update_config(&self, config: ErrorHandlerConfig) {
        let max_history = config.max_history;
        *self.config.write().await = config;
        let mut state = self.state.lock().await;
        while state.history.len() > max_history {
            state.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(max_history: usize) -> ErrorHandler {
        ErrorHandler::new(
            ErrorHandlerConfig {
                max_history,
                ..Default::default()
            },
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_history_cap_keeps_most_recent() {
        let errors = handler(3);
        for i in 0..5 {
            errors
                .record(Component::ThreadManager, ErrorKind::Timeout, format!("error {i}"), None)
                .await;
        }

        let history = errors.get_errors(&ErrorQuery::default()).await;
        let messages: Vec<&str> = history.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["error 4", "error 3", "error 2"]);

        let stats = errors.get_error_stats().await;
        assert_eq!(stats.total_errors, 5);
        assert_eq!(stats.history_len, 3);
    }

    #[tokio::test]
    async fn test_classification_and_most_common() {
        let errors = handler(100);
        errors
            .handle_error(Component::ThreadManager, &WardenError::timeout("r1", 10), None)
            .await;
        errors
            .handle_error(Component::ThreadManager, &WardenError::timeout("r2", 10), None)
            .await;
        errors
            .handle_error(Component::Worker, &WardenError::worker_crashed("gone"), Some(json!({"n": 1})))
            .await;

        let stats = errors.get_error_stats().await;
        assert_eq!(stats.most_common_error, Some(ErrorKind::Timeout));
        assert_eq!(stats.by_kind[&ErrorKind::Timeout], 2);
        assert_eq!(stats.by_source[&Component::Worker], 1);
        assert_eq!(stats.recent_errors[0].code, "WORKER_CRASHED");
        assert!(stats.recent_errors[0].recoverable);
        assert_eq!(stats.errors_in_window, 3);
        assert!(stats.error_rate_per_minute > 0.0);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let errors = handler(100);
        errors.record(Component::MessageQueue, ErrorKind::QueueFull, "full", None).await;
        errors.record(Component::ThreadManager, ErrorKind::Timeout, "slow", None).await;
        errors.record(Component::ThreadManager, ErrorKind::Timeout, "slower", None).await;

        let by_source = errors
            .get_errors(&ErrorQuery {
                source: Some(Component::MessageQueue),
                ..Default::default()
            })
            .await;
        assert_eq!(by_source.len(), 1);

        let limited = errors
            .get_errors(&ErrorQuery {
                kind: Some(ErrorKind::Timeout),
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message, "slower");
    }

    #[tokio::test]
    async fn test_records_carry_recoverability() {
        let errors = handler(10);
        let failed = errors
            .handle_error(
                Component::Worker,
                &WardenError::from_response("read", warden_core::error::codes::HANDLER_ERROR, "device offline"),
                None,
            )
            .await;
        assert!(!failed.recoverable);

        let full = errors.record(Component::MessageQueue, ErrorKind::QueueFull, "full", None).await;
        assert!(full.recoverable);

        let value = serde_json::to_value(&full).unwrap();
        assert_eq!(value["recoverable"], json!(true));
    }

    #[tokio::test]
    async fn test_clear() {
        let errors = handler(10);
        errors.record(Component::Service, ErrorKind::Internal, "x", None).await;
        assert_eq!(errors.clear_error_history().await, 1);

        let stats = errors.get_error_stats().await;
        assert_eq!(stats.total_errors, 0);
        assert!(stats.most_common_error.is_none());
        assert!(stats.by_kind.is_empty());
    }

    #[tokio::test]
    async fn test_emits_error_event() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let errors = ErrorHandler::new(ErrorHandlerConfig::default(), bus);

        errors.record(Component::HealthMonitor, ErrorKind::Timeout, "missed check", None).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.source, Component::ErrorHandler);
        assert!(matches!(event.kind, EventKind::Error { kind: ErrorKind::Timeout, .. }));
    }

    #[tokio::test]
    async fn test_shrinking_history() {
        let errors = handler(10);
        for i in 0..6 {
            errors.record(Component::Service, ErrorKind::Internal, format!("e{i}"), None).await;
        }
        errors
            .update_config(ErrorHandlerConfig {
                max_history: 2,
                ..Default::default()
            })
            .await;
        let history = errors.get_errors(&ErrorQuery::default()).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "e5");
    }
}
