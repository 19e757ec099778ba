//! The threading service façade.
//!
//! [`ThreadingService`] composes the thread manager, health monitor, restart
//! manager, error handler and message queue behind one API. Components are
//! built once from an explicit [`WardenConfig`] and share a single
//! [`EventBus`]; callers subscribe to that bus through
//! [`ThreadingService::subscribe`].
//!
//! Lifecycle operations return a [`ServiceResult`] rather than an error. A
//! failed [`ThreadingService::send_message`] is recorded in the error handler
//! exactly once before it is returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use warden_config::{ConfigManager, ConfigSection, ValidationReport, WardenConfig};
use warden_core::error::codes;
use warden_core::types::{Component, Priority, Timestamp, now};
use warden_core::{ErrorKind, Result, WardenError};

use crate::collector::ModbusCollector;
use crate::dispatcher::WorkerBackend;
use crate::error_handler::{ErrorHandler, ErrorQuery, ErrorRecord, ErrorStats};
use crate::events::{EventBus, EventKind, ServiceEvent};
use crate::health::{HealthMonitor, HealthStatus};
use crate::protocol::{Envelope, WorkerResponse};
use crate::queue::{MessageQueue, QueueStats};
use crate::restart::{RestartManager, RestartStats};
use crate::thread_manager::{MessageStats, PendingMessageInfo, ThreadManager, WorkerStatus};

/// Caller-facing description of a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub message_type: String,
    pub payload: Value,
    /// `low`, `normal`, `high` or `critical`, case-insensitive
    pub priority: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub correlation_id: Option<String>,
}

impl SendOptions {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn into_envelope(self) -> Result<Envelope> {
        let priority = match self.priority.as_deref() {
            Some(value) => value.parse::<Priority>()?,
            None => Priority::default(),
        };
        let mut envelope = Envelope::new(self.message_type, self.payload).with_priority(priority);
        envelope.timeout_ms = self.timeout_ms;
        envelope.max_retries = self.max_retries.unwrap_or(0);
        envelope.correlation_id = self.correlation_id;
        Ok(envelope)
    }
}

/// Uniform outcome of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// Operator hint for the failure, when one applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<&'static str>,
}

impl ServiceResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            error_code: None,
            guidance: None,
        }
    }

    fn failed(message: impl Into<String>, error: &WardenError) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.to_string()),
            error_code: Some(error.code()),
            guidance: error.guidance(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub started_at: Option<Timestamp>,
    pub worker: WorkerStatus,
    pub health: HealthStatus,
    pub restart: RestartStats,
    pub queue_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub messages: MessageStats,
    pub queue: QueueStats,
    pub restarts: RestartStats,
    pub errors: ErrorStats,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    started_at: Option<Timestamp>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct ThreadingService {
    config: Mutex<ConfigManager>,
    bus: EventBus,
    threads: ThreadManager,
    health: HealthMonitor,
    restarts: RestartManager,
    errors: Arc<ErrorHandler>,
    queue: MessageQueue,
    lifecycle: Mutex<Lifecycle>,
}

impl ThreadingService {
    pub fn new<F>(config: WardenConfig, factory: F) -> Self
    where
        F: Fn() -> Box<dyn WorkerBackend> + Send + Sync + 'static,
    {
        let bus = EventBus::default();
        let threads = ThreadManager::new(config.thread_manager.clone(), bus.clone(), factory);
        let health = HealthMonitor::new(config.health_monitor.clone(), threads.clone(), bus.clone());
        let restarts = RestartManager::new(config.restart_manager.clone(), threads.clone(), bus.clone());
        let errors = Arc::new(ErrorHandler::new(config.error_handler.clone(), bus.clone()));
        let queue = MessageQueue::new(config.message_queue.clone(), threads.clone(), bus.clone());

        Self {
            config: Mutex::new(ConfigManager::new(config)),
            bus,
            threads,
            health,
            restarts,
            errors,
            queue,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Service backed by the simulated Modbus collector.
    pub fn with_collector(config: WardenConfig) -> Self {
        Self::new(config, || Box::new(ModbusCollector::default()) as Box<dyn WorkerBackend>)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start queue, health monitor, restart manager and worker, in that order.
    ///
    /// Succeeds without side effects when already running. If the worker
    /// fails to start, the components started before it are stopped again.
    #[instrument(skip(self))]
    pub async fn start(&self) -> ServiceResult {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            debug!("Service already running");
            return ServiceResult::ok("service already running");
        }

        if lifecycle.forwarder.is_none() {
            lifecycle.forwarder = Some(tokio::spawn(forward_events(self.bus.subscribe(), self.errors.clone())));
        }

        let config = self.config.lock().await.current().clone();
        if config.message_queue.enabled {
            self.queue.start().await;
        }
        if config.health_monitor.enabled {
            self.health.start_monitoring().await;
        }
        self.restarts.start_management().await;

        if let Err(e) = self.threads.start_worker().await {
            error!(error = %e, "Service failed to start");
            self.restarts.stop_management().await;
            self.health.stop_monitoring().await;
            self.queue.stop().await;
            return ServiceResult::failed("failed to start worker", &e);
        }

        lifecycle.running = true;
        lifecycle.started_at = Some(now());
        info!("Threading service started");
        ServiceResult::ok("service started")
    }

    /// Stop worker, restart manager, health monitor and queue, in that order.
    #[instrument(skip(self))]
    pub async fn stop(&self, graceful: bool) -> ServiceResult {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return ServiceResult::ok("service not running");
        }

        let mut outcome = self.threads.stop_worker(graceful, "service stopping").await;
        self.restarts.stop_management().await;
        self.health.stop_monitoring().await;
        let cancelled = self.queue.stop().await;

        // A restart that raced the first stop may have revived the worker.
        if outcome.is_ok() && self.threads.is_worker_running().await {
            outcome = self.threads.stop_worker(graceful, "service stopping").await;
        }

        lifecycle.running = false;
        lifecycle.started_at = None;
        match outcome {
            Ok(()) => {
                info!(graceful, cancelled, "Threading service stopped");
                ServiceResult::ok("service stopped")
            }
            Err(e) => {
                error!(error = %e, "Worker did not stop cleanly");
                ServiceResult::failed("failed to stop worker", &e)
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Apply `config_patch` if given, then restart the worker regardless of
    /// the circuit breaker.
    #[instrument(skip(self, config_patch))]
    pub async fn restart_worker(&self, reason: &str, config_patch: Option<&Value>) -> ServiceResult {
        if let Some(patch) = config_patch {
            let report = self.update_config(patch, None).await;
            if !report.is_valid {
                return ServiceResult {
                    success: false,
                    message: "configuration rejected, worker not restarted".to_string(),
                    error: Some(report.errors.join("; ")),
                    error_code: Some(ErrorKind::Validation.code()),
                    guidance: None,
                };
            }
        }

        match self.restarts.force_restart(reason).await {
            Ok(()) => ServiceResult::ok("worker restarted"),
            Err(e) => ServiceResult::failed("worker restart failed", &e),
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a message and wait for a successful response.
    ///
    /// Goes through the message queue while it is running. A response with
    /// `success == false` becomes an error.
    pub async fn send_message(&self, options: SendOptions) -> Result<WorkerResponse> {
        let message_type = options.message_type.clone();
        let mut envelope = match options.into_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                self.errors
                    .handle_error(Component::Service, &e, Some(json!({ "message_type": message_type })))
                    .await;
                return Err(e);
            }
        };
        let correlation_id = envelope.ensure_correlation_id();
        let priority = envelope.priority;

        let (source, outcome) = if self.queue.is_running() {
            (Component::MessageQueue, self.queue.enqueue(envelope).await)
        } else {
            (Component::ThreadManager, self.threads.send_message(envelope).await)
        };

        let result = outcome.and_then(|response| {
            if response.success {
                return Ok(response);
            }
            Err(match &response.error {
                Some(error) => WardenError::from_response(&message_type, &error.code, &error.message),
                None => WardenError::from_response(&message_type, codes::HANDLER_ERROR, "worker reported failure"),
            })
        });

        if let Err(e) = &result {
            let source = match e.kind() {
                ErrorKind::UnknownAction | ErrorKind::HandlerFailure => Component::Worker,
                _ => source,
            };
            let context = json!({
                "message_type": message_type,
                "correlation_id": correlation_id,
                "priority": priority,
            });
            self.errors.handle_error(source, e, Some(context)).await;
        }
        result
    }

    pub async fn get_pending_messages(&self) -> Vec<PendingMessageInfo> {
        self.threads.pending_messages().await
    }

    /// Cancel every in-flight message; returns how many.
    pub async fn clear_pending_messages(&self, reason: &str) -> usize {
        self.threads.clear_pending_messages(reason).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_status(&self) -> ServiceStatus {
        let (is_running, started_at) = {
            let lifecycle = self.lifecycle.lock().await;
            (lifecycle.running, lifecycle.started_at)
        };
        ServiceStatus {
            is_running,
            started_at,
            worker: self.threads.get_status().await,
            health: self.health.get_health_status().await,
            restart: self.restarts.get_restart_stats().await,
            queue_running: self.queue.is_running(),
        }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.health.get_health_status().await
    }

    pub async fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            messages: self.threads.get_message_stats().await,
            queue: self.queue.get_stats().await,
            restarts: self.restarts.get_restart_stats().await,
            errors: self.errors.get_error_stats().await,
        }
    }

    /// Run one health check now, outside the periodic schedule.
    pub async fn perform_health_check(&self) -> bool {
        self.health.perform_health_check().await
    }

    pub async fn get_errors(&self, query: &ErrorQuery) -> Vec<ErrorRecord> {
        self.errors.get_errors(query).await
    }

    pub async fn clear_errors(&self) -> usize {
        self.errors.clear_error_history().await
    }

    /// Receiver for every component's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.bus.subscribe()
    }

    pub fn thread_manager(&self) -> &ThreadManager {
        &self.threads
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn get_config(&self) -> WardenConfig {
        self.config.lock().await.current().clone()
    }

    /// Validate and apply a patch. Components see the new settings only when
    /// the whole patch is valid.
    ///
    /// With `section` set, `patch` holds that section's fields; otherwise its
    /// keys name sections.
    pub async fn update_config(&self, patch: &Value, section: Option<&str>) -> ValidationReport {
        let section = match section.map(str::parse::<ConfigSection>).transpose() {
            Ok(section) => section,
            Err(e) => {
                return ValidationReport {
                    is_valid: false,
                    errors: vec![e.to_string()],
                    warnings: Vec::new(),
                };
            }
        };

        let (report, config) = {
            let mut manager = self.config.lock().await;
            let report = manager.apply_patch(section, patch);
            (report, manager.current().clone())
        };
        if report.is_valid {
            self.propagate(&config).await;
        }
        report
    }

    async fn propagate(&self, config: &WardenConfig) {
        self.threads.update_config(config.thread_manager.clone()).await;
        self.health.update_config(config.health_monitor.clone()).await;
        self.restarts.update_config(config.restart_manager.clone()).await;
        self.errors.update_config(config.error_handler.clone()).await;
        self.queue.update_config(config.message_queue.clone()).await;

        if !self.is_running().await {
            return;
        }
        match (config.health_monitor.enabled, self.health.is_monitoring().await) {
            (true, false) => self.health.start_monitoring().await,
            (false, true) => self.health.stop_monitoring().await,
            _ => {}
        }
        match (config.message_queue.enabled, self.queue.is_running()) {
            (true, false) => self.queue.start().await,
            (false, true) => {
                self.queue.stop().await;
            }
            _ => {}
        }
    }
}

impl Drop for ThreadingService {
    fn drop(&mut self) {
        if let Some(forwarder) = self.lifecycle.get_mut().forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Log every event and record failure events in the error handler.
async fn forward_events(mut events: broadcast::Receiver<ServiceEvent>, errors: Arc<ErrorHandler>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged behind the event bus");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        debug!(source = %event.source, event = event.kind.name(), "Service event");

        let (kind, message, context) = match &event.kind {
            EventKind::WorkerError {
                generation,
                message,
                crashed,
            } => {
                let kind = if *crashed {
                    ErrorKind::WorkerCrashed
                } else {
                    ErrorKind::SpawnFailure
                };
                (kind, message.clone(), json!({ "generation": generation }))
            }
            EventKind::WorkerUnhealthy {
                generation,
                consecutive_missed_checks,
            } => (
                ErrorKind::Timeout,
                format!("worker missed {consecutive_missed_checks} health checks"),
                json!({ "generation": generation }),
            ),
            EventKind::RestartFailed {
                reason,
                attempt,
                message,
            } => (
                ErrorKind::RestartFailure,
                message.clone(),
                json!({ "reason": reason, "attempt": attempt }),
            ),
            EventKind::RestartRefused { reason, retry_after_ms } => (
                ErrorKind::RestartExhausted,
                format!("restart refused: {reason}"),
                json!({ "retry_after_ms": retry_after_ms }),
            ),
            _ => continue,
        };
        errors.record(event.source, kind, message, Some(context)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBackend, fast_config, wait_for};
    use std::time::Duration;
    use warden_core::types::LifecycleState;

    fn service(backend: &TestBackend) -> ThreadingService {
        ThreadingService::new(fast_config(), backend.factory())
    }

    #[test]
    fn test_send_options_priority_mapping() {
        let envelope = SendOptions::new("read", json!({}))
            .with_priority("CRITICAL")
            .with_timeout_ms(250)
            .into_envelope()
            .unwrap();
        assert_eq!(envelope.priority, Priority::Critical);
        assert_eq!(envelope.timeout_ms, Some(250));

        let default = SendOptions::new("read", json!({})).into_envelope().unwrap();
        assert_eq!(default.priority, Priority::Normal);

        let err = SendOptions::new("read", json!({}))
            .with_priority("urgent")
            .into_envelope()
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidPriority { .. }));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let backend = TestBackend::new();
        let svc = service(&backend);

        let started = svc.start().await;
        assert!(started.success, "{started:?}");
        let status = svc.get_status().await;
        assert!(status.is_running);
        assert!(status.worker.is_running);
        assert!(status.health.is_monitoring);
        assert!(status.restart.is_managing);
        assert!(status.queue_running);

        let stopped = svc.stop(true).await;
        assert!(stopped.success);
        let status = svc.get_status().await;
        assert!(!status.is_running);
        assert_eq!(status.worker.state, LifecycleState::Stopped);
        assert!(!status.health.is_monitoring);
        assert!(!status.restart.is_managing);
        assert!(!status.queue_running);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let backend = TestBackend::new();
        backend.set_fail_init(true);
        let svc = service(&backend);

        let result = svc.start().await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some("SPAWN_FAILURE"));
        assert!(result.guidance.is_some());
        let status = svc.get_status().await;
        assert!(!status.is_running);
        assert!(!status.health.is_monitoring);
        assert!(!status.queue_running);
    }

    #[tokio::test]
    async fn test_failed_send_recorded_once() {
        let svc = service(&TestBackend::new());
        svc.start().await;

        let err = svc.send_message(SendOptions::new("fail", json!({}))).await.unwrap_err();
        assert!(matches!(err, WardenError::ActionFailed { ref code, .. } if code == "HANDLER_ERROR"));

        let errors = svc
            .get_errors(&ErrorQuery {
                kind: Some(ErrorKind::HandlerFailure),
                ..Default::default()
            })
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, Component::Worker);
        assert_eq!(errors[0].context.as_ref().unwrap()["message_type"], "fail");
        svc.stop(true).await;
    }

    #[tokio::test]
    async fn test_send_without_queue_goes_direct() {
        let mut config = fast_config();
        config.message_queue.enabled = false;
        let svc = ThreadingService::new(config, TestBackend::new().factory());
        svc.start().await;

        let response = svc
            .send_message(SendOptions::new("echo", json!({"n": 1})).with_priority("high"))
            .await
            .unwrap();
        assert_eq!(response.data, Some(json!({"n": 1})));
        assert_eq!(svc.get_stats().await.queue.total_enqueued, 0);
        svc.stop(true).await;
    }

    #[tokio::test]
    async fn test_send_when_stopped() {
        let mut config = fast_config();
        config.message_queue.enabled = false;
        let svc = ThreadingService::new(config, TestBackend::new().factory());

        let err = svc.send_message(SendOptions::new("echo", json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
        assert_eq!(svc.get_stats().await.errors.total_errors, 1);
    }

    #[tokio::test]
    async fn test_update_config_propagates() {
        let svc = service(&TestBackend::new());
        let report = svc
            .update_config(&json!({ "max_missed_checks": 9 }), Some("healthMonitor"))
            .await;
        assert!(report.is_valid, "{report:?}");
        assert_eq!(svc.get_health_status().await.max_missed_checks, 9);
        assert_eq!(svc.get_config().await.health_monitor.max_missed_checks, 9);

        let report = svc.update_config(&json!({}), Some("nonsense")).await;
        assert!(!report.is_valid);
    }

    #[tokio::test]
    async fn test_restart_with_invalid_patch_does_nothing() {
        let backend = TestBackend::new();
        let svc = service(&backend);
        svc.start().await;

        let result = svc
            .restart_worker("reconfigure", Some(&json!({ "thread_manager": { "startup_timeout_ms": 0 } })))
            .await;
        assert!(!result.success);
        assert!(result.guidance.is_none());
        assert_eq!(svc.get_status().await.worker.restart_count, 0);
        assert_eq!(backend.init_count(), 1);
        svc.stop(true).await;
    }

    #[tokio::test]
    async fn test_restart_with_patch() {
        let backend = TestBackend::new();
        let svc = service(&backend);
        svc.start().await;

        let result = svc
            .restart_worker("reconfigure", Some(&json!({ "error_handler": { "max_history": 5 } })))
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(svc.get_status().await.worker.restart_count, 1);
        assert_eq!(svc.get_config().await.error_handler.max_history, 5);
        svc.stop(true).await;
    }

    #[tokio::test]
    async fn test_crash_is_recorded_by_forwarder() {
        let svc = service(&TestBackend::new());
        svc.start().await;
        svc.thread_manager().kill_worker().await.unwrap();

        assert!(
            wait_for(Duration::from_secs(2), || async {
                !svc
                    .get_errors(&ErrorQuery {
                        kind: Some(ErrorKind::WorkerCrashed),
                        ..Default::default()
                    })
                    .await
                    .is_empty()
            })
            .await
        );
        svc.stop(true).await;
    }
}
