//! Scriptable backend used by the unit and lifecycle tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use warden_config::WardenConfig;

use crate::dispatcher::{ActionHandler, HandlerError, WorkerBackend};

#[derive(Default)]
struct Shared {
    fail_init: AtomicBool,
    init_delay_ms: AtomicU64,
    init_count: AtomicUsize,
    shutdown_count: AtomicUsize,
    log: Mutex<Vec<String>>,
}

/// Backend whose state is shared by every instance cloned from it, so a test
/// can observe workers created by a factory.
#[derive(Clone, Default)]
pub(crate) struct TestBackend {
    shared: Arc<Shared>,
}

impl TestBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail_init(&self, fail: bool) {
        self.shared.fail_init.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_init_delay(&self, delay: Duration) {
        self.shared
            .init_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `initialize` calls across all instances.
    pub(crate) fn init_count(&self) -> usize {
        self.shared.init_count.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shared.shutdown_count.load(Ordering::SeqCst)
    }

    /// Tags recorded by `echo` and `sleep`, in execution order.
    pub(crate) fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub(crate) fn factory(&self) -> impl Fn() -> Box<dyn WorkerBackend> + Send + Sync + 'static {
        let backend = self.clone();
        move || Box::new(backend.clone()) as Box<dyn WorkerBackend>
    }
}

#[async_trait]
impl WorkerBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    async fn initialize(&self) -> Result<(), HandlerError> {
        self.shared.init_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.shared.init_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.shared.fail_init.load(Ordering::SeqCst) {
            return Err(HandlerError::failed("init failed: device unreachable"));
        }
        Ok(())
    }

    fn handlers(&self) -> Vec<Arc<dyn ActionHandler>> {
        ["echo", "sleep", "block", "fail", "panic", "get_status"]
            .into_iter()
            .map(|name| {
                Arc::new(TestAction {
                    name,
                    shared: self.shared.clone(),
                }) as Arc<dyn ActionHandler>
            })
            .collect()
    }

    async fn shutdown(&self) {
        self.shared.shutdown_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestAction {
    name: &'static str,
    shared: Arc<Shared>,
}

impl TestAction {
    fn record(&self, params: &Value) {
        if let Some(tag) = params.get("tag").and_then(Value::as_str) {
            self.shared.log.lock().unwrap().push(tag.to_string());
        }
    }
}

#[async_trait]
impl ActionHandler for TestAction {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, params: Value) -> Result<Value, HandlerError> {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        match self.name {
            "echo" => {
                self.record(&params);
                Ok(params)
            }
            "sleep" => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.record(&params);
                Ok(json!({ "slept_ms": ms }))
            }
            // Blocks the worker's runtime thread.
            "block" => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "blocked_ms": ms }))
            }
            "fail" => Err(HandlerError::failed("boom")),
            "panic" => panic!("handler exploded"),
            "get_status" => Ok(json!({ "is_running": true })),
            other => Err(HandlerError::failed(format!("unscripted action {other}"))),
        }
    }
}

/// Configuration with short timings for tests.
pub(crate) fn fast_config() -> WardenConfig {
    warden_core::logging::init_test_logging();
    let mut config = WardenConfig::default();
    config.thread_manager.startup_timeout_ms = 2_000;
    config.thread_manager.shutdown_grace_ms = 500;
    config.thread_manager.default_message_timeout_ms = 2_000;
    config.health_monitor.check_interval_ms = 50;
    config.health_monitor.probe_timeout_ms = 100;
    config.health_monitor.max_missed_checks = 2;
    config.restart_manager.backoff_initial_ms = 1;
    config.restart_manager.backoff_max_ms = 5;
    config.restart_manager.cooldown_ms = 200;
    config.restart_manager.max_cooldown_ms = 1_000;
    config
}

/// Poll `check` until it holds or `timeout` elapses.
pub(crate) async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
