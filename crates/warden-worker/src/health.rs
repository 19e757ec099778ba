//! Worker health monitoring.
//!
//! [`HealthMonitor`] probes the worker through the [`ThreadManager`] on a
//! fixed interval and keeps a [`HealthRecord`]. Each check either resets or
//! increments the consecutive miss counter:
//!
//! - crossing `max_missed_checks` marks the worker unhealthy and emits
//!   `WorkerUnhealthy` once per transition
//! - the first successful probe afterwards emits `WorkerRecovered`
//! - resident memory above `memory_threshold_mb` emits
//!   `MemoryThresholdExceeded` on the rising edge, regardless of health
//!
//! Checks only probe a running worker. A crashed worker counts as a miss;
//! while the worker is stopped or mid-transition the check is skipped. Health
//! and the miss counter start over with each new worker generation.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_config::HealthMonitorConfig;
use warden_core::types::{Component, LifecycleState, Timestamp};

use crate::events::{EventBus, EventKind};
use crate::protocol::MemoryUsage;
use crate::thread_manager::ThreadManager;

/// Result of the most recent checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    /// Worker generation the counters describe
    pub generation: Option<u64>,
    pub is_healthy: bool,
    pub last_heartbeat: Option<Timestamp>,
    pub consecutive_missed_checks: u32,
    pub memory: Option<MemoryUsage>,
    pub memory_exceeded: bool,
    pub total_checks: u64,
    pub total_failures: u64,
    pub last_latency_ms: Option<u64>,
    pub last_failure: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            generation: None,
            is_healthy: true,
            last_heartbeat: None,
            consecutive_missed_checks: 0,
            memory: None,
            memory_exceeded: false,
            total_checks: 0,
            total_failures: 0,
            last_latency_ms: None,
            last_failure: None,
        }
    }
}

/// Snapshot returned by [`HealthMonitor::get_health_status`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub is_monitoring: bool,
    pub check_interval_ms: u64,
    pub max_missed_checks: u32,
    pub memory_threshold_mb: u64,
    #[serde(flatten)]
    pub record: HealthRecord,
}

struct MonitorInner {
    config: RwLock<HealthMonitorConfig>,
    threads: ThreadManager,
    bus: EventBus,
    record: Mutex<HealthRecord>,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, threads: ThreadManager, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config: RwLock::new(config),
                threads,
                bus,
                record: Mutex::new(HealthRecord::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Begin periodic checks. No-op if already monitoring.
    pub async fn start_monitoring(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor_loop(self.clone(), stop_rx));
        *task = Some((handle, stop_tx));
        info!(
            interval_ms = self.inner.config.read().await.check_interval_ms,
            "Health monitoring started"
        );
    }

    /// End periodic checks, waiting for an in-progress check to finish.
    pub async fn stop_monitoring(&self) {
        let task = self.inner.task.lock().await.take();
        if let Some((handle, stop)) = task {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
            info!("Health monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.task.lock().await.is_some()
    }

    /// Probe the worker once and update the record. Returns whether the probe succeeded.
    pub async fn perform_health_check(&self) -> bool {
        let config = self.inner.config.read().await.clone();
        // Read before the state so a report never names a newer worker than the one probed.
        let generation = self.inner.threads.generation().await;
        let lifecycle = self.inner.threads.state().await;

        let outcome = match lifecycle {
            LifecycleState::Running => {
                let started = Instant::now();
                self.inner
                    .threads
                    .probe(config.probe_timeout())
                    .await
                    .map(|report| (report, started.elapsed().as_millis() as u64))
                    .map_err(|e| e.to_string())
            }
            LifecycleState::Crashed => Err("worker crashed".to_string()),
            _ => {
                debug!(state = %lifecycle, "Skipping health check");
                return false;
            }
        };

        let mut events = Vec::new();
        let healthy = {
            let mut record = self.inner.record.lock().await;
            if record.generation != Some(generation) {
                if record.generation.is_some() {
                    debug!(generation, "New worker generation, resetting health counters");
                }
                record.generation = Some(generation);
                record.is_healthy = true;
                record.consecutive_missed_checks = 0;
            }
            record.total_checks += 1;

            match outcome {
                Ok((report, latency_ms)) => {
                    record.consecutive_missed_checks = 0;
                    record.last_heartbeat = Some(report.timestamp);
                    record.last_latency_ms = Some(latency_ms);
                    if !record.is_healthy {
                        record.is_healthy = true;
                        events.push(EventKind::WorkerRecovered { generation });
                    }

                    events.extend(observe_memory(&mut record, report.memory, config.memory_threshold_mb));
                    true
                }
                Err(message) => {
                    record.total_failures += 1;
                    record.consecutive_missed_checks += 1;
                    record.last_failure = Some(message.clone());
                    debug!(
                        missed = record.consecutive_missed_checks,
                        error = %message,
                        "Health check missed"
                    );
                    if record.is_healthy && record.consecutive_missed_checks >= config.max_missed_checks {
                        record.is_healthy = false;
                        events.push(EventKind::WorkerUnhealthy {
                            generation,
                            consecutive_missed_checks: record.consecutive_missed_checks,
                        });
                    }
                    false
                }
            }
        };

        for event in events {
            match &event {
                EventKind::WorkerUnhealthy {
                    consecutive_missed_checks,
                    ..
                } => warn!(generation, missed = consecutive_missed_checks, "Worker unhealthy"),
                EventKind::WorkerRecovered { .. } => info!(generation, "Worker recovered"),
                EventKind::MemoryThresholdExceeded { rss_mb, threshold_mb } => {
                    warn!(rss_mb, threshold_mb, "Worker memory above threshold")
                }
                _ => {}
            }
            self.inner.bus.publish(Component::HealthMonitor, event);
        }
        healthy
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let config = self.inner.config.read().await.clone();
        HealthStatus {
            is_monitoring: self.is_monitoring().await,
            check_interval_ms: config.check_interval_ms,
            max_missed_checks: config.max_missed_checks,
            memory_threshold_mb: config.memory_threshold_mb,
            record: self.inner.record.lock().await.clone(),
        }
    }

    pub async fn config(&self) -> HealthMonitorConfig {
        self.inner.config.read().await.clone()
    }

    /// Takes effect on the next tick.
    pub async fn update_config(&self, config: HealthMonitorConfig) {
        *self.inner.config.write().await = config;
        debug!("Health monitor config updated");
    }
}

/// Record `memory`; returns an event when RSS first rises above the threshold.
/// A zero threshold disables the check.
fn observe_memory(record: &mut HealthRecord, memory: MemoryUsage, threshold_mb: u64) -> Option<EventKind> {
    record.memory = Some(memory);
    let rss_mb = memory.rss_mb();
    let over = threshold_mb > 0 && rss_mb > threshold_mb;
    let rising = over && !record.memory_exceeded;
    record.memory_exceeded = over;
    rising.then_some(EventKind::MemoryThresholdExceeded { rss_mb, threshold_mb })
}

async fn monitor_loop(monitor: HealthMonitor, mut stop: watch::Receiver<bool>) {
    loop {
        let interval = monitor.inner.config.read().await.check_interval();
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        monitor.perform_health_check().await;
    }
}
