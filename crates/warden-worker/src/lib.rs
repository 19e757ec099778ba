//! Worker supervision for Warden.
//!
//! This crate runs a background worker on its own OS thread and supervises it
//! from the caller's tokio runtime.
//!
//! # Overview
//!
//! The worker executes named actions through a [`CommandDispatcher`] built
//! from an injected [`WorkerBackend`]. Around it, the supervisor side provides:
//!
//! - [`ThreadManager`]: lifecycle, request/response matching, timeouts
//! - [`HealthMonitor`]: periodic heartbeat probes and memory checks
//! - [`RestartManager`]: automatic restarts behind a circuit breaker
//! - [`ErrorHandler`]: bounded error history with rate statistics
//! - [`MessageQueue`]: priority buffering in front of the worker
//!
//! [`ThreadingService`] composes all of them and is the only type most callers
//! need.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ThreadingService                │
//! │  queue ─▶ thread manager ◀─ health, restart  │
//! └──────────────────────┬───────────────────────┘
//!                        │ WorkerCommand / WorkerReply
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │   worker thread (current-thread runtime)     │
//! │   CommandDispatcher ─▶ WorkerBackend         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every component publishes onto one [`EventBus`]; subscribe through
//! [`ThreadingService::subscribe`].
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use warden_config::WardenConfig;
//! use warden_worker::{SendOptions, ThreadingService};
//!
//! #[tokio::main]
//! async fn main() -> warden_core::Result<()> {
//!     let service = ThreadingService::with_collector(WardenConfig::default());
//!     let started = service.start().await;
//!     assert!(started.success, "{}", started.message);
//!
//!     let response = service
//!         .send_message(SendOptions::new("read", json!({ "device_id": "meter-1" })).with_priority("high"))
//!         .await?;
//!     println!("{:?}", response.data);
//!
//!     service.stop(true).await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod dispatcher;
pub mod error_handler;
pub mod events;
pub mod health;
pub mod protocol;
pub mod queue;
pub mod restart;
pub mod service;
pub mod thread_manager;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use collector::{DeviceConfig, ModbusCollector};
pub use dispatcher::{ActionHandler, CommandDispatcher, HandlerError, WorkerBackend};
pub use error_handler::{ErrorHandler, ErrorQuery, ErrorRecord, ErrorStats};
pub use events::{EventBus, EventKind, ServiceEvent};
pub use health::{HealthMonitor, HealthRecord, HealthStatus};
pub use protocol::{Envelope, HeartbeatReport, MemoryUsage, ResponseError, WorkerResponse};
pub use queue::{MessageQueue, QueueStats};
pub use restart::{BreakerState, RestartManager, RestartStats};
pub use service::{SendOptions, ServiceResult, ServiceStats, ServiceStatus, ThreadingService};
pub use thread_manager::{BackendFactory, MessageStats, PendingMessageInfo, ThreadManager, WorkerStatus};
