//! Configuration management for Warden.
//!
//! The configuration is one explicit [`WardenConfig`] value built at process
//! entry and handed to every component constructor. It has five independently
//! updatable sections:
//!
//! ```yaml
//! thread_manager:
//!   startup_timeout_ms: 5000
//! health_monitor:
//!   check_interval_ms: 5000
//!   max_missed_checks: 3
//! restart_manager:
//!   max_restart_attempts: 3
//! error_handler:
//!   max_history: 1000
//! message_queue:
//!   capacity: 1000
//! ```
//!
//! Runtime updates go through [`ConfigManager`], which validates the merged
//! result and commits it only when valid, so an update is never partially
//! applied.

pub mod manager;
pub mod sections;

pub use manager::{ConfigManager, ConfigSection, ValidationReport};
pub use sections::{
    ErrorHandlerConfig, HealthMonitorConfig, MessageQueueConfig, RestartManagerConfig,
    ThreadManagerConfig, WardenConfig,
};
