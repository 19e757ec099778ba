//! Configuration sections and their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warden_core::{Result, WardenError};

/// Default time to wait for the worker to report readiness.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5_000;

/// Default grace period for a graceful worker shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Default deadline for messages that do not carry their own timeout.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 30_000;

/// Default health check interval.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5_000;

/// Default heartbeat probe timeout; kept well below message timeouts.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1_000;

/// Default number of missed checks before the worker is unhealthy.
pub const DEFAULT_MAX_MISSED_CHECKS: u32 = 3;

/// Default resident memory threshold in MB.
pub const DEFAULT_MEMORY_THRESHOLD_MB: u64 = 512;

/// Default restart attempts before the circuit breaker opens.
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Default error history capacity.
pub const DEFAULT_MAX_ERROR_HISTORY: usize = 1_000;

/// Default message queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
    pub thread_manager: ThreadManagerConfig,
    pub health_monitor: HealthMonitorConfig,
    pub restart_manager: RestartManagerConfig,
    pub error_handler: ErrorHandlerConfig,
    pub message_queue: MessageQueueConfig,
}

impl WardenConfig {
    /// Load configuration from a YAML file, or defaults when `path` is `None`.
    ///
    /// An explicit path that does not exist is an error; the loaded config is
    /// validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            debug!("No config path given, using defaults");
            return Ok(Self::default());
        };

        if !path.exists() {
            return Err(WardenError::config_not_found(path));
        }

        let content = std::fs::read_to_string(path).map_err(|e| WardenError::ConfigNotFound {
            path: path.to_path_buf(),
            source: Some(e),
        })?;

        let config = Self::from_yaml(&content).map_err(|message| WardenError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        })?;

        let report = crate::manager::ConfigManager::validate(&config);
        if !report.is_valid {
            return Err(WardenError::ConfigValidation {
                errors: report.errors,
            });
        }

        info!(path = %path.display(), warnings = report.warnings.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }
}

/// Worker lifecycle and messaging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThreadManagerConfig {
    /// Time to wait for the worker's readiness message
    pub startup_timeout_ms: u64,
    /// Grace period for graceful shutdown before forced termination
    pub shutdown_grace_ms: u64,
    /// Deadline applied to envelopes without their own timeout (0 = none)
    pub default_message_timeout_ms: u64,
    /// Maximum number of in-flight messages
    pub max_pending_messages: usize,
}

impl Default for ThreadManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            default_message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            max_pending_messages: 1_000,
        }
    }
}

impl ThreadManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Default message timeout, `None` when disabled.
    pub fn default_message_timeout(&self) -> Option<Duration> {
        (self.default_message_timeout_ms > 0)
            .then(|| Duration::from_millis(self.default_message_timeout_ms))
    }
}

/// Health monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthMonitorConfig {
    /// Enable periodic checks when the service starts
    pub enabled: bool,
    /// Interval between checks
    pub check_interval_ms: u64,
    /// Timeout for a single heartbeat probe
    pub probe_timeout_ms: u64,
    /// Consecutive missed checks before the worker is unhealthy
    pub max_missed_checks: u32,
    /// Resident memory threshold in MB (0 = no limit)
    pub memory_threshold_mb: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            max_missed_checks: DEFAULT_MAX_MISSED_CHECKS,
            memory_threshold_mb: DEFAULT_MEMORY_THRESHOLD_MB,
        }
    }
}

impl HealthMonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Restart policy and circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartManagerConfig {
    /// React automatically to unhealthy/crash signals
    pub auto_restart: bool,
    /// Consecutive failed restarts within the window before the breaker opens
    pub max_restart_attempts: u32,
    /// Rolling window for counting failed restarts
    pub restart_window_ms: u64,
    /// Time the breaker stays open before allowing a trial restart
    pub cooldown_ms: u64,
    /// Cooldown growth after a failed half-open trial
    pub cooldown_multiplier: f64,
    /// Upper bound for the grown cooldown
    pub max_cooldown_ms: u64,
    /// First delay between consecutive restart attempts
    pub backoff_initial_ms: u64,
    /// Upper bound for the restart delay
    pub backoff_max_ms: u64,
    /// Restart delay growth per attempt
    pub backoff_multiplier: f64,
    /// Healthy period after which the attempt count resets
    pub healthy_reset_ms: u64,
}

impl Default for RestartManagerConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_window_ms: 300_000,
            cooldown_ms: 60_000,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 600_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            healthy_reset_ms: 120_000,
        }
    }
}

impl RestartManagerConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn healthy_reset(&self) -> Duration {
        Duration::from_millis(self.healthy_reset_ms)
    }
}

/// Error history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorHandlerConfig {
    /// Maximum records kept; oldest evicted first
    pub max_history: usize,
    /// Window used for the error rate
    pub rate_window_ms: u64,
    /// Number of records returned as `recent_errors` in stats
    pub recent_errors: usize,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_ERROR_HISTORY,
            rate_window_ms: 60_000,
            recent_errors: 10,
        }
    }
}

impl ErrorHandlerConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

/// Outbound message queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessageQueueConfig {
    /// Route façade sends through the queue
    pub enabled: bool,
    /// Maximum buffered messages
    pub capacity: usize,
    /// Messages dispatched to the worker concurrently
    pub max_concurrent: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.thread_manager.startup_timeout_ms, DEFAULT_STARTUP_TIMEOUT_MS);
        assert_eq!(config.health_monitor.max_missed_checks, 3);
        assert_eq!(config.restart_manager.max_restart_attempts, 3);
        assert!(config.message_queue.enabled);
    }

    #[test]
    fn test_load_none_gives_defaults() {
        let config = WardenConfig::load(None).unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "health_monitor:\n  check_interval_ms: 250\nmessage_queue:\n  capacity: 8"
        )
        .unwrap();

        let config = WardenConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.health_monitor.check_interval_ms, 250);
        assert_eq!(config.health_monitor.probe_timeout_ms, DEFAULT_PROBE_TIMEOUT_MS);
        assert_eq!(config.message_queue.capacity, 8);
    }

    #[test]
    fn test_load_missing_file() {
        let err = WardenConfig::load(Some(Path::new("/nonexistent/warden.yaml"))).unwrap_err();
        assert_eq!(err.kind(), warden_core::ErrorKind::Configuration);
        assert!(err.guidance().is_some());
        assert!(matches!(err, WardenError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_unknown_field_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "thread_manager:\n  startup_timeout: 10").unwrap();

        let err = WardenConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, WardenError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_load_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "message_queue:\n  capacity: 0").unwrap();

        let err = WardenConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, WardenError::ConfigValidation { .. }));
    }

    #[test]
    fn test_default_message_timeout_disabled() {
        let config = ThreadManagerConfig {
            default_message_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.default_message_timeout().is_none());
    }
}
