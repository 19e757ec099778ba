//! Shared type definitions used across Warden crates.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Message priority levels.
///
/// Ordering follows urgency: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, first to be evicted
    Low,
    /// Standard requests
    #[default]
    Normal,
    /// Interactive requests
    High,
    /// Must be delivered; never evicted while lower entries remain
    Critical,
}

impl Priority {
    /// All priorities from most to least urgent.
    pub const DESCENDING: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Index into per-priority tables (0 = Low).
    pub fn index(&self) -> usize {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(WardenError::InvalidPriority { value: s.to_string() }),
        }
    }
}

/// Lifecycle state of the worker thread.
///
/// Owned by the thread manager; every other component only reads snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No worker thread
    #[default]
    Stopped,
    /// Thread spawned, waiting for readiness
    Starting,
    /// Accepting commands
    Running,
    /// Shutdown requested
    Stopping,
    /// Exited unexpectedly
    Crashed,
}

impl LifecycleState {
    /// Returns true if the worker accepts commands.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if a worker thread may currently exist.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Supervisor component that produced an event or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ThreadManager,
    Worker,
    HealthMonitor,
    RestartManager,
    ErrorHandler,
    MessageQueue,
    Service,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThreadManager => write!(f, "thread_manager"),
            Self::Worker => write!(f, "worker"),
            Self::HealthMonitor => write!(f, "health_monitor"),
            Self::RestartManager => write!(f, "restart_manager"),
            Self::ErrorHandler => write!(f, "error_handler"),
            Self::MessageQueue => write!(f, "message_queue"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Timestamp type used throughout Warden.
pub type Timestamp = DateTime<Utc>;

/// Get the current UTC timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}
