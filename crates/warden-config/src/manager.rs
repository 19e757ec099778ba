//! Validation and atomic runtime updates.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use warden_core::WardenError;

use crate::sections::WardenConfig;

/// Named configuration section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSection {
    ThreadManager,
    HealthMonitor,
    RestartManager,
    ErrorHandler,
    MessageQueue,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 5] = [
        Self::ThreadManager,
        Self::HealthMonitor,
        Self::RestartManager,
        Self::ErrorHandler,
        Self::MessageQueue,
    ];

    /// Key of this section in the serialized config.
    pub fn key(&self) -> &'static str {
        match self {
            Self::ThreadManager => "thread_manager",
            Self::HealthMonitor => "health_monitor",
            Self::RestartManager => "restart_manager",
            Self::ErrorHandler => "error_handler",
            Self::MessageQueue => "message_queue",
        }
    }
}

impl std::fmt::Display for ConfigSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ConfigSection {
    type Err = WardenError;

    /// Accepts both `snake_case` and `camelCase` section names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread_manager" | "threadManager" => Ok(Self::ThreadManager),
            "health_monitor" | "healthMonitor" => Ok(Self::HealthMonitor),
            "restart_manager" | "restartManager" => Ok(Self::RestartManager),
            "error_handler" | "errorHandler" => Ok(Self::ErrorHandler),
            "message_queue" | "messageQueue" => Ok(Self::MessageQueue),
            _ => Err(WardenError::UnknownConfigSection {
                section: s.to_string(),
            }),
        }
    }
}

/// Outcome of validating a config or a config update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self::from_parts(vec![error.into()], Vec::new())
    }
}

/// Holds the live configuration and applies validated updates.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    current: WardenConfig,
}

impl ConfigManager {
    pub fn new(config: WardenConfig) -> Self {
        Self { current: config }
    }

    /// The committed configuration.
    pub fn current(&self) -> &WardenConfig {
        &self.current
    }

    /// Validate a full configuration.
    pub fn validate(config: &WardenConfig) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let tm = &config.thread_manager;
        if tm.startup_timeout_ms == 0 {
            errors.push("thread_manager.startup_timeout_ms must be > 0".to_string());
        }
        if tm.max_pending_messages == 0 {
            errors.push("thread_manager.max_pending_messages must be > 0".to_string());
        }
        if tm.shutdown_grace_ms == 0 {
            warnings.push("thread_manager.shutdown_grace_ms is 0; graceful stops will always force-terminate".to_string());
        }

        let hm = &config.health_monitor;
        if hm.check_interval_ms == 0 {
            errors.push("health_monitor.check_interval_ms must be > 0".to_string());
        }
        if hm.probe_timeout_ms == 0 {
            errors.push("health_monitor.probe_timeout_ms must be > 0".to_string());
        }
        if hm.max_missed_checks == 0 {
            errors.push("health_monitor.max_missed_checks must be >= 1".to_string());
        }
        if hm.probe_timeout_ms >= hm.check_interval_ms && hm.check_interval_ms > 0 {
            warnings.push(format!(
                "health_monitor.probe_timeout_ms ({}) is not below check_interval_ms ({})",
                hm.probe_timeout_ms, hm.check_interval_ms
            ));
        }
        if tm.default_message_timeout_ms > 0 && hm.probe_timeout_ms >= tm.default_message_timeout_ms {
            warnings.push(
                "health_monitor.probe_timeout_ms should be shorter than thread_manager.default_message_timeout_ms"
                    .to_string(),
            );
        }

        let rm = &config.restart_manager;
        if rm.max_restart_attempts == 0 {
            errors.push("restart_manager.max_restart_attempts must be >= 1".to_string());
        }
        if rm.restart_window_ms == 0 {
            errors.push("restart_manager.restart_window_ms must be > 0".to_string());
        }
        if !(rm.cooldown_multiplier.is_finite() && rm.cooldown_multiplier >= 1.0) {
            errors.push("restart_manager.cooldown_multiplier must be >= 1.0".to_string());
        }
        if !(rm.backoff_multiplier.is_finite() && rm.backoff_multiplier >= 1.0) {
            errors.push("restart_manager.backoff_multiplier must be >= 1.0".to_string());
        }
        if rm.cooldown_ms > rm.max_cooldown_ms {
            errors.push(format!(
                "restart_manager.cooldown_ms ({}) exceeds max_cooldown_ms ({})",
                rm.cooldown_ms, rm.max_cooldown_ms
            ));
        }
        if rm.backoff_initial_ms > rm.backoff_max_ms {
            warnings.push(format!(
                "restart_manager.backoff_initial_ms ({}) exceeds backoff_max_ms ({}); the cap wins",
                rm.backoff_initial_ms, rm.backoff_max_ms
            ));
        }

        let eh = &config.error_handler;
        if eh.max_history == 0 {
            errors.push("error_handler.max_history must be > 0".to_string());
        }
        if eh.rate_window_ms == 0 {
            errors.push("error_handler.rate_window_ms must be > 0".to_string());
        }

        let mq = &config.message_queue;
        if mq.capacity == 0 {
            errors.push("message_queue.capacity must be > 0".to_string());
        }
        if mq.max_concurrent == 0 {
            errors.push("message_queue.max_concurrent must be > 0".to_string());
        }
        if mq.max_concurrent > tm.max_pending_messages {
            warnings.push(format!(
                "message_queue.max_concurrent ({}) exceeds thread_manager.max_pending_messages ({})",
                mq.max_concurrent, tm.max_pending_messages
            ));
        }

        ValidationReport::from_parts(errors, warnings)
    }

    /// Merge `patch` into a copy of the current config without committing.
    ///
    /// With `section` set, `patch` holds that section's fields; otherwise its
    /// top-level keys name sections. Returns the merged config only when the
    /// report is valid.
    pub fn preview(
        &self,
        section: Option<ConfigSection>,
        patch: &Value,
    ) -> (ValidationReport, Option<WardenConfig>) {
        let Value::Object(patch) = patch else {
            return (ValidationReport::rejected("config patch must be a JSON object"), None);
        };

        let mut sections = Map::new();
        match section {
            Some(section) => {
                sections.insert(section.key().to_string(), Value::Object(patch.clone()));
            }
            None => {
                for (key, value) in patch {
                    match key.parse::<ConfigSection>() {
                        Ok(section) => {
                            sections.insert(section.key().to_string(), value.clone());
                        }
                        Err(e) => return (ValidationReport::rejected(e.to_string()), None),
                    }
                }
            }
        }

        let mut merged = match serde_json::to_value(&self.current) {
            Ok(value) => value,
            Err(e) => {
                return (
                    ValidationReport::rejected(format!("failed to serialize current config: {e}")),
                    None,
                );
            }
        };
        merge(&mut merged, &Value::Object(sections));

        let candidate: WardenConfig = match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(e) => return (ValidationReport::rejected(e.to_string()), None),
        };

        let report = Self::validate(&candidate);
        let candidate = report.is_valid.then_some(candidate);
        (report, candidate)
    }

    /// Validate and commit an update. Nothing is applied when the report is invalid.
    pub fn apply_patch(&mut self, section: Option<ConfigSection>, patch: &Value) -> ValidationReport {
        let (report, candidate) = self.preview(section, patch);
        match candidate {
            Some(config) => {
                self.current = config;
                info!(
                    section = section.map(|s| s.key()).unwrap_or("*"),
                    warnings = report.warnings.len(),
                    "Configuration updated"
                );
            }
            None => {
                warn!(errors = ?report.errors, "Configuration update rejected");
            }
        }
        report
    }

    /// Replace the committed config after validating it.
    pub fn replace(&mut self, config: WardenConfig) -> ValidationReport {
        let report = Self::validate(&config);
        if report.is_valid {
            self.current = config;
            debug!("Configuration replaced");
        }
        report
    }
}

/// Deep-merge `patch` into `target`; objects merge by key, everything else replaces.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_names() {
        assert_eq!("health_monitor".parse::<ConfigSection>().unwrap(), ConfigSection::HealthMonitor);
        assert_eq!("messageQueue".parse::<ConfigSection>().unwrap(), ConfigSection::MessageQueue);
        assert!("metrics".parse::<ConfigSection>().is_err());
        for section in ConfigSection::ALL {
            assert_eq!(section.key().parse::<ConfigSection>().unwrap(), section);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let report = ConfigManager::validate(&WardenConfig::default());
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_apply_section_patch() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(
            Some(ConfigSection::HealthMonitor),
            &json!({ "check_interval_ms": 10_000, "max_missed_checks": 5 }),
        );

        assert!(report.is_valid);
        assert_eq!(manager.current().health_monitor.check_interval_ms, 10_000);
        assert_eq!(manager.current().health_monitor.max_missed_checks, 5);
        // Untouched fields keep their values
        assert_eq!(manager.current().health_monitor.probe_timeout_ms, 1_000);
    }

    #[test]
    fn test_apply_top_level_patch_camel_case() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(None, &json!({ "messageQueue": { "capacity": 42 } }));

        assert!(report.is_valid);
        assert_eq!(manager.current().message_queue.capacity, 42);
    }

    #[test]
    fn test_invalid_patch_is_atomic() {
        let mut manager = ConfigManager::default();
        let before = manager.current().clone();

        let report = manager.apply_patch(
            Some(ConfigSection::HealthMonitor),
            &json!({ "check_interval_ms": 0, "max_missed_checks": 7 }),
        );

        assert!(!report.is_valid);
        assert!(!report.errors.is_empty());
        assert_eq!(manager.current(), &before);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut manager = ConfigManager::default();
        let before = manager.current().clone();

        let report = manager.apply_patch(
            Some(ConfigSection::MessageQueue),
            &json!({ "capacity": "lots", "max_concurrent": 2 }),
        );

        assert!(!report.is_valid);
        assert_eq!(manager.current(), &before);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(Some(ConfigSection::ErrorHandler), &json!({ "max_records": 5 }));
        assert!(!report.is_valid);
    }

    #[test]
    fn test_unknown_section_rejected() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(None, &json!({ "metrics": { "enabled": true } }));
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("metrics"));
    }

    #[test]
    fn test_non_object_patch_rejected() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(None, &json!([1, 2, 3]));
        assert!(!report.is_valid);
    }

    #[test]
    fn test_warnings_do_not_block() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(
            Some(ConfigSection::HealthMonitor),
            &json!({ "check_interval_ms": 500, "probe_timeout_ms": 800 }),
        );

        assert!(report.is_valid);
        assert!(!report.warnings.is_empty());
        assert_eq!(manager.current().health_monitor.probe_timeout_ms, 800);
    }

    #[test]
    fn test_cooldown_bound() {
        let mut manager = ConfigManager::default();
        let report = manager.apply_patch(
            Some(ConfigSection::RestartManager),
            &json!({ "cooldown_ms": 1_000_000, "max_cooldown_ms": 10 }),
        );
        assert!(!report.is_valid);
    }

    #[test]
    fn test_merge_nested() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        merge(&mut target, &json!({ "a": { "b": 10 }, "d": 4 }));
        assert_eq!(target, json!({ "a": { "b": 10, "c": 2 }, "d": 4 }));
    }
}
