//! Simulated Modbus data collector.
//!
//! [`ModbusCollector`] is the stock [`WorkerBackend`]: it exposes the
//! collector's actions (`start`, `stop`, `get_status`, `read`, `statistics`,
//! `test_connections`) and produces randomized register readings in place of
//! real device I/O.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};
use warden_core::types::{Timestamp, now};

use crate::dispatcher::{ActionHandler, HandlerError, WorkerBackend};

/// Largest register count a single Modbus read may request.
pub const MAX_READ_COUNT: u16 = 125;

/// A Modbus TCP device the collector polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, unit_id: u8) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: 502,
            unit_id,
        }
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    collecting: bool,
    started_at: Option<Timestamp>,
    reads: u64,
    registers_read: u64,
    failed_reads: u64,
    last_read: Option<Timestamp>,
    last_values: HashMap<String, Vec<u16>>,
}

/// Simulated collector backend.
#[derive(Debug, Clone)]
pub struct ModbusCollector {
    devices: Arc<Vec<DeviceConfig>>,
    state: Arc<Mutex<CollectorState>>,
}

impl ModbusCollector {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        Self {
            devices: Arc::new(devices),
            state: Arc::new(Mutex::new(CollectorState::default())),
        }
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }
}

impl Default for ModbusCollector {
    fn default() -> Self {
        Self::new(vec![
            DeviceConfig::new("meter-1", "192.168.10.21", 1),
            DeviceConfig::new("meter-2", "192.168.10.22", 2),
        ])
    }
}

#[async_trait]
impl WorkerBackend for ModbusCollector {
    fn name(&self) -> &str {
        "modbus-collector"
    }

    async fn initialize(&self) -> Result<(), HandlerError> {
        if self.devices.is_empty() {
            return Err(HandlerError::failed("no Modbus devices configured"));
        }
        *self.state.lock().await = CollectorState::default();
        info!(devices = self.devices.len(), "Modbus collector initialized");
        Ok(())
    }

    fn handlers(&self) -> Vec<Arc<dyn ActionHandler>> {
        CollectorAction::ALL
            .into_iter()
            .map(|action| {
                Arc::new(CollectorHandler {
                    action,
                    collector: self.clone(),
                }) as Arc<dyn ActionHandler>
            })
            .collect()
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.collecting = false;
        state.last_values.clear();
        debug!("Modbus collector released");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorAction {
    Start,
    Stop,
    GetStatus,
    Read,
    Statistics,
    TestConnections,
}

impl CollectorAction {
    const ALL: [CollectorAction; 6] = [
        Self::Start,
        Self::Stop,
        Self::GetStatus,
        Self::Read,
        Self::Statistics,
        Self::TestConnections,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetStatus => "get_status",
            Self::Read => "read",
            Self::Statistics => "statistics",
            Self::TestConnections => "test_connections",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Start => "Begin periodic collection",
            Self::Stop => "Stop periodic collection",
            Self::GetStatus => "Report collector state",
            Self::Read => "Read holding registers from a device",
            Self::Statistics => "Report read counters",
            Self::TestConnections => "Check reachability of every device",
        }
    }
}

struct CollectorHandler {
    action: CollectorAction,
    collector: ModbusCollector,
}

/// Parameters of the `read` action.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadParams {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    address: u16,
    #[serde(default = "default_count")]
    count: u16,
}

fn default_count() -> u16 {
    10
}

impl CollectorHandler {
    async fn start(&self) -> Value {
        let mut state = self.collector.state.lock().await;
        let already = state.collecting;
        if !already {
            state.collecting = true;
            state.started_at = Some(now());
        }
        json!({ "collecting": true, "already_running": already, "devices": self.collector.devices.len() })
    }

    async fn stop(&self) -> Value {
        let mut state = self.collector.state.lock().await;
        let was = state.collecting;
        state.collecting = false;
        json!({ "collecting": false, "was_running": was })
    }

    async fn status(&self) -> Value {
        let state = self.collector.state.lock().await;
        json!({
            "is_running": true,
            "collecting": state.collecting,
            "started_at": state.started_at,
            "devices": self.collector.devices.iter().map(|d| &d.id).collect::<Vec<_>>(),
        })
    }

    async fn read(&self, params: Value) -> Result<Value, HandlerError> {
        let params: ReadParams = if params.is_null() {
            serde_json::from_value(json!({}))
        } else {
            serde_json::from_value(params)
        }
        .map_err(|e| HandlerError::invalid_params(e.to_string()))?;

        if params.count == 0 || params.count > MAX_READ_COUNT {
            return Err(HandlerError::invalid_params(format!(
                "count must be between 1 and {MAX_READ_COUNT}, got {}",
                params.count
            )));
        }

        let devices: Vec<&DeviceConfig> = match &params.device_id {
            Some(id) => {
                let device = self.collector.devices.iter().find(|d| &d.id == id);
                let Some(device) = device else {
                    self.collector.state.lock().await.failed_reads += 1;
                    return Err(HandlerError::failed(format!("unknown device: {id}")));
                };
                vec![device]
            }
            None => self.collector.devices.iter().collect(),
        };

        let readings: Vec<(String, Vec<u16>)> = {
            let mut rng = rand::rng();
            devices
                .iter()
                .map(|d| {
                    let values = (0..params.count).map(|_| rng.random_range(0..=u16::MAX)).collect();
                    (d.id.clone(), values)
                })
                .collect()
        };

        let timestamp = now();
        let mut state = self.collector.state.lock().await;
        state.reads += 1;
        state.last_read = Some(timestamp);
        let mut result = serde_json::Map::new();
        for (id, values) in readings {
            state.registers_read += values.len() as u64;
            result.insert(id.clone(), json!({ "address": params.address, "values": values }));
            state.last_values.insert(id, values);
        }

        Ok(json!({ "timestamp": timestamp, "readings": result }))
    }

    async fn statistics(&self) -> Value {
        let state = self.collector.state.lock().await;
        json!({
            "reads": state.reads,
            "registers_read": state.registers_read,
            "failed_reads": state.failed_reads,
            "last_read": state.last_read,
            "collecting": state.collecting,
        })
    }

    fn test_connections(&self) -> Value {
        let mut rng = rand::rng();
        let results: Vec<Value> = self
            .collector
            .devices
            .iter()
            .map(|d| {
                json!({
                    "device_id": d.id,
                    "endpoint": format!("{}:{}", d.host, d.port),
                    "unit_id": d.unit_id,
                    "reachable": true,
                    "latency_ms": rng.random_range(1..=20u64),
                })
            })
            .collect();
        json!({ "devices": results })
    }
}

#[async_trait]
impl ActionHandler for CollectorHandler {
    fn name(&self) -> &str {
        self.action.name()
    }

    fn description(&self) -> &str {
        self.action.description()
    }

    async fn execute(&self, params: Value) -> Result<Value, HandlerError> {
        match self.action {
            CollectorAction::Start => Ok(self.start().await),
            CollectorAction::Stop => Ok(self.stop().await),
            CollectorAction::GetStatus => Ok(self.status().await),
            CollectorAction::Read => self.read(params).await,
            CollectorAction::Statistics => Ok(self.statistics().await),
            CollectorAction::TestConnections => Ok(self.test_connections()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CommandDispatcher;
    use warden_core::error::codes;

    async fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::initialize(Box::new(ModbusCollector::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_registry() {
        let actions = dispatcher().await.actions().await;
        assert_eq!(
            actions,
            vec!["get_status", "read", "start", "statistics", "stop", "test_connections"]
        );
    }

    #[tokio::test]
    async fn test_status_reports_running() {
        let status = dispatcher().await.handle("get_status", Value::Null).await.unwrap();
        assert_eq!(status["is_running"], json!(true));
        assert_eq!(status["collecting"], json!(false));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let d = dispatcher().await;
        let started = d.handle("start", Value::Null).await.unwrap();
        assert_eq!(started["already_running"], json!(false));
        let again = d.handle("start", Value::Null).await.unwrap();
        assert_eq!(again["already_running"], json!(true));

        let stopped = d.handle("stop", Value::Null).await.unwrap();
        assert_eq!(stopped["was_running"], json!(true));
    }

    #[tokio::test]
    async fn test_read_and_statistics() {
        let d = dispatcher().await;
        let reading = d
            .handle("read", json!({ "device_id": "meter-1", "count": 4 }))
            .await
            .unwrap();
        assert_eq!(reading["readings"]["meter-1"]["values"].as_array().unwrap().len(), 4);

        let stats = d.handle("statistics", Value::Null).await.unwrap();
        assert_eq!(stats["reads"], json!(1));
        assert_eq!(stats["registers_read"], json!(4));
    }

    #[tokio::test]
    async fn test_read_all_devices_by_default() {
        let reading = dispatcher().await.handle("read", Value::Null).await.unwrap();
        let readings = reading["readings"].as_object().unwrap();
        assert_eq!(readings.len(), 2);
    }

    #[tokio::test]
    async fn test_read_rejects_bad_count() {
        let err = dispatcher()
            .await
            .handle("read", json!({ "count": 500 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert_eq!(err.action, "read");
    }

    #[tokio::test]
    async fn test_read_unknown_device() {
        let d = dispatcher().await;
        let err = d.handle("read", json!({ "device_id": "meter-9" })).await.unwrap_err();
        assert_eq!(err.code, codes::HANDLER_ERROR);
        assert!(err.message.contains("meter-9"));

        let stats = d.handle("statistics", Value::Null).await.unwrap();
        assert_eq!(stats["failed_reads"], json!(1));
    }

    #[tokio::test]
    async fn test_connections_cover_every_device() {
        let result = dispatcher().await.handle("test_connections", Value::Null).await.unwrap();
        assert_eq!(result["devices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_devices_fails_init() {
        let err = CommandDispatcher::initialize(Box::new(ModbusCollector::new(Vec::new())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no Modbus devices"));
    }
}
