use crate::peripherals::stock::MAX_SENSORS;
use crate::watchdog::TaskId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("hardware timeout {timeout_ms} ms must exceed 1.5x refresh interval {refresh_ms} ms")]
    InsufficientMargin { timeout_ms: u32, refresh_ms: u32 },
    #[error("{task:?} max interval {interval_ms} ms is not below hardware timeout {timeout_ms} ms")]
    TaskIntervalTooLong { task: TaskId, interval_ms: u32, timeout_ms: u32 },
    #[error("bus capacity must be at least 1")]
    ZeroBusCapacity,
    #[error("{count} stock sensors configured, at most {max} supported")]
    TooManySensors { count: usize, max: usize },
    #[error("machine id must be 1..=31 characters")]
    InvalidMachineId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineConfig {
    pub machine_id: String,
    pub reset_marker_path: String,
    pub bus: BusConfig,
    pub orchestrator: OrchestratorConfig,
    pub watchdog: WatchdogConfig,
    pub link: LinkConfig,
    pub motor: MotorConfig,
    pub stock: StockConfig,
    pub supervision: SupervisionConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            machine_id: "VM-0001".into(),
            reset_marker_path: "vendbus.reset".into(),
            bus: BusConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            watchdog: WatchdogConfig::default(),
            link: LinkConfig::default(),
            motor: MotorConfig::default(),
            stock: StockConfig::default(),
            supervision: SupervisionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: crate::bus::DEFAULT_BUS_CAPACITY }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub receive_timeout_ms: u64,
    pub message_hold_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { receive_timeout_ms: 1000, message_hold_ms: 3000 }
    }
}

impl OrchestratorConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn message_hold(&self) -> Duration {
        Duration::from_millis(self.message_hold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskIntervals {
    pub orchestrator_ms: u32,
    pub keypad_ms: u32,
    pub display_ms: u32,
    pub network_link_ms: u32,
    pub motor_ms: u32,
    pub stock_sensor_ms: u32,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            orchestrator_ms: 2000,
            keypad_ms: 3000,
            display_ms: 5000,
            network_link_ms: 4000,
            motor_ms: 10_000,
            stock_sensor_ms: 8000,
        }
    }
}

impl TaskIntervals {
    pub fn max_interval(&self, task: TaskId) -> u32 {
        match task {
            TaskId::Orchestrator => self.orchestrator_ms,
            TaskId::Keypad => self.keypad_ms,
            TaskId::Display => self.display_ms,
            TaskId::NetworkLink => self.network_link_ms,
            TaskId::Motor => self.motor_ms,
            TaskId::StockSensor => self.stock_sensor_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub hardware_timeout_ms: u32,
    pub refresh_interval_ms: u32,
    pub startup_delay_ms: u32,
    pub status_every_cycles: u32,
    pub tasks: TaskIntervals,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            hardware_timeout_ms: 3000,
            refresh_interval_ms: 1500,
            startup_delay_ms: 2000,
            status_every_cycles: 20,
            tasks: TaskIntervals::default(),
        }
    }
}

impl WatchdogConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.refresh_interval_ms))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.startup_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub bind_addr: String,
    pub inter_byte_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8080".into(), inter_byte_timeout_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    pub queue_len: usize,
    pub run_time_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self { queue_len: 10, run_time_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StockConfig {
    pub sensor_count: usize,
    pub threshold_mm: u8,
    pub poll_interval_ms: u64,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self { sensor_count: 5, threshold_mm: 170, poll_interval_ms: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisionConfig {
    pub cooldown_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self { cooldown_ms: 30_000 }
    }
}

impl MachineConfig {
    /// Loads and validates a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: MachineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let wd = &self.watchdog;
        // timeout > 1.5 x refresh, in integer arithmetic
        if u64::from(wd.hardware_timeout_ms) * 2 <= u64::from(wd.refresh_interval_ms) * 3 {
            return Err(ConfigError::InsufficientMargin {
                timeout_ms: wd.hardware_timeout_ms,
                refresh_ms: wd.refresh_interval_ms,
            });
        }
        if wd.tasks.orchestrator_ms >= wd.hardware_timeout_ms {
            return Err(ConfigError::TaskIntervalTooLong {
                task: TaskId::Orchestrator,
                interval_ms: wd.tasks.orchestrator_ms,
                timeout_ms: wd.hardware_timeout_ms,
            });
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::ZeroBusCapacity);
        }
        if self.stock.sensor_count > MAX_SENSORS {
            return Err(ConfigError::TooManySensors {
                count: self.stock.sensor_count,
                max: MAX_SENSORS,
            });
        }
        if self.machine_id.is_empty() || self.machine_id.len() > crate::event::MAX_ID_LEN {
            return Err(ConfigError::InvalidMachineId);
        }
        Ok(())
    }
}
