//! Configuration management for Voltaic
//!
//! This module handles loading, validation, and management of the runtime
//! configuration from YAML files. Every section falls back to its defaults,
//! so a partial document is enough to describe a small installation.

use crate::error::{Result, VoltaicError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control cycle period in milliseconds
    pub cycle_time_ms: u64,

    /// Modbus TCP bridges (one per physical bus / gateway)
    pub bridges: Vec<BridgeConfig>,

    /// Supervised devices
    pub devices: Vec<DeviceConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,
}

/// Modbus TCP bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub id: String,

    /// IP address of the gateway or device
    pub ip: String,

    /// TCP port (typically 502)
    pub port: u16,

    pub connect_timeout_ms: u64,

    pub io_timeout_ms: u64,

    /// Attempts per request before the task is marked failed
    pub max_retries: u32,

    pub retry_delay_ms: u64,

    /// Upper bound of registers covered by one read task
    pub max_registers_per_task: u16,

    /// Low priority read tasks serviced per cycle
    pub low_priority_tasks_per_cycle: usize,
}

/// Supported device drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    BydC130,
    Bmw,
    Refu88k,
}

/// Operator override of the supervisory state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    /// Run the state machine
    #[default]
    Default,
    /// Keep issuing start
    On,
    /// Keep issuing stop
    Off,
}

/// One supervised device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,

    pub kind: DeviceKind,

    /// Bridge the device is reached through
    pub bridge_id: String,

    /// Modbus unit id
    pub unit_id: u8,

    pub enabled: bool,

    pub battery_state: BatteryState,

    pub state_machine: StateMachineConfig,

    /// Consecutive failed cycles before CommunicationFailed is raised
    pub communication_failure_cycles: u32,

    pub shutdown: ShutdownConfig,
}

/// Timing of the supervisory state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Cool-down after a recovery action
    pub error_delay_seconds: u64,

    /// Time a start attempt may take before it is aborted
    pub max_start_time_seconds: u64,

    /// Failed starts before backing off
    pub max_start_attempts: u32,

    /// Back-off after `max_start_attempts` failed starts
    pub start_unsuccessful_delay_seconds: u64,

    /// How long an ambiguous device condition is tolerated
    pub pending_tolerance_seconds: u64,
}

/// Battery-off bypass driven by the inverter condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub enabled: bool,

    /// Inverter device whose standby state gates the contactor opening
    pub inverter_id: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level
    pub level: String,

    /// Console level override
    pub console_level: Option<String>,

    /// File level override
    pub file_level: Option<String>,

    /// Log file (or directory) path
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Enable console output
    pub console_output: bool,

    /// Emit JSON lines
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "voltaic.yaml",
            "/data/voltaic.yaml",
            "/etc/voltaic/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn bridge(&self, id: &str) -> Option<&BridgeConfig> {
        self.bridges.iter().find(|b| b.id == id)
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cycle_time_ms == 0 {
            return Err(VoltaicError::validation(
                "cycle_time_ms",
                "Must be greater than 0",
            ));
        }

        let mut bridge_ids = HashSet::new();
        for bridge in &self.bridges {
            bridge.validate()?;
            if !bridge_ids.insert(bridge.id.as_str()) {
                return Err(VoltaicError::validation(
                    "bridges.id".to_string(),
                    format!("Duplicate bridge id '{}'", bridge.id),
                ));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(VoltaicError::validation("devices.id", "Id cannot be empty"));
            }
            if !device_ids.insert(device.id.as_str()) {
                return Err(VoltaicError::validation(
                    "devices.id".to_string(),
                    format!("Duplicate device id '{}'", device.id),
                ));
            }
            if !bridge_ids.contains(device.bridge_id.as_str()) {
                return Err(VoltaicError::validation(
                    format!("devices.{}.bridge_id", device.id),
                    format!("Unknown bridge '{}'", device.bridge_id),
                ));
            }
            if device.state_machine.max_start_attempts == 0 {
                return Err(VoltaicError::validation(
                    format!("devices.{}.state_machine.max_start_attempts", device.id),
                    "Must be at least 1".to_string(),
                ));
            }
        }

        for device in &self.devices {
            if let Some(inverter_id) = &device.shutdown.inverter_id {
                match self.device(inverter_id) {
                    Some(inverter) if inverter.kind == DeviceKind::Refu88k => {
                        if device.enabled && !inverter.enabled {
                            return Err(VoltaicError::validation(
                                format!("devices.{}.shutdown.inverter_id", device.id),
                                format!("Inverter '{}' is disabled", inverter_id),
                            ));
                        }
                    }
                    Some(_) => {
                        return Err(VoltaicError::validation(
                            format!("devices.{}.shutdown.inverter_id", device.id),
                            format!("Device '{}' is not an inverter", inverter_id),
                        ));
                    }
                    None => {
                        return Err(VoltaicError::validation(
                            format!("devices.{}.shutdown.inverter_id", device.id),
                            format!("Unknown device '{}'", inverter_id),
                        ));
                    }
                }
            } else if device.shutdown.enabled {
                return Err(VoltaicError::validation(
                    format!("devices.{}.shutdown.inverter_id", device.id),
                    "Required when shutdown is enabled".to_string(),
                ));
            }
        }

        if self.web.port == 0 {
            return Err(VoltaicError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl BridgeConfig {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(VoltaicError::validation("bridges.id", "Id cannot be empty"));
        }
        if self.ip.is_empty() {
            return Err(VoltaicError::validation(
                format!("bridges.{}.ip", self.id),
                "IP address cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(VoltaicError::validation(
                format!("bridges.{}.port", self.id),
                "Port must be greater than 0".to_string(),
            ));
        }
        if !(1..=125).contains(&self.max_registers_per_task) {
            return Err(VoltaicError::validation(
                format!("bridges.{}.max_registers_per_task", self.id),
                "Must be between 1 and 125".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(VoltaicError::validation(
                format!("bridges.{}.max_retries", self.id),
                "Must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
