use super::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_time_ms: 1000,
            bridges: vec![BridgeConfig::default()],
            devices: Vec::new(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            id: "modbus0".to_string(),
            ip: "192.168.1.100".to_string(),
            port: 502,
            connect_timeout_ms: 5000,
            io_timeout_ms: 2000,
            max_retries: 3,
            retry_delay_ms: 500,
            max_registers_per_task: 125,
            low_priority_tasks_per_cycle: 1,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: DeviceKind::BydC130,
            bridge_id: "modbus0".to_string(),
            unit_id: 1,
            enabled: true,
            battery_state: BatteryState::Default,
            state_machine: StateMachineConfig::default(),
            communication_failure_cycles: 3,
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            error_delay_seconds: 600,
            max_start_time_seconds: 30,
            max_start_attempts: 5,
            start_unsuccessful_delay_seconds: 3600,
            pending_tolerance_seconds: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/voltaic.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}
