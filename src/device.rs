//! Supervised field devices
//!
//! Every device owns its channel set, its register protocol and a health
//! tree. Batteries additionally run the supervisory state machine through
//! [`BatteryCore`], which keeps the per-cycle ordering in one place:
//! read, commit, step, write.

use crate::channel::{AccessMode, Channel, ChannelDoc, ChannelSet, ChannelSpec, OptionsEnum, Unit, Value, ValueType};
use crate::config::{BatteryState, BridgeConfig, DeviceConfig, DeviceKind, StateMachineConfig};
use crate::error::Result;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::protocol::{CycleReport, ModbusProtocol, SharedTransport, TaskScheduler, TaskSummary};
use crate::state_machine::{Command, Observation, State, SupervisoryContext, step};
use crate::thing_state::{ThingState, ThingStateChannels};
use std::sync::Arc;
use std::time::Instant;

pub mod bmw;
pub mod byd_c130;
pub mod refu88k;

pub use bmw::BmwBattery;
pub use byd_c130::BydC130;
pub use refu88k::Refu88k;

pub const SOC: &str = "Soc";
pub const SOH: &str = "Soh";
pub const VOLTAGE: &str = "Voltage";
pub const CURRENT: &str = "Current";
pub const CHARGE_MAX_VOLTAGE: &str = "ChargeMaxVoltage";
pub const DISCHARGE_MIN_VOLTAGE: &str = "DischargeMinVoltage";
pub const CHARGE_MAX_CURRENT: &str = "ChargeMaxCurrent";
pub const DISCHARGE_MAX_CURRENT: &str = "DischargeMaxCurrent";
pub const MIN_CELL_VOLTAGE: &str = "MinCellVoltage";
pub const MAX_CELL_VOLTAGE: &str = "MaxCellVoltage";
pub const MIN_CELL_TEMPERATURE: &str = "MinCellTemperature";
pub const MAX_CELL_TEMPERATURE: &str = "MaxCellTemperature";
pub const READY_FOR_WORKING: &str = "ReadyForWorking";
pub const STATE_MACHINE: &str = "StateMachine";
pub const COMMUNICATION_FAILED: &str = "CommunicationFailed";
pub const STATE: &str = "State";

/// Channels every device carries
pub const COMMON_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::new(
        COMMUNICATION_FAILED,
        ChannelDoc::of(ValueType::Boolean).text("Modbus communication failed"),
    ),
    ChannelSpec::new(STATE, ChannelDoc::enumeration(ThingState::OPTIONS)),
];

/// Channels every battery carries
pub const BATTERY_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::new(SOC, ChannelDoc::of(ValueType::Integer).unit(Unit::Percent)),
    ChannelSpec::new(SOH, ChannelDoc::of(ValueType::Integer).unit(Unit::Percent)),
    ChannelSpec::new(VOLTAGE, ChannelDoc::of(ValueType::Integer).unit(Unit::Volt)),
    ChannelSpec::new(CURRENT, ChannelDoc::of(ValueType::Integer).unit(Unit::Ampere)),
    ChannelSpec::new(CHARGE_MAX_VOLTAGE, ChannelDoc::of(ValueType::Integer).unit(Unit::Volt)),
    ChannelSpec::new(DISCHARGE_MIN_VOLTAGE, ChannelDoc::of(ValueType::Integer).unit(Unit::Volt)),
    ChannelSpec::new(CHARGE_MAX_CURRENT, ChannelDoc::of(ValueType::Integer).unit(Unit::Ampere)),
    ChannelSpec::new(DISCHARGE_MAX_CURRENT, ChannelDoc::of(ValueType::Integer).unit(Unit::Ampere)),
    ChannelSpec::new(MIN_CELL_VOLTAGE, ChannelDoc::of(ValueType::Integer).unit(Unit::Millivolt)),
    ChannelSpec::new(MAX_CELL_VOLTAGE, ChannelDoc::of(ValueType::Integer).unit(Unit::Millivolt)),
    ChannelSpec::new(MIN_CELL_TEMPERATURE, ChannelDoc::of(ValueType::Integer).unit(Unit::DegreeCelsius)),
    ChannelSpec::new(MAX_CELL_TEMPERATURE, ChannelDoc::of(ValueType::Integer).unit(Unit::DegreeCelsius)),
    ChannelSpec::new(
        READY_FOR_WORKING,
        ChannelDoc::of(ValueType::Boolean).text("Battery may be charged or discharged"),
    ),
    ChannelSpec::new(STATE_MACHINE, ChannelDoc::enumeration(State::OPTIONS)),
];

/// A supervised device driven once per control cycle
#[async_trait::async_trait]
pub trait Device: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn channels(&self) -> &Arc<ChannelSet>;

    /// Root of the device's health tree
    fn thing_state(&self) -> &ThingStateChannels;

    /// Supervisory state, for devices that run the state machine
    fn state_machine_state(&self) -> Option<State> {
        None
    }

    fn task_summaries(&self) -> Vec<TaskSummary>;

    /// One control cycle
    async fn tick(&mut self, now: Instant);
}

/// Device specific sensing and actuation used by [`BatteryCore`]
pub trait BatteryControl: Send {
    /// Condition of the battery from this cycle's committed values
    fn observe(&self, channels: &ChannelSet, health: &ThingStateChannels) -> Observation;

    /// Stage the write values that carry out `command`
    fn issue(&mut self, command: Command, channels: &ChannelSet) -> Result<()>;
}

/// Build a device from its configuration
pub fn create_device(
    config: &DeviceConfig,
    bridge: &BridgeConfig,
    transport: SharedTransport,
    inverter: Option<Arc<ChannelSet>>,
) -> Result<Box<dyn Device>> {
    Ok(match config.kind {
        DeviceKind::BydC130 => Box::new(BydC130::new(config, bridge, transport)?),
        DeviceKind::Bmw => Box::new(BmwBattery::new(config, bridge, transport, inverter)?),
        DeviceKind::Refu88k => Box::new(Refu88k::new(config, bridge, transport)?),
    })
}

pub(crate) fn device_logger(config: &DeviceConfig) -> StructuredLogger {
    get_logger_with_context(
        LogContext::new("device")
            .with_device_id(&config.id)
            .with_bridge_id(&config.bridge_id),
    )
}

/// Scheduler for a device, wired to its CommunicationFailed channel
pub(crate) fn build_scheduler(
    config: &DeviceConfig,
    bridge: &BridgeConfig,
    protocol: ModbusProtocol,
    transport: SharedTransport,
    channels: &ChannelSet,
) -> Result<TaskScheduler> {
    let logger = get_logger_with_context(
        LogContext::new("scheduler")
            .with_device_id(&config.id)
            .with_bridge_id(&config.bridge_id),
    );
    Ok(TaskScheduler::new(
        protocol,
        config.unit_id,
        transport,
        bridge.low_priority_tasks_per_cycle,
        logger,
    )
    .with_communication_failed(
        channels.get(COMMUNICATION_FAILED)?,
        config.communication_failure_cycles,
    ))
}

/// Shared plumbing of all supervised batteries
pub struct BatteryCore {
    id: String,
    kind: DeviceKind,
    channels: Arc<ChannelSet>,
    scheduler: TaskScheduler,
    health: ThingStateChannels,
    context: SupervisoryContext,
    config: StateMachineConfig,
    battery_state: BatteryState,
    state_machine: Arc<Channel>,
    ready_for_working: Arc<Channel>,
    logger: StructuredLogger,
}

impl std::fmt::Debug for BatteryCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatteryCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.context.state)
            .finish_non_exhaustive()
    }
}

impl BatteryCore {
    /// Wire a battery whose channel set already holds the standard
    /// battery channels. CommunicationFailed is registered as a warning.
    pub fn new(
        config: &DeviceConfig,
        scheduler: TaskScheduler,
        channels: Arc<ChannelSet>,
        health: ThingStateChannels,
    ) -> Result<Self> {
        health.add_warning_channel(&channels.get(COMMUNICATION_FAILED)?)?;
        let state_machine = channels.get(STATE_MACHINE)?;
        let ready_for_working = channels.get(READY_FOR_WORKING)?;
        let core = Self {
            id: config.id.clone(),
            kind: config.kind,
            channels,
            scheduler,
            health,
            context: SupervisoryContext::default(),
            config: config.state_machine.clone(),
            battery_state: config.battery_state,
            state_machine,
            ready_for_working,
            logger: device_logger(config),
        };
        core.publish(false);
        Ok(core)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub const fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    pub const fn health(&self) -> &ThingStateChannels {
        &self.health
    }

    pub const fn context(&self) -> &SupervisoryContext {
        &self.context
    }

    pub const fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn task_summaries(&self) -> Vec<TaskSummary> {
        self.scheduler.task_summaries()
    }

    /// Read this cycle's tasks and publish everything at once
    pub async fn read_and_commit(&mut self) -> CycleReport {
        let report = self.scheduler.execute_reads().await;
        self.channels.commit_all();
        report
    }

    pub async fn flush_writes(&mut self) -> CycleReport {
        self.scheduler.execute_writes().await
    }

    /// Restart supervision from UNDEFINED
    pub fn reset_context(&mut self) {
        if self.context.state != State::Undefined {
            self.logger.info(&format!(
                "State machine {} -> {} (reset)",
                self.context.state,
                State::Undefined
            ));
        }
        self.context = SupervisoryContext::default();
        self.publish(false);
    }

    /// Run the supervisory logic (or the configured override) for one cycle
    pub fn supervise(&mut self, control: &mut dyn BatteryControl, now: Instant) {
        let observation = control.observe(&self.channels, &self.health);
        match self.battery_state {
            BatteryState::Default => {
                let (next, output) = step(&self.context, observation, now, &self.config);
                if next.state != self.context.state {
                    self.logger.info(&format!(
                        "State machine {} -> {}",
                        self.context.state, next.state
                    ));
                }
                for command in output.commands {
                    self.issue(control, command);
                }
                self.context = next;
                self.publish(output.ready_for_working);
            }
            BatteryState::On => {
                self.issue(control, Command::Start);
                self.publish(observation.running && !observation.fault);
            }
            BatteryState::Off => {
                self.issue(control, Command::Stop);
                self.publish(false);
            }
        }
    }

    /// Issue one command; failures are logged and never touch the context
    pub fn issue(&self, control: &mut dyn BatteryControl, command: Command) {
        self.logger.debug(&format!("Issuing {:?}", command));
        if let Err(e) = control.issue(command, &self.channels) {
            self.logger
                .error(&format!("Failed to issue {:?} command: {}", command, e));
        }
    }

    fn publish(&self, ready: bool) {
        let published = self
            .state_machine
            .update_value(Some(Value::Integer(self.context.state.value())))
            .and_then(|_| self.ready_for_working.update_value(Some(Value::Boolean(ready))));
        if let Err(e) = published {
            self.logger
                .error(&format!("Cannot publish supervisory state: {}", e));
        }
    }

    /// Read, commit, step and write
    pub async fn tick(&mut self, control: &mut dyn BatteryControl, now: Instant) {
        self.read_and_commit().await;
        self.supervise(control, now);
        self.flush_writes().await;
    }
}

/// Read-write channel spec shorthand for device catalogs
pub(crate) const fn write_channel(id: &'static str, doc: ChannelDoc) -> ChannelSpec {
    ChannelSpec::new(id, doc.access(AccessMode::ReadWrite))
}
