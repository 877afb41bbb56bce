//! BMW battery storage system
//!
//! The BMS state register tells whether the battery is in operation, off or
//! in error. Commands go out through one FC16 block that also carries a
//! heartbeat counter, written every cycle.
//!
//! With the shutdown bypass enabled the state machine is frozen and the
//! contactors are opened only once the configured inverter sits in standby
//! at zero active and reactive power.

use super::refu88k::{self, InverterState};
use super::{
    BATTERY_CHANNELS, BatteryControl, BatteryCore, CHARGE_MAX_CURRENT, CHARGE_MAX_VOLTAGE,
    COMMON_CHANNELS, DISCHARGE_MAX_CURRENT, DISCHARGE_MIN_VOLTAGE, Device, MAX_CELL_VOLTAGE,
    MIN_CELL_VOLTAGE, SOC, SOH, STATE, VOLTAGE, build_scheduler, write_channel,
};
use crate::channel::{
    Channel, ChannelDoc, ChannelSet, ChannelSpec, Options, OptionsEnum, Unit, Value,
    ValueType,
};
use crate::config::{BridgeConfig, DeviceConfig, DeviceKind};
use crate::error::{Result, VoltaicError};
use crate::protocol::{
    ElementToChannelConverter, ModbusProtocol, Priority, RegisterElement, SCALE_FACTOR_2, SCALE_FACTOR_MINUS_1,
    SCALE_FACTOR_MINUS_2, SharedTransport, Task, TaskSummary,
};
use crate::state_machine::{Command, Observation, State};
use crate::thing_state::ThingStateChannels;
use std::sync::Arc;
use std::time::Instant;

pub const OPEN_CONTACTORS: i32 = 0;
pub const CLOSE_CONTACTORS: i32 = 1 << 2;
pub const CLEAR_ERROR: i32 = 1 << 14;

pub const HEART_BEAT: &str = "HeartBeat";
pub const BMS_STATE: &str = "BmsState";
pub const BMS_STATE_COMMAND: &str = "BmsStateCommand";
pub const BATTERY_OFF: &str = "BatteryOff";
pub const ERROR_ACTIVE: &str = "ErrorActive";
pub const WARNING_ACTIVE: &str = "WarningActive";

/// State reported by the BMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmsState {
    Undefined,
    Off,
    Init,
    Standby,
    Precharge,
    Operation,
    Error,
}

impl OptionsEnum for BmsState {
    const OPTIONS: Options = &[
        (-1, "Undefined"),
        (0, "Off"),
        (1, "Init"),
        (2, "Standby"),
        (3, "Precharge"),
        (4, "Operation"),
        (5, "Error"),
    ];

    fn value(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::Off => 0,
            Self::Init => 1,
            Self::Standby => 2,
            Self::Precharge => 3,
            Self::Operation => 4,
            Self::Error => 5,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Off => "Off",
            Self::Init => "Init",
            Self::Standby => "Standby",
            Self::Precharge => "Precharge",
            Self::Operation => "Operation",
            Self::Error => "Error",
        }
    }

    fn undefined() -> Self {
        Self::Undefined
    }

    fn all() -> &'static [Self] {
        &[
            Self::Undefined,
            Self::Off,
            Self::Init,
            Self::Standby,
            Self::Precharge,
            Self::Operation,
            Self::Error,
        ]
    }
}

const fn int(unit: Unit) -> ChannelDoc {
    ChannelDoc::of(ValueType::Integer).unit(unit)
}

const CHANNELS: &[ChannelSpec] = &[
    write_channel(HEART_BEAT, ChannelDoc::of(ValueType::Integer)),
    write_channel(BMS_STATE_COMMAND, ChannelDoc::of(ValueType::Integer)),
    write_channel("OperatingStateInverter", ChannelDoc::of(ValueType::Integer)),
    write_channel("DcLinkVoltage", int(Unit::Volt)),
    write_channel("DcLinkCurrent", int(Unit::Ampere)),
    write_channel("OperationModeRequestGranted", ChannelDoc::of(ValueType::Integer)),
    write_channel("OperationModeRequestCanceled", ChannelDoc::of(ValueType::Integer)),
    write_channel("ConnectionStrategyHighSocFirst", ChannelDoc::of(ValueType::Boolean)),
    write_channel("ConnectionStrategyLowSocFirst", ChannelDoc::of(ValueType::Boolean)),
    write_channel("SystemTime", ChannelDoc::of(ValueType::Long)),
    write_channel(
        BATTERY_OFF,
        ChannelDoc::of(ValueType::Boolean).text("Shutdown bypass: open contactors once the inverter idles"),
    ),
    ChannelSpec::new("LifeSign", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new(BMS_STATE, ChannelDoc::enumeration(BmsState::OPTIONS)),
    ChannelSpec::new("ErrorBits1", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("ErrorBits2", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("WarningBits1", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("WarningBits2", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("InfoBits", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("MaximumOperatingCurrent", int(Unit::Ampere)),
    ChannelSpec::new("MinimumOperatingCurrent", int(Unit::Ampere)),
    ChannelSpec::new("MaximumLimitDynamicVoltage", int(Unit::Volt)),
    ChannelSpec::new("MinimumLimitDynamicVoltage", int(Unit::Volt)),
    ChannelSpec::new("NumberOfStringsConnected", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("NumberOfStringsInstalled", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("SocAllStrings", int(Unit::Percent)),
    ChannelSpec::new("RemainingChargeCapacity", int(Unit::AmpereHours)),
    ChannelSpec::new("RemainingDischargeCapacity", int(Unit::AmpereHours)),
    ChannelSpec::new("RemainingChargeEnergy", int(Unit::WattHours)),
    ChannelSpec::new("RemainingDischargeEnergy", int(Unit::WattHours)),
    ChannelSpec::new("NominalEnergy", int(Unit::WattHours)),
    ChannelSpec::new("TotalEnergy", int(Unit::WattHours)),
    ChannelSpec::new("NominalCapacity", int(Unit::AmpereHours)),
    ChannelSpec::new("TotalCapacity", int(Unit::AmpereHours)),
    ChannelSpec::new("DcVoltageAverage", int(Unit::Volt)),
    ChannelSpec::new("DcCurrent", int(Unit::Ampere)),
    ChannelSpec::new("AverageTemperature", int(Unit::DegreeCelsius)),
    ChannelSpec::new("MinimumTemperature", int(Unit::DegreeCelsius)),
    ChannelSpec::new("MaximumTemperature", int(Unit::DegreeCelsius)),
    ChannelSpec::new("AverageCellVoltage", int(Unit::Millivolt)),
    ChannelSpec::new("InternalResistance", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("InsulationResistance", int(Unit::Kiloohm)),
    ChannelSpec::new("ContainerTemperature", int(Unit::DegreeCelsius)),
    ChannelSpec::new("AmbientTemperature", int(Unit::DegreeCelsius)),
    ChannelSpec::new("HumidityContainer", int(Unit::Percent)),
    ChannelSpec::new("MaximumLimitDynamicCurrentHighRes", int(Unit::Ampere)),
    ChannelSpec::new("MinimumLimitDynamicCurrentHighRes", int(Unit::Ampere)),
    ChannelSpec::new("FullCycleCount", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("OperatingTimeCount", ChannelDoc::of(ValueType::Long)),
    ChannelSpec::new("ComProVersion", ChannelDoc::of(ValueType::Long)),
    ChannelSpec::new("SerialNumber", ChannelDoc::of(ValueType::Long)),
    ChannelSpec::new("SoftwareVersion", ChannelDoc::of(ValueType::Long)),
    ChannelSpec::new(ERROR_ACTIVE, ChannelDoc::of(ValueType::Boolean).text("BMS error bits set")),
    ChannelSpec::new(WARNING_ACTIVE, ChannelDoc::of(ValueType::Boolean).text("BMS warning bits set")),
];

/// Status block, registers 999..=1053
fn read_block(set: &ChannelSet) -> Result<Vec<RegisterElement>> {
    let w = |address: u16, id: &str| -> Result<RegisterElement> {
        Ok(RegisterElement::unsigned_word(address).to(&set.get(id)?))
    };
    let ws = |address: u16, id: &str, conv: ElementToChannelConverter| -> Result<RegisterElement> {
        Ok(RegisterElement::unsigned_word(address).to_converted(&set.get(id)?, conv))
    };
    let dw = |address: u16, id: &str| -> Result<RegisterElement> {
        Ok(RegisterElement::unsigned_doubleword(address).to(&set.get(id)?))
    };
    Ok(vec![
        w(999, "LifeSign")?,
        w(1000, BMS_STATE)?,
        w(1001, "ErrorBits1")?,
        w(1002, "ErrorBits2")?,
        w(1003, "WarningBits1")?,
        w(1004, "WarningBits2")?,
        w(1005, "InfoBits")?,
        w(1006, "MaximumOperatingCurrent")?,
        RegisterElement::signed_word(1007).to(&set.get("MinimumOperatingCurrent")?),
        ws(1008, CHARGE_MAX_VOLTAGE, SCALE_FACTOR_MINUS_1)?,
        ws(1009, DISCHARGE_MIN_VOLTAGE, SCALE_FACTOR_MINUS_1)?,
        w(1010, DISCHARGE_MAX_CURRENT)?,
        RegisterElement::signed_word(1011).to(&set.get(CHARGE_MAX_CURRENT)?),
        ws(1012, "MaximumLimitDynamicVoltage", SCALE_FACTOR_MINUS_1)?,
        ws(1013, "MinimumLimitDynamicVoltage", SCALE_FACTOR_MINUS_1)?,
        w(1014, "NumberOfStringsConnected")?,
        w(1015, "NumberOfStringsInstalled")?,
        ws(1016, "SocAllStrings", SCALE_FACTOR_MINUS_2)?,
        ws(1017, SOC, SCALE_FACTOR_MINUS_2)?,
        w(1018, "RemainingChargeCapacity")?,
        w(1019, "RemainingDischargeCapacity")?,
        w(1020, "RemainingChargeEnergy")?,
        w(1021, "RemainingDischargeEnergy")?,
        w(1022, "NominalEnergy")?,
        w(1023, "TotalEnergy")?,
        w(1024, "NominalCapacity")?,
        w(1025, "TotalCapacity")?,
        ws(1026, SOH, SCALE_FACTOR_MINUS_2)?,
        ws(1027, VOLTAGE, SCALE_FACTOR_MINUS_1)?,
        ws(1028, "DcVoltageAverage", SCALE_FACTOR_MINUS_1)?,
        ws(1029, "DcCurrent", SCALE_FACTOR_MINUS_1)?,
        w(1030, "AverageTemperature")?,
        w(1031, "MinimumTemperature")?,
        w(1032, "MaximumTemperature")?,
        w(1033, MIN_CELL_VOLTAGE)?,
        w(1034, MAX_CELL_VOLTAGE)?,
        w(1035, "AverageCellVoltage")?,
        w(1036, "InternalResistance")?,
        ws(1037, "InsulationResistance", SCALE_FACTOR_MINUS_1)?,
        ws(1038, "ContainerTemperature", SCALE_FACTOR_MINUS_1)?,
        ws(1039, "AmbientTemperature", SCALE_FACTOR_MINUS_1)?,
        ws(1040, "HumidityContainer", SCALE_FACTOR_MINUS_1)?,
        ws(1041, "MaximumLimitDynamicCurrentHighRes", SCALE_FACTOR_2)?,
        ws(1042, "MinimumLimitDynamicCurrentHighRes", SCALE_FACTOR_2)?,
        w(1043, "FullCycleCount")?,
        dw(1044, "OperatingTimeCount")?,
        dw(1046, "ComProVersion")?,
        dw(1048, "SerialNumber")?,
        RegisterElement::dummy(1050, 1051),
        dw(1052, "SoftwareVersion")?,
    ])
}

fn write_block(set: &ChannelSet) -> Result<Vec<RegisterElement>> {
    Ok(vec![
        RegisterElement::unsigned_word(1399).to(&set.get(HEART_BEAT)?),
        RegisterElement::unsigned_word(1400).to(&set.get(BMS_STATE_COMMAND)?),
        RegisterElement::unsigned_word(1401).to(&set.get("OperatingStateInverter")?),
        RegisterElement::unsigned_word(1402)
            .to_converted(&set.get("DcLinkVoltage")?, SCALE_FACTOR_MINUS_1),
        RegisterElement::unsigned_word(1403).to(&set.get("DcLinkCurrent")?),
        RegisterElement::unsigned_word(1404).to(&set.get("OperationModeRequestGranted")?),
        RegisterElement::unsigned_word(1405).to(&set.get("OperationModeRequestCanceled")?),
        RegisterElement::bits_word(1406)
            .bit(1, &set.get("ConnectionStrategyHighSocFirst")?)
            .bit(0, &set.get("ConnectionStrategyLowSocFirst")?),
        RegisterElement::unsigned_doubleword(1407).to(&set.get("SystemTime")?),
    ])
}

fn bms_state(channels: &ChannelSet) -> BmsState {
    BmsState::from_value(channels.value(BMS_STATE).as_ref())
}

#[derive(Debug)]
struct Control {
    heart_beat: Arc<Channel>,
    counter: u16,
}

impl Control {
    /// Stage the next heartbeat; the BMS watches it for changes
    fn beat(&mut self) -> Result<()> {
        self.counter = self.counter.wrapping_add(1);
        self.heart_beat.set_next_write_value(i32::from(self.counter))
    }
}

impl BatteryControl for Control {
    fn observe(&self, channels: &ChannelSet, _health: &ThingStateChannels) -> Observation {
        let state = bms_state(channels);
        Observation {
            fault: state == BmsState::Error,
            stopped: state == BmsState::Off,
            running: state == BmsState::Operation,
        }
    }

    fn issue(&mut self, command: Command, channels: &ChannelSet) -> Result<()> {
        let word = match command {
            Command::Start => CLOSE_CONTACTORS,
            Command::Stop => OPEN_CONTACTORS,
            Command::Recover => CLEAR_ERROR,
        };
        channels.set_next_write_value(BMS_STATE_COMMAND, word)
    }
}

/// Mirrors non-zero error and warning words into boolean health inputs
fn derive_alarm_flags(channels: &ChannelSet) -> Result<()> {
    let non_zero = |ids: [&str; 2]| {
        ids.iter()
            .any(|id| channels.value(id).and_then(|v| v.as_i64()).unwrap_or(0) != 0)
    };
    channels
        .get(ERROR_ACTIVE)?
        .update_value(Some(Value::Boolean(non_zero(["ErrorBits1", "ErrorBits2"]))))?;
    channels
        .get(WARNING_ACTIVE)?
        .update_value(Some(Value::Boolean(non_zero(["WarningBits1", "WarningBits2"]))))?;
    Ok(())
}

pub struct BmwBattery {
    core: BatteryCore,
    control: Control,
    battery_off: Arc<Channel>,
    inverter: Option<Arc<ChannelSet>>,
}

impl std::fmt::Debug for BmwBattery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BmwBattery")
            .field("core", &self.core)
            .field("bypass", &self.battery_off.is_true())
            .finish_non_exhaustive()
    }
}

impl BmwBattery {
    /// `inverter` is the channel set of the device named in
    /// `shutdown.inverter_id`, required when that is configured
    pub fn new(
        config: &DeviceConfig,
        bridge: &BridgeConfig,
        transport: SharedTransport,
        inverter: Option<Arc<ChannelSet>>,
    ) -> Result<Self> {
        if config.shutdown.inverter_id.is_some() && inverter.is_none() {
            return Err(VoltaicError::configuration(format!(
                "device {}: shutdown inverter is not available",
                config.id
            )));
        }

        let mut set = ChannelSet::new(&config.id);
        set.add_specs(COMMON_CHANNELS)?;
        set.add_specs(BATTERY_CHANNELS)?;
        set.add_specs(CHANNELS)?;

        let mut protocol = ModbusProtocol::new(bridge.max_registers_per_task);
        protocol.add_task(Task::write_multiple(write_block(&set)?)?)?;
        protocol.add_read_tasks(Priority::High, read_block(&set)?)?;

        let health = ThingStateChannels::new(set.get(STATE)?)?;
        health.add_fault_channel(&set.get(ERROR_ACTIVE)?)?;
        health.add_warning_channel(&set.get(WARNING_ACTIVE)?)?;

        let battery_off = set.get(BATTERY_OFF)?;
        battery_off.update_value(Some(Value::Boolean(config.shutdown.enabled)))?;
        let heart_beat = set.get(HEART_BEAT)?;

        let scheduler = build_scheduler(config, bridge, protocol, transport, &set)?;
        let core = BatteryCore::new(config, scheduler, Arc::new(set), health)?;
        Ok(Self {
            core,
            control: Control {
                heart_beat,
                counter: 0,
            },
            battery_off,
            inverter,
        })
    }

    /// Apply a runtime switch of the bypass; returns whether it is active
    fn update_bypass(&mut self) -> bool {
        let before = self.battery_off.is_true();
        if let Some(requested) = self.battery_off.take_next_write_value()
            && let Err(e) = self.battery_off.update_value(Some(requested))
        {
            self.core
                .logger()
                .error(&format!("Cannot switch shutdown bypass: {}", e));
        }
        let active = self.battery_off.is_true();
        if before != active {
            self.core
                .logger()
                .info(&format!("Shutdown bypass {}", if active { "enabled" } else { "disabled" }));
            if !active {
                self.core.reset_context();
            }
        }
        active
    }

    /// Open contactors once the inverter idles in standby with both powers
    /// read as zero; unknown power keeps them closed
    fn shut_down(&mut self) {
        let Some(inverter) = &self.inverter else {
            self.core
                .logger()
                .warn("Shutdown bypass active without an inverter; contactors stay as they are");
            return;
        };
        let st = InverterState::from_value(inverter.value(refu88k::ST).as_ref());
        if st != InverterState::Standby {
            return;
        }
        let idle = |id: &str| inverter.value(id).and_then(|v| v.as_i64()) == Some(0);
        if idle(refu88k::ACTIVE_POWER) && idle(refu88k::REACTIVE_POWER) {
            self.core.issue(&mut self.control, Command::Stop);
        }
    }
}

#[async_trait::async_trait]
impl Device for BmwBattery {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Bmw
    }

    fn channels(&self) -> &Arc<ChannelSet> {
        self.core.channels()
    }

    fn thing_state(&self) -> &ThingStateChannels {
        self.core.health()
    }

    fn state_machine_state(&self) -> Option<State> {
        Some(self.core.context().state)
    }

    fn task_summaries(&self) -> Vec<TaskSummary> {
        self.core.task_summaries()
    }

    async fn tick(&mut self, now: Instant) {
        self.core.read_and_commit().await;
        if let Err(e) = derive_alarm_flags(self.core.channels()) {
            self.core
                .logger()
                .error(&format!("Cannot derive alarm flags: {}", e));
        }
        if self.update_bypass() {
            self.shut_down();
        } else {
            self.core.supervise(&mut self.control, now);
        }
        if let Err(e) = self.control.beat() {
            self.core
                .logger()
                .error(&format!("Cannot stage heartbeat: {}", e));
        }
        self.core.flush_writes().await;
    }
}
