//! BYD Battery-Box Commercial C130
//!
//! Contactors are driven through one control register that is both written
//! (FC6) and read back every cycle. Level-2 alarms are faults, level-1
//! alarms and module failures are warnings.

use super::{
    BATTERY_CHANNELS, BatteryControl, BatteryCore, CHARGE_MAX_CURRENT, CHARGE_MAX_VOLTAGE,
    COMMON_CHANNELS, CURRENT, DISCHARGE_MAX_CURRENT, DISCHARGE_MIN_VOLTAGE, Device,
    MAX_CELL_TEMPERATURE, MAX_CELL_VOLTAGE, MIN_CELL_TEMPERATURE, MIN_CELL_VOLTAGE, SOC, SOH, STATE,
    VOLTAGE, build_scheduler, write_channel,
};
use crate::channel::{
    CellArraySpec, ChannelDoc, ChannelSet, ChannelSpec, Options, OptionsEnum, Unit, ValueType,
};
use crate::config::{BridgeConfig, DeviceConfig, DeviceKind};
use crate::error::Result;
use crate::protocol::{
    ModbusProtocol, Priority, RegisterElement, SCALE_FACTOR_2, SCALE_FACTOR_MINUS_1,
    SharedTransport, Task, TaskSummary,
};
use crate::state_machine::{Command, Observation, State};
use crate::thing_state::{ThingState, ThingStateChannels};
use std::sync::Arc;
use std::time::Instant;

pub const CHARGE_MAX_V: i32 = 854;
pub const DISCHARGE_MIN_V: i32 = 696;
pub const CHARGE_MAX_A: i32 = 0;
pub const DISCHARGE_MAX_A: i32 = 0;

const SYSTEM_ON: i32 = 1;
const SYSTEM_OFF: i32 = 0;

pub const CONTACTOR_CONTROL: &str = "BmsContactorControl";
pub const ALARM_STATE: &str = "AlarmState";
pub const MODULE_STATE: &str = "ModuleState";

const CONTACTOR_CONTROL_ADDRESS: u16 = 0x2010;

/// Read-back of the contactor control register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactorControl {
    Undefined,
    CutOff,
    ConnectionInitiating,
    OnGrid,
}

impl OptionsEnum for ContactorControl {
    const OPTIONS: Options = &[
        (-1, "Undefined"),
        (0, "Cut off"),
        (1, "Connection initiating"),
        (3, "On grid"),
    ];

    fn value(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::CutOff => 0,
            Self::ConnectionInitiating => 1,
            Self::OnGrid => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::CutOff => "Cut off",
            Self::ConnectionInitiating => "Connection initiating",
            Self::OnGrid => "On grid",
        }
    }

    fn undefined() -> Self {
        Self::Undefined
    }

    fn all() -> &'static [Self] {
        &[Self::Undefined, Self::CutOff, Self::ConnectionInitiating, Self::OnGrid]
    }
}

const LEVEL_2_ALARMS: &[(u8, &str)] = &[
    (0, "AlarmLevel2CellVoltageHigh"),
    (1, "AlarmLevel2TotalVoltageHigh"),
    (2, "AlarmLevel2ChaCurrentHigh"),
    (3, "AlarmLevel2CellVoltageLow"),
    (4, "AlarmLevel2TotalVoltageLow"),
    (5, "AlarmLevel2DischaCurrentHigh"),
    (6, "AlarmLevel2CellChaTempHigh"),
    (7, "AlarmLevel2CellChaTempLow"),
    (12, "AlarmLevel2InsulationLow"),
    (14, "AlarmLevel2CellDischaTempHigh"),
    (15, "AlarmLevel2CellDischaTempLow"),
];

const LEVEL_1_ALARMS: &[(u8, &str)] = &[
    (0, "AlarmLevel1CellVoltageHigh"),
    (1, "AlarmLevel1TotalVoltageHigh"),
    (2, "AlarmLevel1ChaCurrentHigh"),
    (3, "AlarmLevel1CellVoltageLow"),
    (4, "AlarmLevel1TotalVoltageLow"),
    (5, "AlarmLevel1DischaCurrentHigh"),
    (6, "AlarmLevel1CellChaTempHigh"),
    (7, "AlarmLevel1CellChaTempLow"),
    (8, "AlarmLevel1SocLow"),
    (9, "AlarmLevel1CellTempDiffHigh"),
    (11, "AlarmLevel1CellVoltageDiffHigh"),
    (12, "AlarmLevel1InsulationLow"),
    (13, "AlarmLevel1TotalVoltageDiffHigh"),
    (14, "AlarmLevel1CellDischaTempHigh"),
    (15, "AlarmLevel1CellDischaTempLow"),
];

const MODULE_FAILURES: &[(u8, &str)] = &[
    (0, "FailureSamplingWire"),
    (2, "FailureLtc6803"),
    (3, "FailureVoltageSampling"),
    (4, "FailureTempSampling"),
    (8, "FailureBalancingModule"),
    (9, "FailureTempSamplingLine"),
    (10, "FailureIntranetCommunication"),
    (11, "FailureEeprom"),
    (12, "FailureInitialization"),
];

const CHANNELS: &[ChannelSpec] = &[
    write_channel(CONTACTOR_CONTROL, ChannelDoc::enumeration(ContactorControl::OPTIONS)),
    ChannelSpec::new("Cluster1ChargeIndication", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("Cluster1MaxCellVoltageId", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("Cluster1MinCellVoltageId", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("Cluster1MaxCellTemperatureId", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("Cluster1MinCellTemperatureId", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("SystemInsulation", ChannelDoc::of(ValueType::Integer).unit(Unit::Kiloohm)),
    ChannelSpec::new("Normal", ChannelDoc::of(ValueType::Boolean)),
    ChannelSpec::new("Fault", ChannelDoc::of(ValueType::Boolean)),
    ChannelSpec::new("ClusterRunState", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new(ALARM_STATE, ChannelDoc::enumeration(ThingState::OPTIONS)),
    ChannelSpec::new(MODULE_STATE, ChannelDoc::enumeration(ThingState::OPTIONS)),
];

pub const CELL_VOLTAGES: CellArraySpec = CellArraySpec {
    prefix: "Cluster1Battery",
    suffix: "Voltage",
    count: 240,
    doc: ChannelDoc::of(ValueType::Integer).unit(Unit::Millivolt),
};

pub const CELL_TEMPERATURES: CellArraySpec = CellArraySpec {
    prefix: "Cluster1Battery",
    suffix: "Temperature",
    count: 48,
    doc: ChannelDoc::of(ValueType::Integer).unit(Unit::DegreeCelsius),
};

const CELL_VOLTAGE_ADDRESS: u16 = 0x2800;
const CELL_TEMPERATURE_ADDRESS: u16 = 0x2C00;
const CELLS_PER_TASK: usize = 120;

/// Contactor handling of the C130
#[derive(Debug, Default)]
struct Control {
    /// A stop is in flight; start stays suppressed until contactors read CUT_OFF
    is_stopping: bool,
}

fn contactor(channels: &ChannelSet) -> Option<ContactorControl> {
    channels
        .value(CONTACTOR_CONTROL)
        .map(|v| ContactorControl::from_value(Some(&v)))
}

impl BatteryControl for Control {
    fn observe(&self, channels: &ChannelSet, health: &ThingStateChannels) -> Observation {
        let cc = contactor(channels);
        Observation {
            fault: health.state() == ThingState::Fault,
            stopped: cc == Some(ContactorControl::CutOff),
            running: cc == Some(ContactorControl::OnGrid),
        }
    }

    fn issue(&mut self, command: Command, channels: &ChannelSet) -> Result<()> {
        let cc = contactor(channels);
        if cc == Some(ContactorControl::CutOff) {
            self.is_stopping = false;
        }
        match command {
            Command::Start => {
                // never re-close contactors that are already on grid
                if self.is_stopping || cc == Some(ContactorControl::OnGrid) {
                    return Ok(());
                }
                channels.set_next_write_value(CONTACTOR_CONTROL, SYSTEM_ON)
            }
            Command::Stop | Command::Recover => {
                if cc == Some(ContactorControl::CutOff) {
                    return Ok(());
                }
                channels.set_next_write_value(CONTACTOR_CONTROL, SYSTEM_OFF)?;
                self.is_stopping = true;
                Ok(())
            }
        }
    }
}

pub struct BydC130 {
    core: BatteryCore,
    control: Control,
}

impl std::fmt::Debug for BydC130 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BydC130").field("core", &self.core).finish()
    }
}

fn bits(address: u16, set: &ChannelSet, map: &[(u8, &str)]) -> Result<RegisterElement> {
    let mut element = RegisterElement::bits_word(address);
    for (bit, id) in map {
        element = element.bit(*bit, &set.get(id)?);
    }
    Ok(element)
}

fn word(address: u16, set: &ChannelSet, id: &str) -> Result<RegisterElement> {
    Ok(RegisterElement::unsigned_word(address).to(&set.get(id)?))
}

impl BydC130 {
    pub fn new(config: &DeviceConfig, bridge: &BridgeConfig, transport: SharedTransport) -> Result<Self> {
        let mut set = ChannelSet::new(&config.id);
        set.add_specs(COMMON_CHANNELS)?;
        set.add_specs(BATTERY_CHANNELS)?;
        set.add_specs(CHANNELS)?;
        for (_, id) in LEVEL_2_ALARMS.iter().chain(LEVEL_1_ALARMS).chain(MODULE_FAILURES) {
            set.add(id, ChannelDoc::of(ValueType::Boolean))?;
        }
        let cell_voltages = set.add_cell_array(&CELL_VOLTAGES)?;
        let cell_temperatures = set.add_cell_array(&CELL_TEMPERATURES)?;

        // fixed limits; the C130 does not report them
        set.get(CHARGE_MAX_VOLTAGE)?.update_value(Some(CHARGE_MAX_V.into()))?;
        set.get(DISCHARGE_MIN_VOLTAGE)?.update_value(Some(DISCHARGE_MIN_V.into()))?;
        set.get(CHARGE_MAX_CURRENT)?.update_value(Some(CHARGE_MAX_A.into()))?;
        set.get(DISCHARGE_MAX_CURRENT)?.update_value(Some(DISCHARGE_MAX_A.into()))?;

        let mut protocol = ModbusProtocol::new(bridge.max_registers_per_task);
        protocol.add_task(Task::write_single(word(CONTACTOR_CONTROL_ADDRESS, &set, CONTACTOR_CONTROL)?)?)?;
        protocol.add_task(Task::read(
            Priority::High,
            vec![word(CONTACTOR_CONTROL_ADDRESS, &set, CONTACTOR_CONTROL)?],
        )?)?;
        protocol.add_task(Task::read(
            Priority::Low,
            vec![
                RegisterElement::signed_word(0x2100)
                    .to_converted(&set.get(VOLTAGE)?, SCALE_FACTOR_MINUS_1),
                RegisterElement::signed_word(0x2101).to_converted(&set.get(CURRENT)?, SCALE_FACTOR_2),
            ],
        )?)?;
        protocol.add_task(Task::read(
            Priority::High,
            vec![
                RegisterElement::signed_word(0x2102).to(&set.get("Cluster1ChargeIndication")?),
                word(0x2103, &set, SOC)?,
                word(0x2104, &set, SOH)?,
                word(0x2105, &set, "Cluster1MaxCellVoltageId")?,
                word(0x2106, &set, MAX_CELL_VOLTAGE)?,
                word(0x2107, &set, "Cluster1MinCellVoltageId")?,
                word(0x2108, &set, MIN_CELL_VOLTAGE)?,
                word(0x2109, &set, "Cluster1MaxCellTemperatureId")?,
                RegisterElement::unsigned_word(0x210A)
                    .to_converted(&set.get(MAX_CELL_TEMPERATURE)?, SCALE_FACTOR_MINUS_1),
                word(0x210B, &set, "Cluster1MinCellTemperatureId")?,
                RegisterElement::unsigned_word(0x210C)
                    .to_converted(&set.get(MIN_CELL_TEMPERATURE)?, SCALE_FACTOR_MINUS_1),
                RegisterElement::dummy(0x210D, 0x2115),
                word(0x2116, &set, "SystemInsulation")?,
            ],
        )?)?;
        protocol.add_task(Task::read(
            Priority::High,
            vec![bits(0x211D, &set, &[(0, "Normal"), (1, "Fault")])?],
        )?)?;
        protocol.add_task(Task::read(
            Priority::Low,
            vec![
                bits(0x2140, &set, LEVEL_2_ALARMS)?,
                bits(0x2141, &set, LEVEL_1_ALARMS)?,
                word(0x2142, &set, "ClusterRunState")?,
            ],
        )?)?;
        protocol.add_task(Task::read(
            Priority::High,
            vec![
                RegisterElement::signed_word(0x216C)
                    .to_converted(&set.get(CHARGE_MAX_CURRENT)?, SCALE_FACTOR_MINUS_1),
                RegisterElement::signed_word(0x216D)
                    .to_converted(&set.get(DISCHARGE_MAX_CURRENT)?, SCALE_FACTOR_MINUS_1),
            ],
        )?)?;
        protocol.add_task(Task::read(Priority::Low, vec![bits(0x2185, &set, MODULE_FAILURES)?])?)?;
        for (chunk_index, chunk) in cell_voltages.chunks(CELLS_PER_TASK).enumerate() {
            let base = CELL_VOLTAGE_ADDRESS + (chunk_index * CELLS_PER_TASK) as u16;
            protocol.add_read_tasks(
                Priority::Low,
                chunk
                    .iter()
                    .enumerate()
                    .map(|(i, c)| RegisterElement::unsigned_word(base + i as u16).to(c))
                    .collect(),
            )?;
        }
        protocol.add_read_tasks(
            Priority::Low,
            cell_temperatures
                .iter()
                .enumerate()
                .map(|(i, c)| RegisterElement::unsigned_word(CELL_TEMPERATURE_ADDRESS + i as u16).to(c))
                .collect(),
        )?;

        let health = ThingStateChannels::new(set.get(STATE)?)?;
        let alarms = ThingStateChannels::new(set.get(ALARM_STATE)?)?;
        for (_, id) in LEVEL_2_ALARMS {
            alarms.add_fault_channel(&set.get(id)?)?;
        }
        for (_, id) in LEVEL_1_ALARMS {
            alarms.add_warning_channel(&set.get(id)?)?;
        }
        let modules = ThingStateChannels::new(set.get(MODULE_STATE)?)?;
        for (_, id) in MODULE_FAILURES {
            modules.add_warning_channel(&set.get(id)?)?;
        }
        health.add_child_channel(&alarms)?;
        health.add_child_channel(&modules)?;

        let scheduler = build_scheduler(config, bridge, protocol, transport, &set)?;
        let core = BatteryCore::new(config, scheduler, Arc::new(set), health)?;
        Ok(Self {
            core,
            control: Control::default(),
        })
    }
}

#[async_trait::async_trait]
impl Device for BydC130 {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::BydC130
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
        self.core.tick(&mut self.control, now).await;
    }
}
