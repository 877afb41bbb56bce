//! REFUstore 88K battery inverter (monitoring)
//!
//! Reads the SunSpec three-phase inverter block and exposes the operating
//! state plus active and reactive power with their scale factors applied.
//! The inverter carries a health tree but no supervisory state machine.

use super::{COMMON_CHANNELS, Device, STATE, build_scheduler, device_logger, write_channel};
use crate::channel::{ChannelDoc, ChannelSet, ChannelSpec, Options, OptionsEnum, Unit, Value, ValueType};
use crate::config::{BridgeConfig, DeviceConfig, DeviceKind};
use crate::error::Result;
use crate::logging::StructuredLogger;
use crate::protocol::{
    ElementToChannelConverter, ModbusProtocol, Priority, RegisterElement, SharedTransport, Task,
    TaskScheduler, TaskSummary,
};
use crate::thing_state::ThingStateChannels;
use std::sync::Arc;
use std::time::Instant;

pub const ST: &str = "St";
pub const W: &str = "W";
pub const W_SF: &str = "WSf";
pub const VAR: &str = "VAr";
pub const VAR_SF: &str = "VArSf";
pub const ACTIVE_POWER: &str = "ActivePower";
pub const REACTIVE_POWER: &str = "ReactivePower";
pub const PCS_SET_OPERATION: &str = "PcsSetOperation";
pub const INVERTER_FAULT: &str = "InverterFault";

/// First register of the three-phase inverter model data
const INVERTER_BLOCK: u16 = 40071;
const PCS_SET_OPERATION_ADDRESS: u16 = 40852;

/// SunSpec operating state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterState {
    Undefined,
    Off,
    Sleeping,
    Starting,
    Mppt,
    Throttled,
    ShuttingDown,
    Fault,
    Standby,
    Started,
}

impl OptionsEnum for InverterState {
    const OPTIONS: Options = &[
        (-1, "Undefined"),
        (1, "Off"),
        (2, "Sleeping"),
        (3, "Starting"),
        (4, "MPPT"),
        (5, "Throttled"),
        (6, "Shutting down"),
        (7, "Fault"),
        (8, "Standby"),
        (9, "Started"),
    ];

    fn value(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::Off => 1,
            Self::Sleeping => 2,
            Self::Starting => 3,
            Self::Mppt => 4,
            Self::Throttled => 5,
            Self::ShuttingDown => 6,
            Self::Fault => 7,
            Self::Standby => 8,
            Self::Started => 9,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Off => "Off",
            Self::Sleeping => "Sleeping",
            Self::Starting => "Starting",
            Self::Mppt => "MPPT",
            Self::Throttled => "Throttled",
            Self::ShuttingDown => "Shutting down",
            Self::Fault => "Fault",
            Self::Standby => "Standby",
            Self::Started => "Started",
        }
    }

    fn undefined() -> Self {
        Self::Undefined
    }

    fn all() -> &'static [Self] {
        &[
            Self::Undefined,
            Self::Off,
            Self::Sleeping,
            Self::Starting,
            Self::Mppt,
            Self::Throttled,
            Self::ShuttingDown,
            Self::Fault,
            Self::Standby,
            Self::Started,
        ]
    }
}

/// Operation request written to the PCS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcsSetOperation {
    Undefined,
    ConnectToGrid,
    EnterStartedMode,
    EnterStandbyMode,
    ExitStandbyMode,
}

impl OptionsEnum for PcsSetOperation {
    const OPTIONS: Options = &[
        (-1, "Undefined"),
        (1, "Connect to grid"),
        (2, "Stop system"),
        (3, "Enter Standby Mode"),
        (4, "Exit Standby Mode"),
    ];

    fn value(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::ConnectToGrid => 1,
            Self::EnterStartedMode => 2,
            Self::EnterStandbyMode => 3,
            Self::ExitStandbyMode => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::ConnectToGrid => "Connect to grid",
            Self::EnterStartedMode => "Stop system",
            Self::EnterStandbyMode => "Enter Standby Mode",
            Self::ExitStandbyMode => "Exit Standby Mode",
        }
    }

    fn undefined() -> Self {
        Self::Undefined
    }

    fn all() -> &'static [Self] {
        &[
            Self::Undefined,
            Self::ConnectToGrid,
            Self::EnterStartedMode,
            Self::EnterStandbyMode,
            Self::ExitStandbyMode,
        ]
    }
}

const fn int(unit: Unit) -> ChannelDoc {
    ChannelDoc::of(ValueType::Integer).unit(unit)
}

const fn sf() -> ChannelDoc {
    ChannelDoc::of(ValueType::Integer).text("SunSpec scale factor")
}

const CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::new("A", int(Unit::Ampere)),
    ChannelSpec::new("AphA", int(Unit::Ampere)),
    ChannelSpec::new("AphB", int(Unit::Ampere)),
    ChannelSpec::new("AphC", int(Unit::Ampere)),
    ChannelSpec::new("ASf", sf()),
    ChannelSpec::new("PPVphAB", int(Unit::Volt)),
    ChannelSpec::new("PPVphBC", int(Unit::Volt)),
    ChannelSpec::new("PPVphCA", int(Unit::Volt)),
    ChannelSpec::new("PhVphA", int(Unit::Volt)),
    ChannelSpec::new("PhVphB", int(Unit::Volt)),
    ChannelSpec::new("PhVphC", int(Unit::Volt)),
    ChannelSpec::new("VSf", sf()),
    ChannelSpec::new(W, int(Unit::Watt)),
    ChannelSpec::new(W_SF, sf()),
    ChannelSpec::new("Hz", int(Unit::Hertz)),
    ChannelSpec::new("HzSf", sf()),
    ChannelSpec::new("VA", int(Unit::VoltAmpere)),
    ChannelSpec::new("VASf", sf()),
    ChannelSpec::new(VAR, int(Unit::VoltAmpereReactive)),
    ChannelSpec::new(VAR_SF, sf()),
    ChannelSpec::new("PF", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new("PFSf", sf()),
    ChannelSpec::new("WH", ChannelDoc::of(ValueType::Long).unit(Unit::WattHours)),
    ChannelSpec::new("WHSf", sf()),
    ChannelSpec::new("DCA", int(Unit::Ampere)),
    ChannelSpec::new("DCASf", sf()),
    ChannelSpec::new("DCV", int(Unit::Volt)),
    ChannelSpec::new("DCVSf", sf()),
    ChannelSpec::new("DCW", int(Unit::Watt)),
    ChannelSpec::new("DCWSf", sf()),
    ChannelSpec::new("TmpCab", int(Unit::DegreeCelsius)),
    ChannelSpec::new("TmpSnk", int(Unit::DegreeCelsius)),
    ChannelSpec::new("TmpTrns", int(Unit::DegreeCelsius)),
    ChannelSpec::new("TmpOt", int(Unit::DegreeCelsius)),
    ChannelSpec::new("TmpSf", sf()),
    ChannelSpec::new(ST, ChannelDoc::enumeration(InverterState::OPTIONS)),
    ChannelSpec::new("StVnd", ChannelDoc::of(ValueType::Integer)),
    ChannelSpec::new(ACTIVE_POWER, int(Unit::Watt)),
    ChannelSpec::new(REACTIVE_POWER, int(Unit::VoltAmpereReactive)),
    ChannelSpec::new(INVERTER_FAULT, ChannelDoc::of(ValueType::Boolean).text("Inverter reports FAULT")),
    write_channel(PCS_SET_OPERATION, ChannelDoc::enumeration(PcsSetOperation::OPTIONS)),
];

/// SunSpec word types of the inverter block, in register order
#[derive(Clone, Copy)]
enum Kind {
    U16,
    I16,
    Acc32,
}

const BLOCK: &[(&str, Kind)] = &[
    ("A", Kind::U16),
    ("AphA", Kind::U16),
    ("AphB", Kind::U16),
    ("AphC", Kind::U16),
    ("ASf", Kind::I16),
    ("PPVphAB", Kind::U16),
    ("PPVphBC", Kind::U16),
    ("PPVphCA", Kind::U16),
    ("PhVphA", Kind::U16),
    ("PhVphB", Kind::U16),
    ("PhVphC", Kind::U16),
    ("VSf", Kind::I16),
    (W, Kind::I16),
    (W_SF, Kind::I16),
    ("Hz", Kind::U16),
    ("HzSf", Kind::I16),
    ("VA", Kind::I16),
    ("VASf", Kind::I16),
    (VAR, Kind::I16),
    (VAR_SF, Kind::I16),
    ("PF", Kind::I16),
    ("PFSf", Kind::I16),
    ("WH", Kind::Acc32),
    ("WHSf", Kind::I16),
    ("DCA", Kind::U16),
    ("DCASf", Kind::I16),
    ("DCV", Kind::U16),
    ("DCVSf", Kind::I16),
    ("DCW", Kind::I16),
    ("DCWSf", Kind::I16),
    ("TmpCab", Kind::I16),
    ("TmpSnk", Kind::I16),
    ("TmpTrns", Kind::I16),
    ("TmpOt", Kind::I16),
    ("TmpSf", Kind::I16),
    (ST, Kind::U16),
    ("StVnd", Kind::U16),
];

fn inverter_block(set: &ChannelSet) -> Result<Vec<RegisterElement>> {
    let mut address = INVERTER_BLOCK;
    let mut elements = Vec::with_capacity(BLOCK.len());
    for (id, kind) in BLOCK {
        let element = match kind {
            Kind::U16 => RegisterElement::unsigned_word(address),
            Kind::I16 => RegisterElement::signed_word(address),
            Kind::Acc32 => RegisterElement::unsigned_doubleword(address),
        }
        .to(&set.get(id)?);
        address += element.length();
        elements.push(element);
    }
    Ok(elements)
}

/// `value * 10^scale_factor`; absent if either part is absent or the product
/// does not fit the channel
fn scaled(set: &ChannelSet, value: &str, scale_factor: &str) -> Option<Value> {
    let raw = set.value(value)?;
    // SunSpec marks unimplemented scale factors with 0x8000
    let sf = set
        .value(scale_factor)?
        .as_i64()
        .filter(|sf| (-10..=10).contains(sf))?;
    ElementToChannelConverter::ScaleFactor(sf as i32)
        .element_to_channel(&raw, ValueType::Integer)
        .ok()
}

/// Refresh the values derived from the committed block
fn derive(set: &ChannelSet) -> Result<()> {
    let fault = InverterState::from_value(set.value(ST).as_ref()) == InverterState::Fault;
    set.get(INVERTER_FAULT)?.update_value(Some(Value::Boolean(fault)))?;
    set.get(ACTIVE_POWER)?.update_value(scaled(set, W, W_SF))?;
    set.get(REACTIVE_POWER)?.update_value(scaled(set, VAR, VAR_SF))?;
    Ok(())
}

pub struct Refu88k {
    id: String,
    channels: Arc<ChannelSet>,
    scheduler: TaskScheduler,
    health: ThingStateChannels,
    logger: StructuredLogger,
}

impl std::fmt::Debug for Refu88k {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refu88k")
            .field("id", &self.id)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Refu88k {
    pub fn new(config: &DeviceConfig, bridge: &BridgeConfig, transport: SharedTransport) -> Result<Self> {
        let mut set = ChannelSet::new(&config.id);
        set.add_specs(COMMON_CHANNELS)?;
        set.add_specs(CHANNELS)?;

        let mut protocol = ModbusProtocol::new(bridge.max_registers_per_task);
        protocol.add_read_tasks(Priority::High, inverter_block(&set)?)?;
        protocol.add_task(Task::write_single(
            RegisterElement::signed_word(PCS_SET_OPERATION_ADDRESS).to(&set.get(PCS_SET_OPERATION)?),
        )?)?;

        let health = ThingStateChannels::new(set.get(STATE)?)?;
        health.add_fault_channel(&set.get(INVERTER_FAULT)?)?;
        health.add_warning_channel(&set.get(super::COMMUNICATION_FAILED)?)?;

        let scheduler = build_scheduler(config, bridge, protocol, transport, &set)?;
        Ok(Self {
            id: config.id.clone(),
            channels: Arc::new(set),
            scheduler,
            health,
            logger: device_logger(config),
        })
    }
}

#[async_trait::async_trait]
impl Device for Refu88k {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Refu88k
    }

    fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    fn thing_state(&self) -> &ThingStateChannels {
        &self.health
    }

    fn task_summaries(&self) -> Vec<TaskSummary> {
        self.scheduler.task_summaries()
    }

    async fn tick(&mut self, _now: Instant) {
        self.scheduler.execute_reads().await;
        self.channels.commit_all();
        if let Err(e) = derive(&self.channels) {
            self.logger
                .warn(&format!("Cannot derive inverter power: {}", e));
        }
        self.scheduler.execute_writes().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> ChannelSet {
        let mut set = ChannelSet::new("inverter0");
        set.add_specs(CHANNELS).unwrap();
        set
    }

    #[test]
    fn inverter_block_layout() {
        let set = set();
        let task = Task::read(Priority::High, inverter_block(&set).unwrap()).unwrap();
        assert_eq!(task.start(), 40071);
        assert_eq!(task.length(), 38);
        let st = task
            .elements()
            .iter()
            .find(|e| e.channels().iter().any(|c| c.id() == ST))
            .unwrap();
        assert_eq!(st.address(), 40107);
    }

    #[test]
    fn power_uses_scale_factors() {
        let set = set();
        set.get(W).unwrap().update_value(Some(1234.into())).unwrap();
        set.get(W_SF).unwrap().update_value(Some((-1).into())).unwrap();
        set.get(VAR).unwrap().update_value(Some((-50).into())).unwrap();
        set.get(VAR_SF).unwrap().update_value(Some(2.into())).unwrap();
        set.get(ST).unwrap().update_value(Some(7.into())).unwrap();
        derive(&set).unwrap();
        assert_eq!(set.value(ACTIVE_POWER), Some(Value::Integer(123)));
        assert_eq!(set.value(REACTIVE_POWER), Some(Value::Integer(-5000)));
        assert!(set.is_true(INVERTER_FAULT));
    }

    #[test]
    fn power_is_absent_without_scale_factor() {
        let set = set();
        set.get(W).unwrap().update_value(Some(10.into())).unwrap();
        derive(&set).unwrap();
        assert_eq!(set.value(ACTIVE_POWER), None);
        assert!(!set.is_true(INVERTER_FAULT));

        set.get(W_SF).unwrap().update_value(Some((-32768).into())).unwrap();
        derive(&set).unwrap();
        assert_eq!(set.value(ACTIVE_POWER), None);
    }

    #[test]
    fn power_is_absent_when_scaled_value_overflows() {
        let set = set();
        set.get(W).unwrap().update_value(Some(30000.into())).unwrap();
        set.get(W_SF).unwrap().update_value(Some(10.into())).unwrap();
        set.get(VAR).unwrap().update_value(Some(7.into())).unwrap();
        set.get(VAR_SF).unwrap().update_value(Some(0.into())).unwrap();
        derive(&set).unwrap();
        assert_eq!(set.value(ACTIVE_POWER), None);
        assert_eq!(set.value(REACTIVE_POWER), Some(Value::Integer(7)));
    }
}
