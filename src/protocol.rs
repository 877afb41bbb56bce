//! Register protocol layer
//!
//! Elements describe how registers map onto channels, tasks group elements
//! into single Modbus requests, and the scheduler runs a device's tasks
//! against its bridge every cycle.

pub mod converter;
pub mod element;
pub mod scheduler;
pub mod task;

pub use converter::{
    ElementToChannelConverter, SCALE_FACTOR_1, SCALE_FACTOR_2, SCALE_FACTOR_3,
    SCALE_FACTOR_MINUS_1, SCALE_FACTOR_MINUS_2, apply_bit, extract_bit,
};
pub use element::{ElementKind, RegisterElement};
pub use scheduler::{CycleReport, SharedTransport, TaskScheduler, TaskSummary};
pub use task::{ModbusProtocol, Priority, Task, TaskKind, TaskStats, WriteRequest};
