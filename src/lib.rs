//! # Voltaic - Modbus battery and inverter supervision
//!
//! Edge runtime that polls battery management systems and battery
//! inverters over Modbus TCP, models their registers as typed channels and
//! supervises each battery with a start/stop/recover state machine.
//!
//! ## Architecture
//!
//! - `channel`: typed channels, values and per-device channel sets
//! - `protocol`: register elements, converters, tasks and the scheduler
//! - `modbus`: Modbus TCP client with reconnection
//! - `thing_state`: hierarchical RUN / WARNING / FAULT aggregation
//! - `state_machine`: pure supervisory state machine
//! - `device`: BYD C130, BMW and REFU 88K drivers
//! - `runtime`: per-cycle tick driver and handle for callers
//! - `web`: HTTP API (feature `web`)
//! - `config`, `logging`, `error`: ambient plumbing

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod protocol;
pub mod runtime;
pub mod state_machine;
pub mod thing_state;
#[cfg(feature = "web")]
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, VoltaicError};
pub use runtime::{Runtime, RuntimeHandle};
