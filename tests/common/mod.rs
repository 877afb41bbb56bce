#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use voltaic::error::{Result, VoltaicError};
use voltaic::modbus::ModbusLike;
use voltaic::protocol::SharedTransport;

/// One request seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { unit: u8, address: u16, count: u16 },
    WriteSingle { unit: u8, address: u16, value: u16 },
    WriteMultiple { unit: u8, address: u16, values: Vec<u16> },
}

#[derive(Default)]
struct MockState {
    registers: HashMap<(u8, u16), u16>,
    failing_reads: HashSet<u16>,
    offline: bool,
    fail_writes: bool,
    requests: Vec<Request>,
}

/// In-memory register map that records every request.
///
/// Clones share state, so a test keeps one clone to script registers and
/// inspect requests while the scheduler owns the other.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedTransport {
        let transport: Box<dyn ModbusLike> = Box::new(self.clone());
        Arc::new(tokio::sync::Mutex::new(transport))
    }

    pub fn set_register(&self, unit: u8, address: u16, value: u16) {
        self.state.lock().unwrap().registers.insert((unit, address), value);
    }

    pub fn set_registers(&self, unit: u8, address: u16, values: &[u16]) {
        for (i, v) in values.iter().enumerate() {
            self.set_register(unit, address + i as u16, *v);
        }
    }

    pub fn register(&self, unit: u8, address: u16) -> u16 {
        self.state
            .lock()
            .unwrap()
            .registers
            .get(&(unit, address))
            .copied()
            .unwrap_or(0)
    }

    /// Reads starting at `address` fail with a communication error
    pub fn fail_reads_at(&self, address: u16) {
        self.state.lock().unwrap().failing_reads.insert(address);
    }

    pub fn heal_reads_at(&self, address: u16) {
        self.state.lock().unwrap().failing_reads.remove(&address);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn reads(&self) -> Vec<u16> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Read { address, .. } => Some(address),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| !matches!(r, Request::Read { .. }))
            .collect()
    }
}

#[async_trait::async_trait]
impl ModbusLike for MockTransport {
    async fn read_holding_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(Request::Read { unit, address, count });
        if state.offline || state.failing_reads.contains(&address) {
            return Err(VoltaicError::communication(format!("no reply for {:#06x}", address)));
        }
        Ok((0..count)
            .map(|i| {
                state
                    .registers
                    .get(&(unit, address + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_single_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(Request::WriteSingle { unit, address, value });
        if state.offline || state.fail_writes {
            return Err(VoltaicError::timeout("write timed out"));
        }
        state.registers.insert((unit, address), value);
        Ok(())
    }

    async fn write_multiple_registers(&mut self, unit: u8, address: u16, values: &[u16]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(Request::WriteMultiple {
            unit,
            address,
            values: values.to_vec(),
        });
        if state.offline || state.fail_writes {
            return Err(VoltaicError::timeout("write timed out"));
        }
        for (i, v) in values.iter().enumerate() {
            state.registers.insert((unit, address + i as u16), *v);
        }
        Ok(())
    }
}
