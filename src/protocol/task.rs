//! Modbus tasks and the per-device protocol that owns them

use super::element::RegisterElement;
use crate::error::{Result, VoltaicError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Largest register count of one FC3 request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest register count of one FC16 request
pub const MAX_WRITE_REGISTERS: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Read every cycle
    High,
    /// Read round-robin, a few per cycle
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FC3ReadRegisters { priority: Priority },
    FC6WriteRegister,
    FC16WriteRegisters,
}

impl TaskKind {
    pub const fn is_read(self) -> bool {
        matches!(self, Self::FC3ReadRegisters { .. })
    }

    const fn max_registers(self) -> u16 {
        match self {
            Self::FC3ReadRegisters { .. } => MAX_READ_REGISTERS,
            Self::FC6WriteRegister => 1,
            Self::FC16WriteRegisters => MAX_WRITE_REGISTERS,
        }
    }
}

/// Health of one task across cycles
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

/// One write request produced by draining a write task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: u16,
    pub words: Vec<u16>,
}

/// Outcome of draining a write task
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub requests: Vec<WriteRequest>,
    /// Elements whose pending value could not be encoded
    pub errors: Vec<(u16, VoltaicError)>,
}

/// A contiguous block of elements served by one request kind
#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    elements: Vec<RegisterElement>,
    stats: TaskStats,
}

impl Task {
    /// Create a task; the elements must tile a contiguous register range
    pub fn new(kind: TaskKind, elements: Vec<RegisterElement>) -> Result<Self> {
        let first = elements
            .first()
            .ok_or_else(|| VoltaicError::configuration("task without elements"))?;
        let start = first.address();
        let mut end = u32::from(start);
        for element in &elements {
            element.validate()?;
            if u32::from(element.address()) != end {
                return Err(VoltaicError::configuration(format!(
                    "element at {:#06x} is not contiguous with the previous element (expected {:#06x})",
                    element.address(),
                    end
                )));
            }
            end = element.end();
        }
        let length = end - u32::from(start);
        if length > u32::from(kind.max_registers()) {
            return Err(VoltaicError::configuration(format!(
                "task at {:#06x} covers {} registers, limit is {}",
                start,
                length,
                kind.max_registers()
            )));
        }
        if kind == TaskKind::FC6WriteRegister && elements.len() != 1 {
            return Err(VoltaicError::configuration(format!(
                "FC6 task at {:#06x} must hold exactly one element",
                start
            )));
        }
        if !kind.is_read() && elements.iter().any(RegisterElement::is_dummy) {
            return Err(VoltaicError::configuration(format!(
                "write task at {:#06x} contains a dummy element",
                start
            )));
        }
        Ok(Self {
            kind,
            elements,
            stats: TaskStats::default(),
        })
    }

    pub fn read(priority: Priority, elements: Vec<RegisterElement>) -> Result<Self> {
        Self::new(TaskKind::FC3ReadRegisters { priority }, elements)
    }

    pub fn write_single(element: RegisterElement) -> Result<Self> {
        Self::new(TaskKind::FC6WriteRegister, vec![element])
    }

    pub fn write_multiple(elements: Vec<RegisterElement>) -> Result<Self> {
        Self::new(TaskKind::FC16WriteRegisters, elements)
    }

    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    pub const fn priority(&self) -> Option<Priority> {
        match self.kind {
            TaskKind::FC3ReadRegisters { priority } => Some(priority),
            _ => None,
        }
    }

    /// First register address
    pub fn start(&self) -> u16 {
        self.elements.first().map_or(0, RegisterElement::address)
    }

    /// Number of registers covered
    pub fn length(&self) -> u16 {
        self.elements.iter().map(RegisterElement::length).sum()
    }

    pub fn elements(&self) -> &[RegisterElement] {
        &self.elements
    }

    pub const fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn record_success(&mut self) {
        self.stats.consecutive_failures = 0;
        self.stats.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &VoltaicError) {
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
        self.stats.total_failures = self.stats.total_failures.saturating_add(1);
        self.stats.last_error = Some(error.to_string());
    }

    /// Slice a read response per element and stage the decoded values.
    ///
    /// A short or long reply is a communication error for the whole task;
    /// conversion errors are returned per element and do not stop the others.
    pub fn apply_response(&self, words: &[u16]) -> Result<Vec<(u16, VoltaicError)>> {
        if words.len() != usize::from(self.length()) {
            return Err(VoltaicError::communication(format!(
                "task at {:#06x} expected {} registers, got {}",
                self.start(),
                self.length(),
                words.len()
            )));
        }
        let mut errors = Vec::new();
        let mut offset = 0usize;
        for element in &self.elements {
            let len = usize::from(element.length());
            if let Err(e) = element.apply_response(&words[offset..offset + len]) {
                errors.push((element.address(), e));
            }
            offset += len;
        }
        Ok(errors)
    }

    pub fn has_pending_write(&self) -> bool {
        self.elements.iter().any(RegisterElement::has_pending_write)
    }

    /// Drain all pending write values of this task into requests.
    ///
    /// Adjacent pending elements are merged; an element without a pending
    /// value splits the run so untouched registers are never rewritten.
    pub fn take_pending_writes(&self) -> PendingWrites {
        let mut out = PendingWrites::default();
        let mut run: Option<WriteRequest> = None;
        for element in &self.elements {
            match element.take_write_words() {
                Ok(Some(words)) => {
                    match run.as_mut() {
                        Some(current)
                            if u32::from(current.address) + current.words.len() as u32
                                == u32::from(element.address()) =>
                        {
                            current.words.extend(words);
                        }
                        _ => {
                            if let Some(done) = run.take() {
                                out.requests.push(done);
                            }
                            run = Some(WriteRequest {
                                address: element.address(),
                                words,
                            });
                        }
                    }
                }
                Ok(None) => {
                    if let Some(done) = run.take() {
                        out.requests.push(done);
                    }
                }
                Err(e) => {
                    if let Some(done) = run.take() {
                        out.requests.push(done);
                    }
                    out.errors.push((element.address(), e));
                }
            }
        }
        if let Some(done) = run {
            out.requests.push(done);
        }
        out
    }
}

/// All tasks of one device
#[derive(Debug)]
pub struct ModbusProtocol {
    max_registers: u16,
    read_tasks: Vec<Task>,
    write_tasks: Vec<Task>,
}

impl ModbusProtocol {
    pub fn new(max_registers: u16) -> Self {
        Self {
            max_registers: max_registers.clamp(1, MAX_READ_REGISTERS),
            read_tasks: Vec::new(),
            write_tasks: Vec::new(),
        }
    }

    pub const fn max_registers(&self) -> u16 {
        self.max_registers
    }

    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if task.kind().is_read() {
            if task.length() > self.max_registers {
                return Err(VoltaicError::configuration(format!(
                    "read task at {:#06x} covers {} registers, bridge limit is {}",
                    task.start(),
                    task.length(),
                    self.max_registers
                )));
            }
            self.read_tasks.push(task);
        } else {
            self.write_tasks.push(task);
        }
        Ok(())
    }

    /// Pack an ascending element run into bounded read tasks.
    ///
    /// Gaps are padded with dummies while the padded block still fits,
    /// otherwise a new task starts. Elements are never split and dummies
    /// at task boundaries are dropped. Returns the number of tasks added.
    pub fn add_read_tasks(&mut self, priority: Priority, elements: Vec<RegisterElement>) -> Result<usize> {
        let max = u32::from(self.max_registers);
        let mut chunks: Vec<Vec<RegisterElement>> = Vec::new();
        let mut current: Vec<RegisterElement> = Vec::new();
        let mut chunk_start = 0u32;
        let mut chunk_end = 0u32;

        for element in elements {
            element.validate()?;
            if u32::from(element.length()) > max {
                return Err(VoltaicError::configuration(format!(
                    "element at {:#06x} is larger than the task limit {}",
                    element.address(),
                    max
                )));
            }
            let address = u32::from(element.address());
            if current.is_empty() {
                chunk_start = address;
            } else if address < chunk_end {
                return Err(VoltaicError::configuration(format!(
                    "element at {:#06x} overlaps the previous element",
                    element.address()
                )));
            } else if element.end() - chunk_start > max {
                chunks.push(std::mem::take(&mut current));
                chunk_start = address;
            } else if address > chunk_end {
                // chunk_end < address <= u16::MAX, so both fit
                current.push(RegisterElement::dummy(chunk_end as u16, (address - 1) as u16));
            }
            chunk_end = element.end();
            current.push(element);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let mut added = 0;
        for mut chunk in chunks {
            while chunk.last().is_some_and(RegisterElement::is_dummy) {
                chunk.pop();
            }
            let leading = chunk.iter().take_while(|e| e.is_dummy()).count();
            chunk.drain(..leading);
            if chunk.is_empty() {
                continue;
            }
            self.add_task(Task::read(priority, chunk)?)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn read_tasks(&self) -> &[Task] {
        &self.read_tasks
    }

    pub fn write_tasks(&self) -> &[Task] {
        &self.write_tasks
    }

    pub(crate) fn read_task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.read_tasks.get_mut(index)
    }

    pub(crate) fn write_task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.write_tasks.get_mut(index)
    }

    /// Indices of read tasks with the given priority, in insertion order
    pub fn read_indices(&self, priority: Priority) -> Vec<usize> {
        self.read_tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.priority() == Some(priority))
            .map(|(i, _)| i)
            .collect()
    }
}
