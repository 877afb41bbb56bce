//! Per-device task scheduler
//!
//! Runs a device's read and write tasks against the bridge transport it
//! shares with other devices. Each request takes the bridge lock on its
//! own, so two devices on one bus interleave request by request and a bus
//! never carries two requests at once.

use super::task::{ModbusProtocol, Priority, Task, TaskKind, TaskStats};
use crate::channel::Channel;
use crate::error::{Result, VoltaicError};
use crate::logging::StructuredLogger;
use crate::modbus::ModbusLike;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transport of one bridge, shared by every device behind it
pub type SharedTransport = Arc<Mutex<Box<dyn ModbusLike>>>;

/// Result of one read or write pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub tasks_ok: usize,
    pub tasks_failed: usize,
    pub element_errors: usize,
}

impl CycleReport {
    pub const fn all_ok(&self) -> bool {
        self.tasks_failed == 0
    }
}

/// Statistics of one task as exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub start: u16,
    pub length: u16,
    pub kind: &'static str,
    pub priority: Option<Priority>,
    #[serde(flatten)]
    pub stats: TaskStats,
}

pub struct TaskScheduler {
    protocol: ModbusProtocol,
    unit_id: u8,
    transport: SharedTransport,
    low_per_cycle: usize,
    low_cursor: usize,
    failure_threshold: u32,
    failed_cycles: u32,
    write_failed: bool,
    communication_failed: Option<Arc<Channel>>,
    logger: StructuredLogger,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("unit_id", &self.unit_id)
            .field("read_tasks", &self.protocol.read_tasks().len())
            .field("write_tasks", &self.protocol.write_tasks().len())
            .field("failed_cycles", &self.failed_cycles)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub fn new(
        protocol: ModbusProtocol,
        unit_id: u8,
        transport: SharedTransport,
        low_per_cycle: usize,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            protocol,
            unit_id,
            transport,
            low_per_cycle,
            low_cursor: 0,
            failure_threshold: 1,
            failed_cycles: 0,
            write_failed: false,
            communication_failed: None,
            logger,
        }
    }

    /// Stage `channel` true after `cycles` consecutive cycles with a failed task
    pub fn with_communication_failed(mut self, channel: Arc<Channel>, cycles: u32) -> Self {
        self.communication_failed = Some(channel);
        self.failure_threshold = cycles.max(1);
        self
    }

    pub const fn protocol(&self) -> &ModbusProtocol {
        &self.protocol
    }

    pub const fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Consecutive cycles with at least one failed task
    pub const fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    /// Read tasks due in this cycle: every HIGH task, then the next LOW ones
    fn due_read_tasks(&mut self) -> Vec<usize> {
        let mut due = self.protocol.read_indices(Priority::High);
        let low = self.protocol.read_indices(Priority::Low);
        if !low.is_empty() {
            let take = self.low_per_cycle.min(low.len());
            for i in 0..take {
                due.push(low[(self.low_cursor + i) % low.len()]);
            }
            self.low_cursor = (self.low_cursor + take) % low.len();
        }
        due
    }

    /// Execute this cycle's read tasks and stage the decoded values.
    ///
    /// Nothing is committed here; the caller commits all channels at once.
    pub async fn execute_reads(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for index in self.due_read_tasks() {
            let Some(task) = self.protocol.read_task_mut(index) else {
                continue;
            };
            let (start, length) = (task.start(), task.length());
            let response = {
                let mut transport = self.transport.lock().await;
                transport
                    .read_holding_registers(self.unit_id, start, length)
                    .await
            };
            match response.and_then(|words| task.apply_response(&words)) {
                Ok(errors) => {
                    task.record_success();
                    report.tasks_ok += 1;
                    report.element_errors += errors.len();
                    for (address, e) in errors {
                        self.logger
                            .warn(&format!("Element {:#06x} skipped: {}", address, e));
                    }
                }
                Err(e) => {
                    task.record_failure(&e);
                    report.tasks_failed += 1;
                    log_task_failure(&self.logger, task, &e);
                }
            }
        }
        self.finish_cycle(&report);
        report
    }

    fn finish_cycle(&mut self, reads: &CycleReport) {
        let failed = !reads.all_ok() || std::mem::take(&mut self.write_failed);
        if failed {
            self.failed_cycles = self.failed_cycles.saturating_add(1);
        } else {
            self.failed_cycles = 0;
        }
        let Some(channel) = &self.communication_failed else {
            return;
        };
        let staged = if !failed {
            channel.set_next_value(false)
        } else if self.failed_cycles >= self.failure_threshold {
            channel.set_next_value(true)
        } else {
            Ok(())
        };
        if let Err(e) = staged {
            self.logger
                .error(&format!("Cannot stage CommunicationFailed: {}", e));
        }
    }

    /// Drain pending write values and send each write task at most once.
    ///
    /// Pending values are consumed whether or not the send succeeds.
    pub async fn execute_writes(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for index in 0..self.protocol.write_tasks().len() {
            let Some(task) = self.protocol.write_task_mut(index) else {
                continue;
            };
            if !task.has_pending_write() {
                continue;
            }
            let pending = task.take_pending_writes();
            report.element_errors += pending.errors.len();
            for (address, e) in &pending.errors {
                self.logger
                    .warn(&format!("Write to {:#06x} dropped: {}", address, e));
            }
            if pending.requests.is_empty() {
                continue;
            }

            let mut outcome: Result<()> = Ok(());
            {
                let mut transport = self.transport.lock().await;
                for request in &pending.requests {
                    let sent = match task.kind() {
                        TaskKind::FC6WriteRegister => match request.words.as_slice() {
                            [word] => {
                                transport
                                    .write_single_register(self.unit_id, request.address, *word)
                                    .await
                            }
                            _ => Err(VoltaicError::conversion(format!(
                                "FC6 write at {:#06x} needs one word, got {}",
                                request.address,
                                request.words.len()
                            ))),
                        },
                        _ => {
                            transport
                                .write_multiple_registers(
                                    self.unit_id,
                                    request.address,
                                    &request.words,
                                )
                                .await
                        }
                    };
                    if let Err(e) = sent {
                        outcome = Err(e);
                    }
                }
            }

            match outcome {
                Ok(()) => {
                    task.record_success();
                    report.tasks_ok += 1;
                }
                Err(e) => {
                    task.record_failure(&e);
                    report.tasks_failed += 1;
                    log_task_failure(&self.logger, task, &e);
                }
            }
        }
        if !report.all_ok() {
            self.write_failed = true;
        }
        report
    }

    /// Per-task statistics, reads first
    pub fn task_summaries(&self) -> Vec<TaskSummary> {
        self.protocol
            .read_tasks()
            .iter()
            .chain(self.protocol.write_tasks())
            .map(|task| TaskSummary {
                start: task.start(),
                length: task.length(),
                kind: match task.kind() {
                    TaskKind::FC3ReadRegisters { .. } => "fc3",
                    TaskKind::FC6WriteRegister => "fc6",
                    TaskKind::FC16WriteRegisters => "fc16",
                },
                priority: task.priority(),
                stats: task.stats().clone(),
            })
            .collect()
    }
}

fn log_task_failure(logger: &StructuredLogger, task: &Task, error: &VoltaicError) {
    let message = format!(
        "Task at {:#06x} ({} registers) failed ({} in a row): {}",
        task.start(),
        task.length(),
        task.stats().consecutive_failures,
        error
    );
    if task.stats().consecutive_failures <= 1 {
        logger.warn(&message);
    } else {
        logger.debug(&message);
    }
}
