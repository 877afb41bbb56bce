//! Tick driver
//!
//! Owns the bridges and devices built from the configuration and ticks
//! every device once per control cycle. Each device runs its tick in its
//! own task behind an owned async mutex, so a slow device never delays the
//! others. If the previous tick of a device is still running when the next
//! cycle starts, that cycle is dropped for the device and counted as an
//! overrun.

use crate::channel::{Channel, ChannelSet, ListenerId, OptionsEnum, Value};
use crate::config::{Config, DeviceConfig, DeviceKind};
use crate::device::{Device, READY_FOR_WORKING, STATE_MACHINE, create_device};
use crate::error::{Result, VoltaicError};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::{ModbusConnectionManager, ModbusLike};
use crate::protocol::{SharedTransport, TaskSummary};
use crate::state_machine::State;
use crate::thing_state::{ThingState, ThingStateChannels};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// A device registered with the runtime
struct DeviceEntry {
    id: String,
    kind: DeviceKind,
    channels: Arc<ChannelSet>,
    health: ThingStateChannels,
    device: Arc<Mutex<Box<dyn Device>>>,
    ticks: AtomicU64,
    overruns: AtomicU64,
}

impl DeviceEntry {
    fn new(device: Box<dyn Device>) -> Self {
        Self {
            id: device.id().to_string(),
            kind: device.kind(),
            channels: Arc::clone(device.channels()),
            health: device.thing_state().clone(),
            device: Arc::new(Mutex::new(device)),
            ticks: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }
}

/// Point-in-time view of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub kind: DeviceKind,
    pub state: ThingState,
    pub state_machine: Option<State>,
    pub ready_for_working: Option<bool>,
    pub active_faults: Vec<String>,
    pub active_warnings: Vec<String>,
    pub ticks: u64,
    pub overruns: u64,
    pub tasks: Vec<TaskSummary>,
}

/// Cloneable access to the running devices
#[derive(Clone, Default)]
pub struct RuntimeHandle {
    devices: Arc<RwLock<Vec<Arc<DeviceEntry>>>>,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("devices", &self.device_ids())
            .finish()
    }
}

impl RuntimeHandle {
    fn entries(&self) -> Vec<Arc<DeviceEntry>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn entry(&self, device_id: &str) -> Result<Arc<DeviceEntry>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.id == device_id)
            .cloned()
            .ok_or_else(|| VoltaicError::not_found(format!("Unknown device '{}'", device_id)))
    }

    /// Register a device; it is ticked from the next cycle on
    pub fn add_device(&self, device: Box<dyn Device>) -> Result<()> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.iter().any(|e| e.id == device.id()) {
            return Err(VoltaicError::configuration(format!(
                "Device '{}' is already registered",
                device.id()
            )));
        }
        devices.push(Arc::new(DeviceEntry::new(device)));
        Ok(())
    }

    /// Ids of all registered devices, in tick order
    pub fn device_ids(&self) -> Vec<String> {
        self.entries().iter().map(|e| e.id.clone()).collect()
    }

    /// Channel set of a device
    pub fn channels(&self, device_id: &str) -> Result<Arc<ChannelSet>> {
        Ok(Arc::clone(&self.entry(device_id)?.channels))
    }

    /// Committed value of a readable channel
    pub fn get_value(&self, device_id: &str, channel_id: &str) -> Result<Option<Value>> {
        self.channels(device_id)?.get(channel_id)?.read_value()
    }

    /// Stage a write; the device sends it on its next write phase
    pub fn set_next_write_value(&self, device_id: &str, channel_id: &str, value: Value) -> Result<()> {
        self.channels(device_id)?
            .get(channel_id)?
            .set_next_write_value(value)
    }

    /// Stage a write from a JSON value, typed by the channel
    pub fn set_next_write_json(
        &self,
        device_id: &str,
        channel_id: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let channel = self.channels(device_id)?.get(channel_id)?;
        if !channel.doc().access.is_writable() {
            return Err(VoltaicError::access_mode(format!(
                "Channel {} is not writable",
                channel.address()
            )));
        }
        let value = Value::from_json(value, channel.doc().value_type)?;
        channel.set_next_write_value(value)
    }

    /// Register a change listener on a channel
    pub fn subscribe<F>(&self, device_id: &str, channel_id: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        self.channels(device_id)?.subscribe(channel_id, listener)
    }

    /// Stop ticking a device from the next cycle on
    pub fn remove_device(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let before = devices.len();
        devices.retain(|e| e.id != device_id);
        devices.len() != before
    }

    pub async fn device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let entry = self.entry(device_id)?;
        let tasks = entry.device.lock().await.task_summaries();
        let names = |channels: Vec<Arc<Channel>>| -> Vec<String> {
            channels.iter().map(|c| c.id().to_string()).collect()
        };
        Ok(DeviceStatus {
            id: entry.id.clone(),
            kind: entry.kind,
            state: entry.health.state(),
            state_machine: entry
                .channels
                .contains(STATE_MACHINE)
                .then(|| State::from_value(entry.channels.value(STATE_MACHINE).as_ref())),
            ready_for_working: entry
                .channels
                .contains(READY_FOR_WORKING)
                .then(|| entry.channels.is_true(READY_FOR_WORKING)),
            active_faults: names(entry.health.active_faults()),
            active_warnings: names(entry.health.active_warnings()),
            ticks: entry.ticks.load(Ordering::Relaxed),
            overruns: entry.overruns.load(Ordering::Relaxed),
            tasks,
        })
    }
}

pub struct Runtime {
    cycle: Duration,
    handle: RuntimeHandle,
    logger: StructuredLogger,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("cycle", &self.cycle)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build bridges and devices from the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let transports = config
            .bridges
            .iter()
            .map(|bridge| {
                let transport: Box<dyn ModbusLike> = Box::new(ModbusConnectionManager::new(bridge));
                (bridge.id.clone(), Arc::new(Mutex::new(transport)))
            })
            .collect();
        Self::with_transports(config, transports)
    }

    /// Build devices on caller supplied transports, keyed by bridge id
    pub fn with_transports(config: &Config, transports: HashMap<String, SharedTransport>) -> Result<Self> {
        let logger = get_logger("runtime");
        let runtime = Self {
            cycle: Duration::from_millis(config.cycle_time_ms.max(1)),
            handle: RuntimeHandle::default(),
            logger,
        };

        // Inverters first: the shutdown bypass of a battery watches them
        let mut enabled: Vec<&DeviceConfig> = config.devices.iter().filter(|d| d.enabled).collect();
        enabled.sort_by_key(|d| d.kind != DeviceKind::Refu88k);

        let mut inverters: HashMap<&str, Arc<ChannelSet>> = HashMap::new();
        for device_config in enabled {
            let bridge = config.bridge(&device_config.bridge_id).ok_or_else(|| {
                VoltaicError::configuration(format!(
                    "Device '{}' references unknown bridge '{}'",
                    device_config.id, device_config.bridge_id
                ))
            })?;
            let transport = transports.get(&bridge.id).cloned().ok_or_else(|| {
                VoltaicError::configuration(format!("No transport for bridge '{}'", bridge.id))
            })?;
            let inverter = match device_config.shutdown.inverter_id.as_deref() {
                Some(id) => Some(inverters.get(id).cloned().ok_or_else(|| {
                    VoltaicError::configuration(format!(
                        "Device '{}' watches inverter '{}', which is not an enabled REFU 88K",
                        device_config.id, id
                    ))
                })?),
                None => None,
            };

            let device = create_device(device_config, bridge, transport, inverter)?;
            if device_config.kind == DeviceKind::Refu88k {
                inverters.insert(device_config.id.as_str(), Arc::clone(device.channels()));
            }
            runtime.logger.info(&format!(
                "Registered {:?} device '{}' on bridge '{}' (unit {})",
                device_config.kind, device_config.id, bridge.id, device_config.unit_id
            ));
            runtime.handle.add_device(device)?;
        }
        Ok(runtime)
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    pub const fn cycle(&self) -> Duration {
        self.cycle
    }

    /// Start one tick per device. Devices still busy with their previous
    /// tick are skipped and get an overrun counted.
    pub fn tick_all(&self) -> Vec<JoinHandle<()>> {
        let now = Instant::now();
        let mut started = Vec::new();
        for entry in self.handle.entries() {
            match Arc::clone(&entry.device).try_lock_owned() {
                Ok(mut device) => {
                    started.push(tokio::spawn(async move {
                        device.tick(now).await;
                        entry.ticks.fetch_add(1, Ordering::Relaxed);
                    }));
                }
                Err(_) => {
                    let overruns = entry.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                    self.logger.warn(&format!(
                        "Device '{}' still busy, cycle skipped ({} overruns)",
                        entry.id, overruns
                    ));
                }
            }
        }
        started
    }

    /// Tick until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                get_logger("runtime").error(&format!("Cannot listen for Ctrl-C: {}", e));
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Tick until `shutdown` completes, then wait for in-flight ticks
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.logger.info(&format!(
            "Runtime starting with {} devices, cycle {} ms",
            self.handle.device_ids().len(),
            self.cycle.as_millis()
        ));
        let mut ticker = interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.extend(self.tick_all());
                }
                () = &mut shutdown => break,
            }
        }

        self.logger.info("Shutdown requested, waiting for running ticks");
        for handle in in_flight {
            if let Err(e) = handle.await {
                self.logger.error(&format!("Device tick aborted: {}", e));
            }
        }
        self.logger.info("Runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDoc, ValueType};
    use crate::device::{COMMON_CHANNELS, STATE};

    struct Slow {
        id: String,
        channels: Arc<ChannelSet>,
        health: ThingStateChannels,
        pause: Duration,
    }

    impl Slow {
        fn new(id: &str, pause: Duration) -> Self {
            let mut set = ChannelSet::new(id);
            set.add_specs(COMMON_CHANNELS).unwrap();
            set.add(
                "Setpoint",
                ChannelDoc::of(ValueType::Integer).access(crate::channel::AccessMode::ReadWrite),
            )
            .unwrap();
            let health = ThingStateChannels::new(set.get(STATE).unwrap()).unwrap();
            Self {
                id: id.to_string(),
                channels: Arc::new(set),
                health,
                pause,
            }
        }
    }

    #[async_trait::async_trait]
    impl Device for Slow {
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
            Vec::new()
        }
        async fn tick(&mut self, _now: Instant) {
            tokio::time::sleep(self.pause).await;
        }
    }

    fn runtime_with(devices: Vec<Box<dyn Device>>) -> Runtime {
        let runtime = Runtime {
            cycle: Duration::from_millis(10),
            handle: RuntimeHandle::default(),
            logger: get_logger("runtime"),
        };
        for device in devices {
            runtime.handle.add_device(device).unwrap();
        }
        runtime
    }

    #[tokio::test]
    async fn busy_device_counts_overrun() {
        let runtime = runtime_with(vec![Box::new(Slow::new("slow", Duration::from_millis(200)))]);
        let first = runtime.tick_all();
        assert_eq!(first.len(), 1);
        assert!(runtime.tick_all().is_empty());
        for h in first {
            h.await.unwrap();
        }
        let status = runtime.handle().device_status("slow").await.unwrap();
        assert_eq!(status.overruns, 1);
        assert_eq!(status.ticks, 1);
        assert_eq!(status.state_machine, None);
    }

    #[tokio::test]
    async fn removed_device_is_not_ticked() {
        let runtime = runtime_with(vec![
            Box::new(Slow::new("a", Duration::ZERO)),
            Box::new(Slow::new("b", Duration::ZERO)),
        ]);
        assert!(runtime.handle().remove_device("a"));
        assert!(!runtime.handle().remove_device("a"));
        assert_eq!(runtime.tick_all().len(), 1);
        assert_eq!(runtime.handle().device_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let runtime = runtime_with(vec![Box::new(Slow::new("a", Duration::ZERO))]);
        assert!(runtime.handle.add_device(Box::new(Slow::new("a", Duration::ZERO))).is_err());
    }

    #[test]
    fn handle_reads_and_stages_writes() {
        let runtime = runtime_with(vec![Box::new(Slow::new("a", Duration::ZERO))]);
        let handle = runtime.handle();
        handle
            .set_next_write_json("a", "Setpoint", &serde_json::json!(42))
            .unwrap();
        let channel = handle.channels("a").unwrap().get("Setpoint").unwrap();
        assert_eq!(channel.next_write_value(), Some(Value::Integer(42)));
        assert!(matches!(
            handle.set_next_write_json("a", STATE, &serde_json::json!(0)),
            Err(VoltaicError::AccessMode { .. })
        ));
        assert!(matches!(
            handle.get_value("nope", STATE),
            Err(VoltaicError::NotFound { .. })
        ));
        assert_eq!(handle.get_value("a", "Setpoint").unwrap(), None);
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let runtime = runtime_with(vec![Box::new(Slow::new("a", Duration::ZERO))]);
        runtime
            .run_until(tokio::time::sleep(Duration::from_millis(35)))
            .await
            .unwrap();
        let status = runtime.handle().device_status("a").await.unwrap();
        assert!(status.ticks >= 1);
    }
}
