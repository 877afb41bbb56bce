//! Channels: typed data points of a device
//!
//! A channel holds one committed value and one staged "next" value. Readers
//! only ever see the committed value; staged values become visible when the
//! control cycle commits them. Writable channels additionally carry a pending
//! write value that the task scheduler drains into outgoing write tasks.
//!
//! Change listeners are invoked on commit, after the channel's own lock has
//! been released, so a listener is free to read any channel (including the
//! one that fired) or to register further listeners.

mod set;
mod value;

pub use set::{CellArraySpec, ChannelSet, ChannelSpec};
pub use value::{Options, OptionsEnum, Unit, Value, ValueType};

use crate::error::{Result, VoltaicError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Access mode of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }

    pub const fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }
}

/// Static description of a channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelDoc {
    pub value_type: ValueType,
    pub unit: Unit,
    pub access: AccessMode,
    pub options: Option<Options>,
    pub text: &'static str,
}

impl ChannelDoc {
    /// Read-only channel of the given type without unit
    pub const fn of(value_type: ValueType) -> Self {
        Self {
            value_type,
            unit: Unit::None,
            access: AccessMode::ReadOnly,
            options: None,
            text: "",
        }
    }

    /// Read-only integer channel restricted to an option set
    pub const fn enumeration(options: Options) -> Self {
        Self {
            value_type: ValueType::Integer,
            unit: Unit::None,
            access: AccessMode::ReadOnly,
            options: Some(options),
            text: "",
        }
    }

    pub const fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub const fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub const fn text(mut self, text: &'static str) -> Self {
        self.text = text;
        self
    }

    /// Name of an option value, if this is an enum channel
    pub fn option_name(&self, value: &Value) -> Option<&'static str> {
        let raw = value.as_i64()?;
        self.options?
            .iter()
            .find(|(v, _)| i64::from(*v) == raw)
            .map(|(_, name)| *name)
    }
}

/// Globally unique channel address: `component/channel`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress {
    pub component: String,
    pub channel: String,
}

impl ChannelAddress {
    pub fn new(component: &str, channel: &str) -> Self {
        Self {
            component: component.to_string(),
            channel: channel.to_string(),
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component, self.channel)
    }
}

/// Callback invoked with (old, new) committed values
pub type ChannelListener = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

/// Handle returned on listener registration, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ChannelState {
    value: Option<Value>,
    next_value: Option<Value>,
    next_write_value: Option<Value>,
    listeners: Vec<(ListenerId, ChannelListener)>,
    next_listener_id: u64,
}

/// A typed data point
pub struct Channel {
    address: ChannelAddress,
    doc: ChannelDoc,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(address: ChannelAddress, doc: ChannelDoc) -> Self {
        Self {
            address,
            doc,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub const fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Channel id without the component prefix
    pub fn id(&self) -> &str {
        &self.address.channel
    }

    pub const fn doc(&self) -> &ChannelDoc {
        &self.doc
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed value; `None` if never received
    pub fn value(&self) -> Option<Value> {
        self.lock().value.clone()
    }

    /// Committed value, rejecting reads of write-only channels
    pub fn read_value(&self) -> Result<Option<Value>> {
        if !self.doc.access.is_readable() {
            return Err(VoltaicError::access_mode(format!(
                "channel {} is write-only",
                self.address
            )));
        }
        Ok(self.value())
    }

    /// Committed value interpreted as boolean; absent counts as false
    pub fn is_true(&self) -> bool {
        self.lock()
            .value
            .as_ref()
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Staged value that the next commit will publish
    pub fn next_value(&self) -> Option<Value> {
        self.lock().next_value.clone()
    }

    /// Stage a value; it becomes visible on the next commit
    pub fn set_next_value<V: Into<Value>>(&self, value: V) -> Result<()> {
        let value = value.into().coerce(self.doc.value_type).map_err(|e| {
            VoltaicError::conversion(format!("{}: {}", self.address, e))
        })?;
        self.lock().next_value = Some(value);
        Ok(())
    }

    /// Stage "absent"
    pub fn clear_next_value(&self) {
        self.lock().next_value = None;
    }

    /// Publish the staged value. Listeners fire only if the committed value
    /// actually changed; a transition to or from absent counts as a change.
    pub fn commit_next_to_current(&self) -> bool {
        let (old, new, listeners) = {
            let mut state = self.lock();
            if state.value == state.next_value {
                return false;
            }
            let new = state.next_value.clone();
            let old = std::mem::replace(&mut state.value, new.clone());
            let listeners: Vec<ChannelListener> =
                state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (old, new, listeners)
        };
        for listener in listeners {
            listener(old.as_ref(), new.as_ref());
        }
        true
    }

    /// Stage and commit in one step, for derived channels
    pub fn update_value(&self, value: Option<Value>) -> Result<bool> {
        match value {
            Some(v) => self.set_next_value(v)?,
            None => self.clear_next_value(),
        }
        Ok(self.commit_next_to_current())
    }

    /// Queue a value for the next outgoing write; last write wins
    pub fn set_next_write_value<V: Into<Value>>(&self, value: V) -> Result<()> {
        if !self.doc.access.is_writable() {
            return Err(VoltaicError::access_mode(format!(
                "channel {} is read-only",
                self.address
            )));
        }
        let value = value.into().coerce(self.doc.value_type).map_err(|e| {
            VoltaicError::conversion(format!("{}: {}", self.address, e))
        })?;
        self.lock().next_write_value = Some(value);
        Ok(())
    }

    /// Pending write value, without consuming it
    pub fn next_write_value(&self) -> Option<Value> {
        self.lock().next_write_value.clone()
    }

    /// Drain the pending write value
    pub fn take_next_write_value(&self) -> Option<Value> {
        self.lock().next_write_value.take()
    }

    pub fn has_pending_write(&self) -> bool {
        self.lock().next_write_value.is_some()
    }

    /// Register a change listener
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}
