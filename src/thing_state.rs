//! Hierarchical health aggregation
//!
//! A [`ThingStateChannels`] node reduces boolean fault and warning channels,
//! plus any number of child nodes, into one [`ThingState`]. The result lives in
//! an ordinary read-only channel, so a node can be nested below another node
//! and its health can be read like any other data point.
//!
//! FAULT anywhere in a subtree outranks WARNING anywhere in it, which in turn
//! outranks RUN.

use crate::channel::{Channel, ChannelAddress, ListenerId, Options, OptionsEnum, Value, ValueType};
use crate::error::{Result, VoltaicError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Aggregated health of a device or subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThingState {
    Run,
    Warning,
    Fault,
}

impl OptionsEnum for ThingState {
    const OPTIONS: Options = &[(0, "Run"), (1, "Warning"), (2, "Fault")];

    fn value(self) -> i32 {
        match self {
            Self::Run => 0,
            Self::Warning => 1,
            Self::Fault => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Warning => "Warning",
            Self::Fault => "Fault",
        }
    }

    // health channels are evaluated on construction, so this only covers
    // foreign channels that never carried a value
    fn undefined() -> Self {
        Self::Run
    }

    fn all() -> &'static [Self] {
        &[Self::Run, Self::Warning, Self::Fault]
    }
}

impl fmt::Display for ThingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Registration {
    channel: Arc<Channel>,
    listener: ListenerId,
}

struct ChildRegistration {
    child: ThingStateChannels,
    listener: ListenerId,
}

#[derive(Default)]
struct Registry {
    faults: Vec<Registration>,
    warnings: Vec<Registration>,
    children: Vec<ChildRegistration>,
    addresses: HashSet<ChannelAddress>,
    parents: Vec<Weak<Inner>>,
}

struct Inner {
    channel: Arc<Channel>,
    registry: Mutex<Registry>,
    logger: StructuredLogger,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self) {
        let state = self.compute();
        // publish outside the registry lock; parents re-evaluate from here
        if let Err(e) = self.publish(state) {
            self.logger
                .warn(&format!("Failed to publish health {}: {}", state, e));
        }
    }

    fn compute(&self) -> ThingState {
        let registry = self.lock();
        let child_states: Vec<ThingState> =
            registry.children.iter().map(|c| c.child.state()).collect();
        let fault = child_states.contains(&ThingState::Fault)
            || registry.faults.iter().any(|r| r.channel.is_true());
        let warning = child_states.contains(&ThingState::Warning)
            || registry.warnings.iter().any(|r| r.channel.is_true());
        if fault {
            ThingState::Fault
        } else if warning {
            ThingState::Warning
        } else {
            ThingState::Run
        }
    }

    fn publish(&self, state: ThingState) -> Result<bool> {
        self.channel
            .update_value(Some(Value::Integer(state.value())))
    }
}

/// One node of a health tree
#[derive(Clone)]
pub struct ThingStateChannels {
    inner: Arc<Inner>,
}

impl fmt::Debug for ThingStateChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThingStateChannels")
            .field("address", self.inner.channel.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ThingStateChannels {
    /// Build a node publishing into `channel`, which must be an integer
    /// channel. The node starts out evaluated as RUN.
    pub fn new(channel: Arc<Channel>) -> Result<Self> {
        if channel.doc().value_type != ValueType::Integer {
            return Err(VoltaicError::configuration(format!(
                "health channel {} must be an integer channel",
                channel.address()
            )));
        }
        let address = channel.address();
        let logger = get_logger_with_context(
            LogContext::new("thing_state")
                .with_device_id(&address.component)
                .with_field("node", address.channel.clone()),
        );
        let node = Self {
            inner: Arc::new(Inner {
                channel,
                registry: Mutex::new(Registry::default()),
                logger,
            }),
        };
        node.inner.evaluate();
        Ok(node)
    }

    /// Channel carrying this node's health
    pub fn channel(&self) -> &Arc<Channel> {
        &self.inner.channel
    }

    pub fn state(&self) -> ThingState {
        ThingState::from_value(self.inner.channel.value().as_ref())
    }

    pub fn add_fault_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        self.add_contributor(channel, true)
    }

    pub fn add_warning_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        self.add_contributor(channel, false)
    }

    fn add_contributor(&self, channel: &Arc<Channel>, fault: bool) -> Result<()> {
        if channel.doc().value_type != ValueType::Boolean {
            return Err(VoltaicError::configuration(format!(
                "channel {} is not boolean",
                channel.address()
            )));
        }
        if self.tree_addresses().contains(channel.address()) {
            return Err(already_registered(channel.address()));
        }
        {
            let mut registry = self.inner.lock();
            let listener = self.subscribe(channel);
            registry.addresses.insert(channel.address().clone());
            let registration = Registration {
                channel: Arc::clone(channel),
                listener,
            };
            if fault {
                registry.faults.push(registration);
            } else {
                registry.warnings.push(registration);
            }
        }
        self.inner.evaluate();
        Ok(())
    }

    pub fn remove_fault_channel(&self, channel: &Channel) -> bool {
        self.remove_contributor(channel, true)
    }

    pub fn remove_warning_channel(&self, channel: &Channel) -> bool {
        self.remove_contributor(channel, false)
    }

    fn remove_contributor(&self, channel: &Channel, fault: bool) -> bool {
        let removed = {
            let mut registry = self.inner.lock();
            let list = if fault {
                &mut registry.faults
            } else {
                &mut registry.warnings
            };
            let Some(pos) = list
                .iter()
                .position(|r| r.channel.address() == channel.address())
            else {
                return false;
            };
            let registration = list.remove(pos);
            registry.addresses.remove(channel.address());
            registration
        };
        removed.channel.remove_listener(removed.listener);
        self.inner.evaluate();
        true
    }

    /// Nest another node below this one
    pub fn add_child_channel(&self, child: &Self) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &child.inner) || child.contains(self) {
            return Err(VoltaicError::configuration(format!(
                "adding {} below {} would create a cycle",
                child.channel().address(),
                self.channel().address()
            )));
        }
        let taken = self.tree_addresses();
        let mut incoming: Vec<_> = child.subtree_addresses().into_iter().collect();
        incoming.sort();
        if let Some(address) = incoming.iter().find(|a| taken.contains(*a)) {
            return Err(already_registered(address));
        }
        {
            let mut registry = self.inner.lock();
            let listener = self.subscribe(child.channel());
            registry.addresses.insert(child.channel().address().clone());
            registry.children.push(ChildRegistration {
                child: child.clone(),
                listener,
            });
        }
        child
            .inner
            .lock()
            .parents
            .push(Arc::downgrade(&self.inner));
        self.inner.evaluate();
        Ok(())
    }

    pub fn remove_child_channel(&self, child: &Self) -> bool {
        let removed = {
            let mut registry = self.inner.lock();
            let Some(pos) = registry
                .children
                .iter()
                .position(|c| Arc::ptr_eq(&c.child.inner, &child.inner))
            else {
                return false;
            };
            let registration = registry.children.remove(pos);
            registry.addresses.remove(child.channel().address());
            registration
        };
        removed.child.channel().remove_listener(removed.listener);
        removed
            .child
            .inner
            .lock()
            .parents
            .retain(|p| p.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, &self.inner)));
        self.inner.evaluate();
        true
    }

    /// Every fault channel in this subtree
    pub fn fault_channels(&self) -> Vec<Arc<Channel>> {
        let (mut own, children) = {
            let registry = self.inner.lock();
            let own: Vec<_> = registry
                .faults
                .iter()
                .map(|r| Arc::clone(&r.channel))
                .collect();
            (own, self.child_nodes_locked(&registry))
        };
        for child in children {
            own.extend(child.fault_channels());
        }
        own
    }

    /// Every warning channel in this subtree
    pub fn warning_channels(&self) -> Vec<Arc<Channel>> {
        let (mut own, children) = {
            let registry = self.inner.lock();
            let own: Vec<_> = registry
                .warnings
                .iter()
                .map(|r| Arc::clone(&r.channel))
                .collect();
            (own, self.child_nodes_locked(&registry))
        };
        for child in children {
            own.extend(child.warning_channels());
        }
        own
    }

    /// Contributors of this subtree that are currently true
    pub fn active_faults(&self) -> Vec<Arc<Channel>> {
        self.fault_channels()
            .into_iter()
            .filter(|c| c.is_true())
            .collect()
    }

    pub fn active_warnings(&self) -> Vec<Arc<Channel>> {
        self.warning_channels()
            .into_iter()
            .filter(|c| c.is_true())
            .collect()
    }

    fn child_nodes_locked(&self, registry: &Registry) -> Vec<Self> {
        registry.children.iter().map(|c| c.child.clone()).collect()
    }

    fn contains(&self, node: &Self) -> bool {
        let children = {
            let registry = self.inner.lock();
            self.child_nodes_locked(&registry)
        };
        children
            .iter()
            .any(|c| Arc::ptr_eq(&c.inner, &node.inner) || c.contains(node))
    }

    /// Addresses registered in this node and below, its own health channel
    /// included
    fn subtree_addresses(&self) -> HashSet<ChannelAddress> {
        let (mut addresses, children) = {
            let registry = self.inner.lock();
            (registry.addresses.clone(), self.child_nodes_locked(&registry))
        };
        addresses.insert(self.channel().address().clone());
        for child in children {
            addresses.extend(child.subtree_addresses());
        }
        addresses
    }

    /// Addresses registered anywhere in the trees this node belongs to
    fn tree_addresses(&self) -> HashSet<ChannelAddress> {
        let mut addresses = HashSet::new();
        for top in self.tops() {
            addresses.extend(top.subtree_addresses());
        }
        addresses
    }

    fn tops(&self) -> Vec<Self> {
        let parents: Vec<Arc<Inner>> = self
            .inner
            .lock()
            .parents
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        if parents.is_empty() {
            return vec![self.clone()];
        }
        parents
            .into_iter()
            .flat_map(|inner| Self { inner }.tops())
            .collect()
    }

    fn subscribe(&self, channel: &Arc<Channel>) -> ListenerId {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        channel.on_change(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.evaluate();
            }
        })
    }
}

fn already_registered(address: &ChannelAddress) -> VoltaicError {
    VoltaicError::configuration(format!(
        "a channel with the address [{}] is already registered",
        address
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDoc;

    fn flag(name: &str) -> Arc<Channel> {
        Arc::new(Channel::new(
            ChannelAddress::new("bms0", name),
            ChannelDoc::of(ValueType::Boolean),
        ))
    }

    fn node(name: &str) -> ThingStateChannels {
        ThingStateChannels::new(Arc::new(Channel::new(
            ChannelAddress::new("bms0", name),
            ChannelDoc::enumeration(ThingState::OPTIONS),
        )))
        .unwrap()
    }

    fn set(channel: &Channel, on: bool) {
        channel.update_value(Some(Value::Boolean(on))).unwrap();
    }

    #[test]
    fn starts_in_run() {
        assert_eq!(node("State").state(), ThingState::Run);
    }

    #[test]
    fn fault_and_warning_channels_drive_state() {
        let root = node("State");
        let fault = flag("Fault");
        let warning = flag("Warning");
        root.add_fault_channel(&fault).unwrap();
        root.add_warning_channel(&warning).unwrap();

        set(&warning, true);
        assert_eq!(root.state(), ThingState::Warning);
        set(&fault, true);
        assert_eq!(root.state(), ThingState::Fault);
        set(&fault, false);
        assert_eq!(root.state(), ThingState::Warning);
        set(&warning, false);
        assert_eq!(root.state(), ThingState::Run);
    }

    #[test]
    fn local_fault_outranks_child_warning() {
        let root = node("State");
        let child = node("ChildState");
        let child_warning = flag("ChildWarning");
        let fault = flag("Fault");
        child.add_warning_channel(&child_warning).unwrap();
        root.add_child_channel(&child).unwrap();
        root.add_fault_channel(&fault).unwrap();

        set(&child_warning, true);
        assert_eq!(root.state(), ThingState::Warning);
        set(&fault, true);
        assert_eq!(root.state(), ThingState::Fault);
    }

    #[test]
    fn subtree_duplicates_are_rejected() {
        let root = node("State");
        let child = node("ChildState");
        let shared = flag("Shared");
        root.add_fault_channel(&shared).unwrap();
        child.add_warning_channel(&shared).unwrap();
        let err = root.add_child_channel(&child).unwrap_err();
        assert!(matches!(err, VoltaicError::Configuration { .. }));
        assert!(root.warning_channels().is_empty());

        // registering below an attached child is checked against the whole tree
        let other = node("OtherState");
        root.add_child_channel(&other).unwrap();
        assert!(other.add_warning_channel(&shared).is_err());
        let leaf = flag("Leaf");
        other.add_fault_channel(&leaf).unwrap();
        assert!(root.add_warning_channel(&leaf).is_err());

        // detached nodes no longer share the tree
        assert!(root.remove_child_channel(&other));
        assert!(other.add_warning_channel(&shared).is_ok());
    }

    #[test]
    fn publish_reports_changes() {
        let root = node("State");
        assert!(root.inner.publish(ThingState::Warning).unwrap());
        assert!(!root.inner.publish(ThingState::Warning).unwrap());
        assert_eq!(root.state(), ThingState::Warning);
    }

    #[test]
    fn child_changes_propagate_through_levels() {
        let root = node("State");
        let mid = node("MidState");
        let leaf = node("LeafState");
        let fault = flag("LeafFault");
        leaf.add_fault_channel(&fault).unwrap();
        mid.add_child_channel(&leaf).unwrap();
        root.add_child_channel(&mid).unwrap();

        set(&fault, true);
        assert_eq!(root.state(), ThingState::Fault);
        set(&fault, false);
        assert_eq!(root.state(), ThingState::Run);
    }

    #[test]
    fn duplicate_address_is_rejected_and_existing_kept() {
        let root = node("State");
        let ch = flag("Shared");
        root.add_warning_channel(&ch).unwrap();
        let err = root.add_fault_channel(&ch).unwrap_err();
        assert!(matches!(err, VoltaicError::Configuration { .. }));
        assert_eq!(root.warning_channels().len(), 1);
        assert!(root.fault_channels().is_empty());
        set(&ch, true);
        assert_eq!(root.state(), ThingState::Warning);
    }

    #[test]
    fn removal_stops_contribution() {
        let root = node("State");
        let fault = flag("Fault");
        root.add_fault_channel(&fault).unwrap();
        set(&fault, true);
        assert!(root.remove_fault_channel(&fault));
        assert_eq!(root.state(), ThingState::Run);
        assert_eq!(fault.listener_count(), 0);
        // address may be reused after removal
        assert!(root.add_warning_channel(&fault).is_ok());
        assert_eq!(root.state(), ThingState::Warning);
    }

    #[test]
    fn removing_a_child_detaches_it() {
        let root = node("State");
        let child = node("ChildState");
        let fault = flag("Fault");
        child.add_fault_channel(&fault).unwrap();
        root.add_child_channel(&child).unwrap();
        set(&fault, true);
        assert_eq!(root.state(), ThingState::Fault);

        assert!(root.remove_child_channel(&child));
        assert!(!root.remove_child_channel(&child));
        assert_eq!(root.state(), ThingState::Run);
        set(&fault, false);
        set(&fault, true);
        assert_eq!(root.state(), ThingState::Run);
    }

    #[test]
    fn channel_lists_include_children() {
        let root = node("State");
        let child = node("ChildState");
        child.add_fault_channel(&flag("A")).unwrap();
        child.add_warning_channel(&flag("B")).unwrap();
        root.add_fault_channel(&flag("C")).unwrap();
        root.add_child_channel(&child).unwrap();
        assert_eq!(root.fault_channels().len(), 2);
        assert_eq!(root.warning_channels().len(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let a = node("A");
        let b = node("B");
        a.add_child_channel(&b).unwrap();
        assert!(b.add_child_channel(&a).is_err());
        assert!(a.add_child_channel(&a).is_err());
    }

    #[test]
    fn non_boolean_contributors_are_rejected() {
        let root = node("State");
        let ch = Arc::new(Channel::new(
            ChannelAddress::new("bms0", "Soc"),
            ChannelDoc::of(ValueType::Integer),
        ));
        assert!(root.add_fault_channel(&ch).is_err());
    }
}
