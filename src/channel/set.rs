//! Per-device channel collection and static channel catalogs

use super::{Channel, ChannelAddress, ChannelDoc, ListenerId, Value};
use crate::error::{Result, VoltaicError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One catalog entry: channel id plus its description
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub id: &'static str,
    pub doc: ChannelDoc,
}

impl ChannelSpec {
    pub const fn new(id: &'static str, doc: ChannelDoc) -> Self {
        Self { id, doc }
    }
}

/// Descriptor for a run of identical channels, e.g. per-cell voltages.
///
/// Generates ids `{prefix}{index:03}{suffix}` for `index` in `0..count`.
#[derive(Debug, Clone, Copy)]
pub struct CellArraySpec {
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub count: usize,
    pub doc: ChannelDoc,
}

impl CellArraySpec {
    pub fn channel_id(&self, index: usize) -> String {
        format!("{}{:03}{}", self.prefix, index, self.suffix)
    }
}

/// All channels of one device, keyed by channel id
#[derive(Debug)]
pub struct ChannelSet {
    component_id: String,
    channels: BTreeMap<String, Arc<Channel>>,
}

impl ChannelSet {
    pub fn new(component_id: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            channels: BTreeMap::new(),
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Create and register a channel
    pub fn add(&mut self, id: &str, doc: ChannelDoc) -> Result<Arc<Channel>> {
        if self.channels.contains_key(id) {
            return Err(VoltaicError::configuration(format!(
                "channel {}/{} declared twice",
                self.component_id, id
            )));
        }
        let channel = Arc::new(Channel::new(
            ChannelAddress::new(&self.component_id, id),
            doc,
        ));
        self.channels.insert(id.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Register every entry of a static catalog
    pub fn add_specs(&mut self, specs: &[ChannelSpec]) -> Result<()> {
        for spec in specs {
            self.add(spec.id, spec.doc)?;
        }
        Ok(())
    }

    /// Register a generated channel array, returning the channels in index order
    pub fn add_cell_array(&mut self, spec: &CellArraySpec) -> Result<Vec<Arc<Channel>>> {
        (0..spec.count)
            .map(|i| self.add(&spec.channel_id(i), spec.doc))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Arc<Channel>> {
        self.channels.get(id).cloned().ok_or_else(|| {
            VoltaicError::not_found(format!("channel {}/{}", self.component_id, id))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Committed value of a channel; unknown channels read as absent
    pub fn value(&self, id: &str) -> Option<Value> {
        self.channels.get(id).and_then(|c| c.value())
    }

    /// Committed boolean value; absent or unknown reads as false
    pub fn is_true(&self, id: &str) -> bool {
        self.channels.get(id).is_some_and(|c| c.is_true())
    }

    pub fn set_next_write_value<V: Into<Value>>(&self, id: &str, value: V) -> Result<()> {
        self.get(id)?.set_next_write_value(value)
    }

    pub fn subscribe<F>(&self, id: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        Ok(self.get(id)?.on_change(listener))
    }

    pub fn unsubscribe(&self, id: &str, listener: ListenerId) -> Result<bool> {
        Ok(self.get(id)?.remove_listener(listener))
    }

    /// Commit every channel; returns how many changed
    pub fn commit_all(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.commit_next_to_current())
            .count()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// JSON view of all readable channels
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (id, channel) in &self.channels {
            let doc = channel.doc();
            if !doc.access.is_readable() {
                continue;
            }
            let value = channel.value();
            let mut entry = serde_json::json!({
                "value": value,
                "unit": doc.unit.symbol(),
                "access": doc.access,
            });
            if let Some(name) = value.as_ref().and_then(|v| doc.option_name(v)) {
                entry["option"] = serde_json::json!(name);
            }
            map.insert(id.clone(), entry);
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AccessMode, Unit, ValueType};

    const SPECS: &[ChannelSpec] = &[
        ChannelSpec::new("Soc", ChannelDoc::of(ValueType::Integer).unit(Unit::Percent)),
        ChannelSpec::new(
            "Command",
            ChannelDoc::of(ValueType::Integer).access(AccessMode::ReadWrite),
        ),
    ];

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut set = ChannelSet::new("bms0");
        set.add_specs(SPECS).unwrap();
        assert!(set.add("Soc", ChannelDoc::of(ValueType::Integer)).is_err());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn cell_array_ids_are_generated() {
        let mut set = ChannelSet::new("bms0");
        let spec = CellArraySpec {
            prefix: "Cluster1Battery",
            suffix: "Voltage",
            count: 3,
            doc: ChannelDoc::of(ValueType::Integer).unit(Unit::Millivolt),
        };
        let cells = set.add_cell_array(&spec).unwrap();
        assert_eq!(cells.len(), 3);
        assert!(set.contains("Cluster1Battery002Voltage"));
        assert_eq!(cells[1].id(), "Cluster1Battery001Voltage");
    }

    #[test]
    fn commit_all_counts_changes() {
        let mut set = ChannelSet::new("bms0");
        set.add_specs(SPECS).unwrap();
        set.get("Soc").unwrap().set_next_value(55).unwrap();
        assert_eq!(set.commit_all(), 1);
        assert_eq!(set.commit_all(), 0);
        assert_eq!(set.value("Soc"), Some(Value::Integer(55)));
        assert_eq!(set.value("Missing"), None);
    }

    #[test]
    fn write_through_set_respects_access() {
        let mut set = ChannelSet::new("bms0");
        set.add_specs(SPECS).unwrap();
        assert!(set.set_next_write_value("Soc", 1).is_err());
        assert!(set.set_next_write_value("Command", 1).is_ok());
        assert!(set.set_next_write_value("Nope", 1).is_err());
    }

    #[test]
    fn snapshot_lists_values_and_units() {
        let mut set = ChannelSet::new("bms0");
        set.add_specs(SPECS).unwrap();
        set.get("Soc").unwrap().update_value(Some(Value::Integer(80))).unwrap();
        let snap = set.snapshot();
        assert_eq!(snap["Soc"]["value"], serde_json::json!(80));
        assert_eq!(snap["Soc"]["unit"], serde_json::json!("%"));
        assert!(snap["Command"]["value"].is_null());
    }
}
