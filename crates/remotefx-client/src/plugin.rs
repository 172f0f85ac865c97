//! Plugin chain bookkeeping
//!
//! The session mirrors the server's ordered plugin chain locally. Slot 0 is the
//! first processor.

use crate::parameter::Parameter;
use serde::{Deserialize, Serialize};

/// Plugin entry from the server's catalog (recents list, scan results).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPlugin {
    /// Catalog identifier, passed back in `add_plugin`.
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Vendor/author name
    #[serde(default)]
    pub company: String,

    /// Plugin format as reported by the server ("VST", "VST3", "AU", ...)
    #[serde(default, rename = "type")]
    pub plugin_type: String,

    #[serde(default)]
    pub category: String,
}

impl ServerPlugin {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = company.into();
        self
    }

    pub fn plugin_type(mut self, plugin_type: impl Into<String>) -> Self {
        self.plugin_type = plugin_type.into();
        self
    }
}

/// One loaded remote plugin.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PluginSlot {
    pub id: String,
    pub name: String,
    pub presets: Vec<String>,
    pub parameters: Vec<Parameter>,
    /// Opaque serialized plugin state, as last fetched or pushed.
    pub settings: String,
    pub bypassed: bool,
}

impl PluginSlot {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn parameter(&self, index: i32) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.index == index)
    }

    pub fn parameter_mut(&mut self, index: i32) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.index == index)
    }
}

/// Ordered plugin chain.
#[derive(Clone, Debug, Default)]
pub struct PluginChain {
    slots: Vec<PluginSlot>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[PluginSlot] {
        &self.slots
    }

    pub fn get(&self, idx: usize) -> Option<&PluginSlot> {
        self.slots.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PluginSlot> {
        self.slots.get_mut(idx)
    }

    pub fn push(&mut self, slot: PluginSlot) {
        self.slots.push(slot);
    }

    pub fn remove(&mut self, idx: usize) -> Option<PluginSlot> {
        (idx < self.slots.len()).then(|| self.slots.remove(idx))
    }

    /// Swaps two slots. Returns false if either index is out of range.
    pub fn exchange(&mut self, a: usize, b: usize) -> bool {
        if a >= self.slots.len() || b >= self.slots.len() {
            return false;
        }
        self.slots.swap(a, b);
        true
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn take(&mut self) -> Vec<PluginSlot> {
        std::mem::take(&mut self.slots)
    }

    /// `"A > B > C"`, for diagnostics.
    pub fn describe(&self) -> String {
        self.slots
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&str]) -> PluginChain {
        let mut chain = PluginChain::new();
        for name in names {
            chain.push(PluginSlot::new(format!("id.{name}"), *name));
        }
        chain
    }

    #[test]
    fn test_chain_exchange() {
        let mut c = chain(&["EQ", "Comp", "Reverb"]);
        assert!(c.exchange(0, 2));
        assert_eq!(c.describe(), "Reverb > Comp > EQ");
        assert!(!c.exchange(0, 3));
        assert_eq!(c.describe(), "Reverb > Comp > EQ");
    }

    #[test]
    fn test_chain_remove_out_of_range() {
        let mut c = chain(&["EQ"]);
        assert!(c.remove(1).is_none());
        assert_eq!(c.remove(0).map(|s| s.name), Some("EQ".to_string()));
        assert!(c.is_empty());
        assert_eq!(c.describe(), "");
    }

    #[test]
    fn test_server_plugin_serde() {
        let p = ServerPlugin::new("VST3-Reverb-1234", "Super Reverb")
            .company("TestCo")
            .plugin_type("VST3");
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains(r#""type":"VST3""#));
        let decoded: ServerPlugin = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, p);

        let sparse: ServerPlugin = serde_json::from_str(r#"{"id":"x","name":"X"}"#).unwrap();
        assert_eq!(sparse.company, "");
    }
}
