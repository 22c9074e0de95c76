//! Port-based plugin output model.
//!
//! A plugin's output is a record of named ports; each port carries a list
//! of items whose `data` is a small, JSON-serializable value. Item metadata
//! records lineage (where an item came from) and is filled in by the input
//! gatherer when values are forwarded downstream.
//!
//! Two output keys are interpreted by the scheduler rather than treated as
//! ports: `branch` (a string selecting conditional routing) and the
//! standardized `{data, signal}` wrapping, where `signal` plays the same
//! role as `branch`.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default port name for outputs produced without an explicit port.
pub const MAIN_PORT: &str = "main";

/// Lineage of a forwarded item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_item_index: Option<usize>,
}

impl ItemMetadata {
    #[must_use]
    pub fn from_source(node: &str, port: Option<&str>, item_index: usize) -> Self {
        Self {
            source_node: Some(node.to_string()),
            source_port: port.map(str::to_string),
            source_item_index: Some(item_index),
        }
    }
}

/// One item on a port.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortItem {
    pub data: Value,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

impl PortItem {
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            metadata: ItemMetadata::default(),
        }
    }
}

/// The full output of one plugin execution: named ports plus the optional
/// branch selection the scheduler routes on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    ports: FxHashMap<String, Vec<PortItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
}

impl NodeOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port carrying a single item.
    #[must_use]
    pub fn with_port(mut self, name: impl Into<String>, data: Value) -> Self {
        self.ports.insert(name.into(), vec![PortItem::new(data)]);
        self
    }

    /// Add a port carrying one item per element.
    #[must_use]
    pub fn with_items<I>(mut self, name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.ports
            .insert(name.into(), items.into_iter().map(PortItem::new).collect());
        self
    }

    /// Select a branch for conditional routing.
    #[must_use]
    pub fn with_branch(mut self, value: impl Into<String>) -> Self {
        self.branch = Some(value.into());
        self
    }

    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    #[must_use]
    pub fn ports(&self) -> &FxHashMap<String, Vec<PortItem>> {
        &self.ports
    }

    #[must_use]
    pub fn port(&self, name: &str) -> Option<&[PortItem]> {
        self.ports.get(name).map(Vec::as_slice)
    }

    /// First item's data on a named port.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&Value> {
        self.ports.get(name)?.first().map(|item| &item.data)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// `{portName: firstItemData}` across all ports — the view `nodes.ID`
    /// resolves to in expressions.
    #[must_use]
    pub fn port_record(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.ports.len());
        for (name, items) in &self.ports {
            let data = items.first().map_or(Value::Null, |item| item.data.clone());
            map.insert(name.clone(), data);
        }
        Value::Object(map)
    }

    /// Interpret a raw JSON value as plugin output.
    ///
    /// Recognized shapes, in order:
    /// - `{data: {...}, signal: "x"}` with no other keys: ports from `data`,
    ///   branch from `signal`;
    /// - an object: a `branch` (or `signal`) string key selects the branch,
    ///   every other key becomes a port — arrays yield one item per element,
    ///   anything else a single item;
    /// - any other value: a single item on the [`MAIN_PORT`] port.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let Value::Object(map) = value else {
            return Self::new().with_port(MAIN_PORT, value);
        };

        if let Some(wrapped) = Self::from_wrapped(&map) {
            return wrapped;
        }

        let mut output = Self::new();
        for (key, entry) in map {
            match key.as_str() {
                "branch" | "signal" => {
                    if let Value::String(branch) = entry {
                        output.branch = Some(branch);
                    }
                }
                _ => {
                    let items = match entry {
                        Value::Array(elements) => {
                            elements.into_iter().map(PortItem::new).collect()
                        }
                        other => vec![PortItem::new(other)],
                    };
                    output.ports.insert(key, items);
                }
            }
        }
        output
    }

    fn from_wrapped(map: &serde_json::Map<String, Value>) -> Option<Self> {
        if !map.keys().all(|k| k == "data" || k == "signal") {
            return None;
        }
        let Value::Object(data) = map.get("data")? else {
            return None;
        };
        let mut output = Self::new();
        for (key, entry) in data {
            let items = match entry {
                Value::Array(elements) => {
                    elements.iter().cloned().map(PortItem::new).collect()
                }
                other => vec![PortItem::new(other.clone())],
            };
            output.ports.insert(key.clone(), items);
        }
        if let Some(Value::String(signal)) = map.get("signal") {
            output.branch = Some(signal.clone());
        }
        Some(output)
    }

    /// Flat JSON form for persistence and reports: port data (single items
    /// unwrapped, multi-item ports as arrays) plus the branch, if any.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.ports.len() + 1);
        for (name, items) in &self.ports {
            let entry = if items.len() == 1 {
                items[0].data.clone()
            } else {
                Value::Array(items.iter().map(|item| item.data.clone()).collect())
            };
            map.insert(name.clone(), entry);
        }
        if let Some(branch) = &self.branch {
            map.insert("branch".into(), Value::String(branch.clone()));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_and_accessors() {
        let output = NodeOutput::new()
            .with_port("price", json!(145))
            .with_items("history", [json!(1), json!(2)])
            .with_branch("true");
        assert_eq!(output.first("price"), Some(&json!(145)));
        assert_eq!(output.port("history").unwrap().len(), 2);
        assert_eq!(output.branch(), Some("true"));
        assert_eq!(output.port_record()["history"], json!(1));
    }

    #[test]
    fn from_value_reads_branch_and_ports() {
        let output = NodeOutput::from_value(json!({"branch": "false", "checked": true}));
        assert_eq!(output.branch(), Some("false"));
        assert_eq!(output.first("checked"), Some(&json!(true)));
        assert!(output.port("branch").is_none());
    }

    #[test]
    fn from_value_recognizes_data_signal_wrapping() {
        let output = NodeOutput::from_value(json!({
            "data": {"result": 42},
            "signal": "true"
        }));
        assert_eq!(output.branch(), Some("true"));
        assert_eq!(output.first("result"), Some(&json!(42)));
    }

    #[test]
    fn from_value_wraps_bare_values_on_main() {
        let output = NodeOutput::from_value(json!("plain"));
        assert_eq!(output.first(MAIN_PORT), Some(&json!("plain")));
    }
}
