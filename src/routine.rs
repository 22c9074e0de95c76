//! Routine definition model.
//!
//! A routine is the user-authored computation graph the engine executes:
//! an ordered list of plugin invocation sites ([`RoutineNode`]), a set of
//! directed [`Connection`]s between them (optionally carrying branch,
//! default, or loop conditions), routine-level [`Variable`]s, and opaque
//! trigger data. Routines are authored and persisted externally; the engine
//! consumes them read-only.
//!
//! The serde representation matches the authoring format: camelCase field
//! names, optional fields omitted when absent.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bounds for [`LoopConfig::max_iterations`].
pub const MIN_LOOP_ITERATIONS: u32 = 1;
pub const MAX_LOOP_ITERATIONS: u32 = 1000;

/// A user-authored routine: the unit of execution submitted to the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    /// Stable identity, assigned by the authoring layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub nodes: Vec<RoutineNode>,
    pub connections: Vec<Connection>,
    /// Opaque payload from the trigger that started this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
}

impl Routine {
    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&RoutineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A single plugin invocation site within a routine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineNode {
    /// Unique within the routine.
    pub id: String,
    /// Selects the executable from the plugin registry.
    pub plugin_id: String,
    #[serde(default)]
    pub label: String,
    /// Plugin configuration; values may contain `{{ … }}` expressions.
    #[serde(default)]
    pub parameters: Value,
    /// Editor canvas position; ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Requirement key → stored-credential id.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub credential_mappings: FxHashMap<String, String>,
    /// Nodes are enabled by default. Disabled nodes are never dispatched and
    /// behave, for readiness purposes, as absent producers of outputs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RoutineNode {
    /// Minimal constructor used by tests and embedders building routines in
    /// code rather than from JSON.
    #[must_use]
    pub fn new(id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            label: String::new(),
            parameters: Value::Object(serde_json::Map::new()),
            position: None,
            credential_mappings: FxHashMap::default(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_credential(
        mut self,
        requirement: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        self.credential_mappings
            .insert(requirement.into(), credential_id.into());
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Editor canvas coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed link between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    /// Named output port on the source; absent means "all ports".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Named input slot on the target; absent means merge/wrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

impl Connection {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: None,
            target_handle: None,
            condition: None,
        }
    }

    #[must_use]
    pub fn with_handles(
        mut self,
        source_handle: Option<&str>,
        target_handle: Option<&str>,
    ) -> Self {
        self.source_handle = source_handle.map(str::to_string);
        self.target_handle = target_handle.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// `true` for loop back-edges. Loop edges are excluded from acyclicity
    /// checks and never gate readiness; they drive re-entry.
    #[must_use]
    pub fn is_loop(&self) -> bool {
        matches!(self.condition, Some(EdgeCondition::Loop { .. }))
    }

    /// The branch value this edge requires, if branch-conditioned.
    #[must_use]
    pub fn branch_value(&self) -> Option<&str> {
        match &self.condition {
            Some(EdgeCondition::Branch { value }) => Some(value),
            _ => None,
        }
    }

    /// Loop configuration, for loop edges.
    #[must_use]
    pub fn loop_config(&self) -> Option<&LoopConfig> {
        match &self.condition {
            Some(EdgeCondition::Loop { loop_config }) => loop_config.as_ref(),
            _ => None,
        }
    }
}

/// Condition attached to a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EdgeCondition {
    /// Followed only when the source node's output carries a matching
    /// `branch` value.
    Branch { value: String },
    /// Always followed, even alongside matching branch edges.
    Default,
    /// Loop back-edge. `loop_config` is required by validation; it is
    /// optional here so malformed definitions deserialize and are rejected
    /// with a proper report instead of a serde error.
    #[serde(rename_all = "camelCase")]
    Loop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_config: Option<LoopConfig>,
    },
}

/// Configuration of a loop back-edge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Iteration bound, in `[1, 1000]`.
    pub max_iterations: u32,
    /// Output keys of the completing node to project into the loop
    /// accumulator after each iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accumulator_fields: Vec<String>,
}

impl LoopConfig {
    #[must_use]
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            accumulator_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_accumulator_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accumulator_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// `true` when `max_iterations` is inside the allowed range.
    #[must_use]
    pub fn iterations_in_range(&self) -> bool {
        (MIN_LOOP_ITERATIONS..=MAX_LOOP_ITERATIONS).contains(&self.max_iterations)
    }
}

/// Declared routine-level variable, readable from expressions as
/// `{{ vars.NAME }}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variable {
    #[must_use]
    pub fn new(name: impl Into<String>, var_type: VariableType, value: Value) -> Self {
        let name = name.into();
        Self {
            id: format!("var-{name}"),
            name,
            var_type,
            value,
            description: None,
        }
    }
}

/// Authoring-time type tag of a variable. The engine stores values as JSON
/// and does not coerce; the tag informs editors and validation tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routine_round_trips_through_json() {
        let routine = Routine {
            id: Some("r-1".into()),
            name: "price alert".into(),
            nodes: vec![
                RoutineNode::new("n1", "stock-price"),
                RoutineNode::new("n2", "email")
                    .with_parameters(json!({"to": "{{ vars.recipient }}"})),
            ],
            connections: vec![Connection::new("e1", "n1", "n2")],
            trigger_data: Some(json!({"symbol": "ACME"})),
            variables: vec![Variable::new(
                "recipient",
                VariableType::String,
                json!("ops@example.com"),
            )],
        };

        let text = serde_json::to_string(&routine).unwrap();
        let back: Routine = serde_json::from_str(&text).unwrap();
        assert_eq!(back.nodes.len(), 2);
        assert_eq!(back.connections[0].source_node_id, "n1");
        assert!(back.nodes.iter().all(|n| n.enabled));
    }

    #[test]
    fn edge_condition_tags_parse() {
        let edge: Connection = serde_json::from_value(json!({
            "id": "e1",
            "sourceNodeId": "a",
            "targetNodeId": "b",
            "condition": {"type": "branch", "value": "true"}
        }))
        .unwrap();
        assert_eq!(edge.branch_value(), Some("true"));
        assert!(!edge.is_loop());

        let back_edge: Connection = serde_json::from_value(json!({
            "id": "e2",
            "sourceNodeId": "b",
            "targetNodeId": "a",
            "condition": {
                "type": "loop",
                "loopConfig": {"maxIterations": 3, "accumulatorFields": ["total"]}
            }
        }))
        .unwrap();
        assert!(back_edge.is_loop());
        let config = back_edge.loop_config().unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.accumulator_fields, vec!["total".to_string()]);
    }

    #[test]
    fn loop_edge_without_config_still_parses() {
        let edge: Connection = serde_json::from_value(json!({
            "id": "e3",
            "sourceNodeId": "b",
            "targetNodeId": "a",
            "condition": {"type": "loop"}
        }))
        .unwrap();
        assert!(edge.is_loop());
        assert!(edge.loop_config().is_none());
    }
}
