//! Input gathering: assembling the named-input record a plugin receives
//! from its upstream outputs.
//!
//! For a node about to execute, the gatherer follows every incoming edge,
//! locates the source's output for the current context (walking loop scopes
//! outward when needed), extracts the named port or the merged port record,
//! and places the result under the edge's target handle — or shallow-merges
//! object keys when no handle is given. Conflicting keys across edges are
//! rejected rather than silently overwritten, because overwrite order would
//! depend on edge iteration order and break determinism.
//!
//! A `sourceHandle` naming a port the source did not emit contributes no
//! input; it is logged and skipped. Loop back-edges contribute the previous
//! iteration's output via the scope walk, and nothing on the first run.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::graphs::ExecutionGraph;
use crate::plugins::{ItemMetadata, PortItem};
use crate::state::ExecutionState;
use crate::types::LoopStack;

/// One named input with its lineage.
#[derive(Clone, Debug, PartialEq)]
pub struct InputSlot {
    pub value: Value,
    pub metadata: ItemMetadata,
}

/// The record of named inputs passed to a plugin.
#[derive(Clone, Debug, Default)]
pub struct NodeInputs {
    slots: FxHashMap<String, InputSlot>,
}

impl NodeInputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).map(|slot| &slot.value)
    }

    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&InputSlot> {
        self.slots.get(name)
    }

    /// Lineage of a named input.
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<&ItemMetadata> {
        self.slots.get(name).map(|slot| &slot.metadata)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputSlot)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert without conflict checking. For tests and plugins invoked
    /// outside the gatherer.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.slots.insert(
            name.into(),
            InputSlot {
                value,
                metadata: ItemMetadata::default(),
            },
        );
    }

    /// Flat `{name: value}` object, for schema validation and sink records.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.slots.len());
        for (name, slot) in &self.slots {
            map.insert(name.clone(), slot.value.clone());
        }
        Value::Object(map)
    }

    fn insert_checked(
        &mut self,
        node_id: &str,
        source_id: &str,
        name: String,
        slot: InputSlot,
    ) -> Result<(), GatherError> {
        if self.slots.contains_key(&name) {
            return Err(GatherError::InputKeyConflict {
                node_id: node_id.to_string(),
                source_id: source_id.to_string(),
                key: name,
            });
        }
        self.slots.insert(name, slot);
        Ok(())
    }
}

/// Errors surfaced while assembling inputs.
#[derive(Debug, Error, Diagnostic)]
pub enum GatherError {
    /// A non-loop edge's enabled source has no executed output in scope.
    /// The scheduler's readiness check makes this unreachable in normal
    /// operation; it guards direct gatherer use.
    #[error("node {node_id}: upstream output of {source_id} is missing")]
    #[diagnostic(code(kianax::inputs::missing_upstream_output))]
    MissingUpstreamOutput { node_id: String, source_id: String },

    /// Two edges produced the same input key.
    #[error("node {node_id}: input key {key:?} already provided by another edge (conflicting edge from {source_id})")]
    #[diagnostic(
        code(kianax::inputs::input_key_conflict),
        help("Give one of the conflicting connections an explicit targetHandle.")
    )]
    InputKeyConflict {
        node_id: String,
        source_id: String,
        key: String,
    },
}

impl GatherError {
    /// Stable taxonomy tag.
    #[must_use]
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::MissingUpstreamOutput { .. } => "MISSING_UPSTREAM_OUTPUT",
            Self::InputKeyConflict { .. } => "INPUT_KEY_CONFLICT",
        }
    }
}

/// Assemble the inputs for `node_id` executing under `stack`.
pub fn gather_inputs(
    graph: &ExecutionGraph,
    state: &ExecutionState,
    node_id: &str,
    stack: &LoopStack,
) -> Result<NodeInputs, GatherError> {
    let mut inputs = NodeInputs::new();

    for edge in graph.edges_into(node_id) {
        let source_id = edge.source_node_id.as_str();
        let source_enabled = graph.node(source_id).is_none_or(|n| n.enabled);
        if !source_enabled {
            continue;
        }

        let Some(output) = state.output_in_scope(source_id, stack) else {
            if edge.is_loop() {
                // First run: the back-edge has nothing to feed yet.
                continue;
            }
            return Err(GatherError::MissingUpstreamOutput {
                node_id: node_id.to_string(),
                source_id: source_id.to_string(),
            });
        };

        match edge.source_handle.as_deref() {
            Some(handle) => {
                let Some(items) = output.port(handle) else {
                    tracing::warn!(
                        node = node_id,
                        source = source_id,
                        handle,
                        "source port not emitted; edge contributes no input"
                    );
                    continue;
                };
                let value = port_items_value(items);
                let metadata = ItemMetadata::from_source(source_id, Some(handle), 0);
                place(
                    &mut inputs,
                    node_id,
                    source_id,
                    edge.target_handle.as_deref(),
                    value,
                    metadata,
                )?;
            }
            None => {
                let value = output.port_record();
                let metadata = ItemMetadata::from_source(source_id, None, 0);
                place(
                    &mut inputs,
                    node_id,
                    source_id,
                    edge.target_handle.as_deref(),
                    value,
                    metadata,
                )?;
            }
        }
    }

    Ok(inputs)
}

/// Place a gathered value according to the target-handle rules.
fn place(
    inputs: &mut NodeInputs,
    node_id: &str,
    source_id: &str,
    target_handle: Option<&str>,
    value: Value,
    metadata: ItemMetadata,
) -> Result<(), GatherError> {
    if let Some(target) = target_handle {
        return inputs.insert_checked(
            node_id,
            source_id,
            target.to_string(),
            InputSlot { value, metadata },
        );
    }

    match value {
        Value::Object(map) => {
            for (key, entry) in map {
                let mut slot_meta = metadata.clone();
                if slot_meta.source_port.is_none() {
                    slot_meta.source_port = Some(key.clone());
                }
                inputs.insert_checked(
                    node_id,
                    source_id,
                    key,
                    InputSlot {
                        value: entry,
                        metadata: slot_meta,
                    },
                )?;
            }
            Ok(())
        }
        primitive_or_array => inputs.insert_checked(
            node_id,
            source_id,
            format!("from_{source_id}"),
            InputSlot {
                value: primitive_or_array,
                metadata,
            },
        ),
    }
}

/// Collapse a port's items to one value: single items unwrap, multi-item
/// ports become arrays of their data.
fn port_items_value(items: &[PortItem]) -> Value {
    if items.len() == 1 {
        items[0].data.clone()
    } else {
        Value::Array(items.iter().map(|item| item.data.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::NodeOutput;
    use crate::routine::{Connection, Routine, RoutineNode};
    use chrono::Utc;
    use serde_json::json;

    fn graph_with(edges: Vec<Connection>, nodes: Vec<RoutineNode>) -> ExecutionGraph {
        ExecutionGraph::from_routine(&Routine {
            id: Some("r".into()),
            name: "t".into(),
            nodes,
            connections: edges,
            trigger_data: None,
            variables: Vec::new(),
        })
    }

    fn recorded(state: &mut ExecutionState, node: &str, output: NodeOutput) {
        let now = Utc::now();
        state.add_node_result(node, LoopStack::root().context_key(node), output, now, now);
    }

    #[test]
    fn named_handles_route_to_named_slots() {
        let graph = graph_with(
            vec![
                Connection::new("e1", "n1", "n3").with_handles(Some("price"), Some("stockData")),
                Connection::new("e2", "n2", "n3").with_handles(Some("data"), Some("newsData")),
            ],
            vec![
                RoutineNode::new("n1", "stock-price"),
                RoutineNode::new("n2", "http"),
                RoutineNode::new("n3", "ai-transform"),
            ],
        );
        let mut state = ExecutionState::new();
        recorded(&mut state, "n1", NodeOutput::new().with_port("price", json!(150.5)));
        recorded(&mut state, "n2", NodeOutput::new().with_port("data", json!("API response")));

        let inputs = gather_inputs(&graph, &state, "n3", &LoopStack::root()).unwrap();
        assert_eq!(inputs.get("stockData"), Some(&json!(150.5)));
        assert_eq!(inputs.get("newsData"), Some(&json!("API response")));
        assert_eq!(
            inputs.metadata("stockData").unwrap().source_node.as_deref(),
            Some("n1")
        );
    }

    #[test]
    fn merged_ports_conflict_across_edges() {
        let graph = graph_with(
            vec![
                Connection::new("e1", "a", "c"),
                Connection::new("e2", "b", "c"),
            ],
            vec![
                RoutineNode::new("a", "p"),
                RoutineNode::new("b", "p"),
                RoutineNode::new("c", "p"),
            ],
        );
        let mut state = ExecutionState::new();
        recorded(&mut state, "a", NodeOutput::new().with_port("result", json!(1)));
        recorded(&mut state, "b", NodeOutput::new().with_port("result", json!(2)));

        let err = gather_inputs(&graph, &state, "c", &LoopStack::root()).unwrap_err();
        assert_eq!(err.kind_tag(), "INPUT_KEY_CONFLICT");
    }

    #[test]
    fn missing_emitted_port_is_soft_skipped() {
        let graph = graph_with(
            vec![Connection::new("e1", "a", "b").with_handles(Some("absent"), Some("x"))],
            vec![RoutineNode::new("a", "p"), RoutineNode::new("b", "p")],
        );
        let mut state = ExecutionState::new();
        recorded(&mut state, "a", NodeOutput::new().with_port("result", json!(1)));

        let inputs = gather_inputs(&graph, &state, "b", &LoopStack::root()).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn primitive_without_target_handle_wraps_under_source() {
        let graph = graph_with(
            vec![Connection::new("e1", "a", "b").with_handles(Some("count"), None)],
            vec![RoutineNode::new("a", "p"), RoutineNode::new("b", "p")],
        );
        let mut state = ExecutionState::new();
        recorded(&mut state, "a", NodeOutput::new().with_port("count", json!(7)));

        let inputs = gather_inputs(&graph, &state, "b", &LoopStack::root()).unwrap();
        assert_eq!(inputs.get("from_a"), Some(&json!(7)));
    }

    #[test]
    fn disabled_sources_contribute_nothing() {
        let graph = graph_with(
            vec![Connection::new("e1", "a", "b")],
            vec![RoutineNode::new("a", "p").disabled(), RoutineNode::new("b", "p")],
        );
        let state = ExecutionState::new();
        let inputs = gather_inputs(&graph, &state, "b", &LoopStack::root()).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn loop_edge_feeds_previous_iteration_via_scope_walk() {
        use crate::routine::{EdgeCondition, LoopConfig};
        let graph = graph_with(
            vec![
                Connection::new("loop-1", "n2", "n2")
                    .with_handles(Some("total"), Some("previous"))
                    .with_condition(EdgeCondition::Loop {
                        loop_config: Some(LoopConfig::new(3)),
                    }),
            ],
            vec![RoutineNode::new("n2", "counter")],
        );
        let mut state = ExecutionState::new();

        // First run: nothing to feed.
        let first = gather_inputs(&graph, &state, "n2", &LoopStack::root()).unwrap();
        assert!(first.is_empty());

        recorded(&mut state, "n2", NodeOutput::new().with_port("total", json!(10)));
        let iter1 = LoopStack::root().entered("loop-1");
        let second = gather_inputs(&graph, &state, "n2", &iter1).unwrap();
        assert_eq!(second.get("previous"), Some(&json!(10)));
    }
}
