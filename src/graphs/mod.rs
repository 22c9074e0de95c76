//! Immutable, index-optimized view of a validated routine.
//!
//! [`ExecutionGraph`] is what the scheduler actually walks: nodes by id,
//! edges indexed both by source and by target, routine variables collapsed
//! to a name → value map, and the trigger payload. It is built once per run
//! and never mutated.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::routine::{Connection, Routine, RoutineNode};

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

/// O(1)-lookup view of a routine for the scheduler.
///
/// Construction assumes the routine already passed validation; unknown edge
/// endpoints are silently index-less here rather than re-reported.
#[derive(Clone, Debug)]
pub struct ExecutionGraph {
    routine_id: String,
    routine_name: String,
    nodes: FxHashMap<String, RoutineNode>,
    /// Preserves authored node order, for deterministic iteration.
    node_order: Vec<String>,
    edges_by_source: FxHashMap<String, Vec<Connection>>,
    edges_by_target: FxHashMap<String, Vec<Connection>>,
    variables: FxHashMap<String, Value>,
    trigger_data: Value,
}

impl ExecutionGraph {
    /// Build the indexed view from a validated routine.
    #[must_use]
    pub fn from_routine(routine: &Routine) -> Self {
        let mut nodes = FxHashMap::default();
        let mut node_order = Vec::with_capacity(routine.nodes.len());
        for node in &routine.nodes {
            node_order.push(node.id.clone());
            nodes.insert(node.id.clone(), node.clone());
        }

        let mut edges_by_source: FxHashMap<String, Vec<Connection>> = FxHashMap::default();
        let mut edges_by_target: FxHashMap<String, Vec<Connection>> = FxHashMap::default();
        for edge in &routine.connections {
            edges_by_source
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(edge.clone());
            edges_by_target
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(edge.clone());
        }

        let variables = routine
            .variables
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect();

        Self {
            routine_id: routine.id.clone().unwrap_or_default(),
            routine_name: routine.name.clone(),
            nodes,
            node_order,
            edges_by_source,
            edges_by_target,
            variables,
            trigger_data: routine.trigger_data.clone().unwrap_or(Value::Null),
        }
    }

    #[must_use]
    pub fn routine_id(&self) -> &str {
        &self.routine_id
    }

    #[must_use]
    pub fn routine_name(&self) -> &str {
        &self.routine_name
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&RoutineNode> {
        self.nodes.get(id)
    }

    /// Node ids in authored order.
    #[must_use]
    pub fn node_ids(&self) -> &[String] {
        &self.node_order
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_order.len()
    }

    /// Outgoing edges of a node, in authored order. Empty for sinks.
    #[must_use]
    pub fn edges_from(&self, id: &str) -> &[Connection] {
        self.edges_by_source.get(id).map_or(&[], Vec::as_slice)
    }

    /// Incoming edges of a node, in authored order. Empty for entries.
    #[must_use]
    pub fn edges_into(&self, id: &str) -> &[Connection] {
        self.edges_by_target.get(id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn variables(&self) -> &FxHashMap<String, Value> {
        &self.variables
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    #[must_use]
    pub fn trigger_data(&self) -> &Value {
        &self.trigger_data
    }

    /// Loop-edge id → the nodes forming that loop's body: nodes reachable
    /// from the edge's target that can still reach the edge's source, via
    /// non-loop edges. The body is what re-executes each iteration, so the
    /// scheduler requires body members to complete in the *current*
    /// iteration context while everything else may satisfy readiness from
    /// an enclosing scope.
    #[must_use]
    pub fn loop_membership(&self) -> FxHashMap<String, FxHashSet<String>> {
        let mut membership: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for source in &self.node_order {
            for edge in self.edges_from(source) {
                if !edge.is_loop() {
                    continue;
                }
                let forward = self.reach(&edge.target_node_id, Direction::Forward);
                let backward = self.reach(&edge.source_node_id, Direction::Backward);
                let mut members: FxHashSet<String> =
                    forward.intersection(&backward).cloned().collect();
                members.insert(edge.target_node_id.clone());
                members.insert(edge.source_node_id.clone());
                membership.insert(edge.id.clone(), members);
            }
        }
        membership
    }

    fn reach(&self, start: &str, direction: Direction) -> FxHashSet<String> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        seen.insert(start.to_string());
        let mut frontier = vec![start.to_string()];
        while let Some(current) = frontier.pop() {
            let edges = match direction {
                Direction::Forward => self.edges_from(&current),
                Direction::Backward => self.edges_into(&current),
            };
            for edge in edges {
                if edge.is_loop() {
                    continue;
                }
                let next = match direction {
                    Direction::Forward => &edge.target_node_id,
                    Direction::Backward => &edge.source_node_id,
                };
                if seen.insert(next.clone()) {
                    frontier.push(next.clone());
                }
            }
        }
        seen
    }

    /// Entry nodes: enabled nodes with no incoming non-loop edge. Loop
    /// back-edges never gate seeding.
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.node_order
            .iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                node.enabled
                    && self
                        .edges_into(id)
                        .iter()
                        .all(Connection::is_loop)
            })
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{EdgeCondition, LoopConfig, Variable, VariableType};
    use serde_json::json;

    fn sample() -> Routine {
        Routine {
            id: Some("r-1".into()),
            name: "sample".into(),
            nodes: vec![
                RoutineNode::new("n1", "seed"),
                RoutineNode::new("n2", "counter"),
            ],
            connections: vec![
                Connection::new("e1", "n1", "n2"),
                Connection::new("loop-1", "n2", "n2").with_condition(EdgeCondition::Loop {
                    loop_config: Some(LoopConfig::new(3)),
                }),
            ],
            trigger_data: Some(json!({"seed": 1})),
            variables: vec![Variable::new("limit", VariableType::Number, json!(10))],
        }
    }

    #[test]
    fn indexes_both_directions() {
        let graph = ExecutionGraph::from_routine(&sample());
        assert_eq!(graph.edges_from("n1").len(), 1);
        assert_eq!(graph.edges_from("n2").len(), 1);
        assert_eq!(graph.edges_into("n2").len(), 2);
        assert_eq!(graph.variable("limit"), Some(&json!(10)));
        assert_eq!(graph.trigger_data()["seed"], json!(1));
    }

    #[test]
    fn loop_edges_do_not_gate_entry_seeding() {
        let graph = ExecutionGraph::from_routine(&sample());
        assert_eq!(graph.entry_nodes(), vec!["n1"]);
    }

    #[test]
    fn loop_membership_covers_the_body() {
        let routine = Routine {
            id: None,
            name: "loop body".into(),
            nodes: vec![
                RoutineNode::new("n1", "seed"),
                RoutineNode::new("n2", "work"),
                RoutineNode::new("n3", "check"),
                RoutineNode::new("n4", "after"),
            ],
            connections: vec![
                Connection::new("e1", "n1", "n2"),
                Connection::new("e2", "n2", "n3"),
                Connection::new("back", "n3", "n2").with_condition(EdgeCondition::Loop {
                    loop_config: Some(LoopConfig::new(2)),
                }),
                Connection::new("e3", "n3", "n4"),
            ],
            trigger_data: None,
            variables: Vec::new(),
        };
        let graph = ExecutionGraph::from_routine(&routine);
        let membership = graph.loop_membership();
        let body = &membership["back"];
        assert!(body.contains("n2") && body.contains("n3"));
        assert!(!body.contains("n1") && !body.contains("n4"));
    }

    #[test]
    fn disabled_nodes_are_not_entries() {
        let mut routine = sample();
        routine.nodes[0].enabled = false;
        let graph = ExecutionGraph::from_routine(&routine);
        assert!(graph.entry_nodes().is_empty());
    }
}
