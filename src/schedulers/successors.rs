//! Successor expansion: which tasks a completed node enqueues.
//!
//! Outgoing edges partition into regular edges and loop back-edges.
//! Regular edges route on the completer's `branch` output; loop edges drive
//! re-entry with a bumped loop-stack context, folding accumulator fields
//! along the way. Disabled targets are transparent: expansion continues to
//! their downstream targets in the same context.

use rustc_hash::FxHashSet;

use crate::graphs::ExecutionGraph;
use crate::plugins::NodeOutput;
use crate::routine::Connection;
use crate::state::ExecutionState;

use super::dispatch::DispatchError;
use super::scheduler::Task;

/// Compute the tasks to enqueue after `task` completed with `output`.
///
/// Returns `UNROUTED_BRANCH` when the output selects a branch value and the
/// node has branch-conditioned edges but none matches; a branch emission on
/// a node with no branch-conditioned edges is ignored.
pub fn expand_successors(
    graph: &ExecutionGraph,
    state: &mut ExecutionState,
    task: &Task,
    output: &NodeOutput,
) -> Result<Vec<Task>, DispatchError> {
    let edges = graph.edges_from(&task.node_id);
    let (loop_edges, regular): (Vec<&Connection>, Vec<&Connection>) =
        edges.iter().partition(|edge| edge.is_loop());

    let branch = output.branch();
    if let Some(value) = branch {
        let available: Vec<String> = branch_values(&regular);
        if !available.is_empty() && !available.iter().any(|candidate| candidate == value) {
            return Err(DispatchError::UnroutedBranch {
                node_id: task.node_id.clone(),
                branch: value.to_string(),
                available,
            });
        }
    }

    let mut tasks = Vec::new();
    for edge in regular {
        if !edge_followed(edge, branch) {
            continue;
        }
        for target in enqueue_targets(graph, &edge.target_node_id) {
            tasks.push(Task {
                node_id: target,
                stack: task.stack.clone(),
            });
        }
    }

    for edge in loop_edges {
        let Some(config) = edge.loop_config() else {
            // Validation rejects this; guard direct scheduler use.
            tracing::warn!(edge = %edge.id, "loop edge without loopConfig ignored");
            continue;
        };
        let iteration = state.advance_loop(&edge.id, config.max_iterations);
        state.fold_accumulator(&edge.id, &config.accumulator_fields, output);
        if iteration >= config.max_iterations {
            tracing::debug!(
                edge = %edge.id,
                iteration,
                "loop reached maxIterations; not re-entering"
            );
            continue;
        }
        let entered = task.stack.entered(&edge.id);
        for target in enqueue_targets(graph, &edge.target_node_id) {
            tasks.push(Task {
                node_id: target,
                stack: entered.clone(),
            });
        }
    }

    Ok(tasks)
}

/// Whether a regular edge is followed given the completer's branch output.
/// Unconditional and `default` edges always follow; branch edges follow
/// only on an exact value match.
fn edge_followed(edge: &Connection, branch: Option<&str>) -> bool {
    match edge.branch_value() {
        None => true,
        Some(required) => branch == Some(required),
    }
}

/// Branch values the node's outgoing edges can route, authored order,
/// deduplicated.
fn branch_values(regular: &[&Connection]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut values = Vec::new();
    for edge in regular {
        if let Some(value) = edge.branch_value()
            && seen.insert(value)
        {
            values.push(value.to_string());
        }
    }
    values
}

/// Resolve an edge target to the enabled nodes that should actually be
/// enqueued, looking through disabled nodes. A disabled node cannot
/// evaluate branch conditions, so only its unconditional and default edges
/// are traversed.
fn enqueue_targets(graph: &ExecutionGraph, target: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut visited = FxHashSet::default();
    walk_target(graph, target, &mut out, &mut visited);
    out
}

fn walk_target(
    graph: &ExecutionGraph,
    target: &str,
    out: &mut Vec<String>,
    visited: &mut FxHashSet<String>,
) {
    if !visited.insert(target.to_string()) {
        return;
    }
    let Some(node) = graph.node(target) else {
        return;
    };
    if node.enabled {
        out.push(target.to_string());
        return;
    }
    for edge in graph.edges_from(target) {
        if edge.is_loop() {
            continue;
        }
        if edge.branch_value().is_some() {
            tracing::warn!(
                node = target,
                edge = %edge.id,
                "branch edge out of a disabled node cannot be evaluated; skipping"
            );
            continue;
        }
        walk_target(graph, &edge.target_node_id, out, visited);
    }
}
