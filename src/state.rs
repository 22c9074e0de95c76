//! Per-run execution state.
//!
//! [`ExecutionState`] is the sole mutable record of a run. It is created at
//! `execute()` entry, written only by the scheduler, and discarded after the
//! run; its observable effects are flushed to the persistence sink and the
//! event bus along the way. Plugins never see this type — they receive a
//! scoped [`NodeState`](crate::plugins::NodeState) handle to their own
//! scratch bag.
//!
//! # Keyspace
//!
//! Outputs are keyed by [`ContextKey`]: the node id alone outside loops,
//! the node id plus the loop-stack path inside them. Writes are monotonic —
//! once a context key has a recorded output it is never overwritten — which
//! is what makes replay from the host's log deterministic.
//!
//! # Scope walk
//!
//! When a node inside a loop reads a value produced above the loop, the
//! producer has no output under the reader's full stack. Lookups therefore
//! walk the stack outward toward the root and return the nearest enclosing
//! scope's result.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::expressions::OutputSource;
use crate::plugins::NodeOutput;
use crate::types::{ContextKey, LoopStack};

/// One entry of the ordered execution path, in completion order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEntry {
    pub node_id: String,
    /// 1-based completed-run count of the node at the time of this entry.
    pub run_index: u32,
}

/// Bookkeeping for one loop edge.
#[derive(Clone, Debug)]
pub struct LoopState {
    /// Monotonically increasing trigger count, never exceeding
    /// `max_iterations`.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Fields projected from completer outputs after each iteration.
    pub accumulator: FxHashMap<String, Value>,
    pub started_at: DateTime<Utc>,
}

/// One completed run of a node.
#[derive(Clone, Debug)]
pub struct NodeRunRecord {
    pub node_id: String,
    pub run_index: u32,
    pub context_key: ContextKey,
    pub output: NodeOutput,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// A recorded task failure.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub context_key: ContextKey,
    pub node_id: String,
    /// Stable taxonomy tag, e.g. `PLUGIN_EXECUTION_FAILED`.
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
    pub when: DateTime<Utc>,
}

/// The mutable record of a single run. Owned exclusively by the scheduler.
#[derive(Debug, Default)]
pub struct ExecutionState {
    node_outputs: FxHashMap<ContextKey, NodeOutput>,
    latest_runs: FxHashMap<String, NodeOutput>,
    node_runs: FxHashMap<String, Vec<NodeRunRecord>>,
    executed: FxHashSet<ContextKey>,
    running: FxHashSet<ContextKey>,
    execution_path: Vec<PathEntry>,
    loop_states: FxHashMap<String, LoopState>,
    node_states: FxHashMap<String, Arc<Mutex<FxHashMap<String, Value>>>>,
    errors: FxHashMap<ContextKey, ErrorRecord>,
}

impl ExecutionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Run transitions
    // ------------------------------------------------------------------

    pub fn mark_running(&mut self, key: ContextKey) {
        self.running.insert(key);
    }

    #[must_use]
    pub fn is_running(&self, key: &ContextKey) -> bool {
        self.running.contains(key)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Record a successful completion: appends to the node's results, bumps
    /// its run index, extends the execution path, and stores the output
    /// under the context key.
    ///
    /// The write is monotonic — a second completion for the same context key
    /// is ignored and the existing run index returned.
    pub fn add_node_result(
        &mut self,
        node_id: &str,
        key: ContextKey,
        output: NodeOutput,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> u32 {
        self.running.remove(&key);
        if self.executed.contains(&key) {
            tracing::debug!(%key, "ignoring duplicate result for context key");
            return self.run_index(node_id);
        }

        let run_index = self.run_index(node_id) + 1;
        self.node_outputs.insert(key.clone(), output.clone());
        self.latest_runs.insert(node_id.to_string(), output.clone());
        self.executed.insert(key.clone());
        self.execution_path.push(PathEntry {
            node_id: node_id.to_string(),
            run_index,
        });
        self.node_runs
            .entry(node_id.to_string())
            .or_default()
            .push(NodeRunRecord {
                node_id: node_id.to_string(),
                run_index,
                context_key: key,
                output,
                started_at,
                completed_at,
            });
        run_index
    }

    /// Record a task failure. The context key never re-enters the queue.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.running.remove(&record.context_key);
        self.errors.insert(record.context_key.clone(), record);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of completed runs of a node.
    #[must_use]
    pub fn run_index(&self, node_id: &str) -> u32 {
        self.node_runs
            .get(node_id)
            .map_or(0, |runs| runs.len() as u32)
    }

    #[must_use]
    pub fn is_executed(&self, key: &ContextKey) -> bool {
        self.executed.contains(key)
    }

    #[must_use]
    pub fn has_error(&self, key: &ContextKey) -> bool {
        self.errors.contains_key(key)
    }

    #[must_use]
    pub fn output_for(&self, key: &ContextKey) -> Option<&NodeOutput> {
        self.node_outputs.get(key)
    }

    /// The node's most recently recorded output, regardless of context.
    #[must_use]
    pub fn latest_output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.latest_runs.get(node_id)
    }

    /// Resolve a node's output as visible from `stack`: the current context
    /// first, then each enclosing scope out to the root.
    #[must_use]
    pub fn output_in_scope(&self, node_id: &str, stack: &LoopStack) -> Option<&NodeOutput> {
        let mut current = stack.clone();
        loop {
            let key = current.context_key(node_id);
            if let Some(output) = self.node_outputs.get(&key) {
                return Some(output);
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// `true` when the node has a recorded error in the current scope or
    /// any enclosing one.
    #[must_use]
    pub fn error_in_scope(&self, node_id: &str, stack: &LoopStack) -> bool {
        let mut current = stack.clone();
        loop {
            if self.errors.contains_key(&current.context_key(node_id)) {
                return true;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    #[must_use]
    pub fn execution_path(&self) -> &[PathEntry] {
        &self.execution_path
    }

    #[must_use]
    pub fn node_runs(&self) -> &FxHashMap<String, Vec<NodeRunRecord>> {
        &self.node_runs
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.values()
    }

    // ------------------------------------------------------------------
    // Loop bookkeeping
    // ------------------------------------------------------------------

    /// Bump the trigger count of a loop edge, creating its state on first
    /// use. Returns the new count, capped at `max_iterations`.
    pub fn advance_loop(&mut self, edge_id: &str, max_iterations: u32) -> u32 {
        let state = self
            .loop_states
            .entry(edge_id.to_string())
            .or_insert_with(|| LoopState {
                iteration: 0,
                max_iterations,
                accumulator: FxHashMap::default(),
                started_at: Utc::now(),
            });
        if state.iteration < state.max_iterations {
            state.iteration += 1;
        }
        state.iteration
    }

    /// Project `fields` from a completer's output into the loop
    /// accumulator. Missing fields are skipped.
    pub fn fold_accumulator(&mut self, edge_id: &str, fields: &[String], output: &NodeOutput) {
        if fields.is_empty() {
            return;
        }
        let Some(state) = self.loop_states.get_mut(edge_id) else {
            return;
        };
        for field in fields {
            if let Some(value) = output.first(field) {
                state.accumulator.insert(field.clone(), value.clone());
            }
        }
    }

    #[must_use]
    pub fn loop_state(&self, edge_id: &str) -> Option<&LoopState> {
        self.loop_states.get(edge_id)
    }

    // ------------------------------------------------------------------
    // Scratch bags
    // ------------------------------------------------------------------

    /// Handle to a node's scratch bag, created on first use. Repeated calls
    /// return the same underlying bag; plugins rely on that identity to
    /// carry data across loop iterations.
    pub fn node_state(&mut self, node_id: &str) -> Arc<Mutex<FxHashMap<String, Value>>> {
        Arc::clone(
            self.node_states
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FxHashMap::default()))),
        )
    }

    /// Reset everything. For tests.
    pub fn clear(&mut self) {
        self.node_outputs.clear();
        self.latest_runs.clear();
        self.node_runs.clear();
        self.executed.clear();
        self.running.clear();
        self.execution_path.clear();
        self.loop_states.clear();
        self.node_states.clear();
        self.errors.clear();
    }
}

/// [`OutputSource`] over the state as seen from one task's context: the
/// scope walk first, then the node's latest run (so a reader placed after a
/// loop sees the final iteration's output).
pub struct ScopedOutputs<'a> {
    state: &'a ExecutionState,
    stack: &'a LoopStack,
}

impl<'a> ScopedOutputs<'a> {
    #[must_use]
    pub fn new(state: &'a ExecutionState, stack: &'a LoopStack) -> Self {
        Self { state, stack }
    }

    fn visible_output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.state
            .output_in_scope(node_id, self.stack)
            .or_else(|| self.state.latest_output(node_id))
    }
}

impl OutputSource for ScopedOutputs<'_> {
    fn port_record(&self, node_id: &str) -> Option<Value> {
        self.visible_output(node_id).map(NodeOutput::port_record)
    }

    fn port_value(&self, node_id: &str, port: &str) -> Option<Value> {
        self.visible_output(node_id)?.first(port).cloned()
    }
}
