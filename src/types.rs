//! Core types for the Kianax routine execution engine.
//!
//! This module defines the fundamental identifiers used throughout the
//! engine: loop frames and loop stacks, the context keys that make node
//! executions unique across loop iterations, and terminal run statuses.
//!
//! # Key Types
//!
//! - [`LoopFrame`]: one `{edge, iteration}` entry on a task's loop stack
//! - [`LoopStack`]: the ordered stack of loop frames enclosing a task
//! - [`ContextKey`]: the scheduler's unique identifier for a node execution
//! - [`ExecutionStatus`]: terminal status of a routine run
//!
//! # Context keys
//!
//! A node executing outside any loop is keyed by its node id alone. Inside
//! loops, the key encodes the full stack so the same node can run once per
//! iteration without colliding with its earlier results:
//!
//! ```rust
//! use kianax_engine::types::LoopStack;
//!
//! let root = LoopStack::root();
//! assert_eq!(root.context_key("n2").as_str(), "n2");
//!
//! let inner = root.entered("loop-1");
//! assert_eq!(inner.context_key("n2").as_str(), "n2|loop-1:1");
//!
//! let again = inner.entered("loop-1");
//! assert_eq!(again.context_key("n2").as_str(), "n2|loop-1:2");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry on a task's loop stack: a loop edge and the iteration of that
/// loop the task is executing under.
///
/// Iterations are 1-based: the first re-entry through a loop edge pushes a
/// frame with `iteration = 1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopFrame {
    /// Id of the loop edge that introduced this frame.
    pub edge_id: String,
    /// 1-based iteration of the loop this frame represents.
    pub iteration: u32,
}

impl fmt::Display for LoopFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.edge_id, self.iteration)
    }
}

/// The ordered stack of loop frames enclosing a task, outermost first.
///
/// The stack is the engine's replacement for mutable graph re-entry: instead
/// of rewinding the graph, a loop edge enqueues its target under a new stack,
/// which yields a fresh [`ContextKey`] and leaves prior iterations' results
/// intact. Results produced above a loop remain visible inside it via the
/// outward scope walk ([`LoopStack::parent`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopStack(Vec<LoopFrame>);

impl LoopStack {
    /// The empty stack: execution outside any loop.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns `true` when no loop encloses this context.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// All frames, outermost first.
    #[must_use]
    pub fn frames(&self) -> &[LoopFrame] {
        &self.0
    }

    /// The innermost frame, if any. This is the frame `getLoopContext`
    /// reports to plugins.
    #[must_use]
    pub fn innermost(&self) -> Option<&LoopFrame> {
        self.0.last()
    }

    /// Find the frame for a given loop edge, if it is on the stack.
    #[must_use]
    pub fn frame_for(&self, edge_id: &str) -> Option<&LoopFrame> {
        self.0.iter().find(|f| f.edge_id == edge_id)
    }

    /// The stack with the innermost frame removed, or `None` at the root.
    ///
    /// Walking `parent()` to the root is how state lookups resolve values
    /// produced in enclosing scopes.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            let mut frames = self.0.clone();
            frames.pop();
            Some(Self(frames))
        }
    }

    /// The stack after following a loop edge: if the edge is already on the
    /// stack its iteration is bumped, otherwise a frame with iteration 1 is
    /// pushed.
    #[must_use]
    pub fn entered(&self, edge_id: &str) -> Self {
        let mut frames = self.0.clone();
        if let Some(frame) = frames.iter_mut().find(|f| f.edge_id == edge_id) {
            frame.iteration += 1;
        } else {
            frames.push(LoopFrame {
                edge_id: edge_id.to_string(),
                iteration: 1,
            });
        }
        Self(frames)
    }

    /// The context key identifying an execution of `node_id` under this
    /// stack: `nodeId` at the root, `nodeId|edge:iter|…` inside loops.
    #[must_use]
    pub fn context_key(&self, node_id: &str) -> ContextKey {
        if self.0.is_empty() {
            return ContextKey(node_id.to_string());
        }
        let mut key = String::from(node_id);
        for frame in &self.0 {
            key.push('|');
            key.push_str(&frame.edge_id);
            key.push(':');
            key.push_str(&frame.iteration.to_string());
        }
        ContextKey(key)
    }
}

impl fmt::Display for LoopStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "root");
        }
        for (i, frame) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl From<Vec<LoopFrame>> for LoopStack {
    fn from(frames: Vec<LoopFrame>) -> Self {
        Self(frames)
    }
}

/// Unique identifier for one node execution, encoding the node id and the
/// enclosing loop stack.
///
/// Keys are plain strings so they serialize cheaply into events, sink
/// records, and error reports.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey(String);

impl ContextKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The node id portion of the key.
    #[must_use]
    pub fn node_id(&self) -> &str {
        self.0.split('|').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Terminal status of a routine run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Every reachable task finished without a recorded error.
    Completed,
    /// At least one task failed, timed out, or exceeded the dispatch budget.
    Failed,
    /// The run was cancelled before the remaining work could be dispatched.
    Cancelled,
}

impl ExecutionStatus {
    /// Stable lowercase form used by the persistence sink.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_key_encodes_stack_path() {
        let stack = LoopStack::root().entered("e1").entered("e2");
        assert_eq!(stack.context_key("n").as_str(), "n|e1:1|e2:1");
        assert_eq!(stack.context_key("n").node_id(), "n");
    }

    #[test]
    fn entered_bumps_existing_frame() {
        let stack = LoopStack::root().entered("e1").entered("e1");
        assert_eq!(stack.frames().len(), 1);
        assert_eq!(stack.frames()[0].iteration, 2);
    }

    #[test]
    fn parent_walks_outward_to_root() {
        let inner = LoopStack::root().entered("e1").entered("e2");
        let mid = inner.parent().unwrap();
        assert_eq!(mid.frames().len(), 1);
        let root = mid.parent().unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }
}
