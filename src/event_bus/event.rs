//! Event model for execution observability.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{ContextKey, ExecutionStatus};

/// An observable transition during a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Execution(ExecutionEvent),
    Node(NodeRunEvent),
    Diagnostic(DiagnosticEvent),
}

/// Lifecycle of the run as a whole.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl From<ExecutionStatus> for ExecutionPhase {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Failed => Self::Failed,
            ExecutionStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub routine_id: String,
    pub phase: ExecutionPhase,
    pub when: DateTime<Utc>,
}

/// Lifecycle of one node execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Started,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunEvent {
    pub node_id: String,
    /// Context key of the task, so observers can distinguish iterations.
    pub context_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u32>,
    pub phase: NodePhase,
    /// Error message for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub when: DateTime<Utc>,
}

/// Free-form engine telemetry (quiescence sweeps, budget exhaustion, …).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}

impl Event {
    pub fn execution_started(
        execution_id: impl Into<String>,
        routine_id: impl Into<String>,
    ) -> Self {
        Event::Execution(ExecutionEvent {
            execution_id: execution_id.into(),
            routine_id: routine_id.into(),
            phase: ExecutionPhase::Started,
            when: Utc::now(),
        })
    }

    pub fn execution_finished(
        execution_id: impl Into<String>,
        routine_id: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Event::Execution(ExecutionEvent {
            execution_id: execution_id.into(),
            routine_id: routine_id.into(),
            phase: status.into(),
            when: Utc::now(),
        })
    }

    pub fn node_started(node_id: impl Into<String>, key: &ContextKey) -> Self {
        Event::Node(NodeRunEvent {
            node_id: node_id.into(),
            context_key: key.as_str().to_string(),
            run_index: None,
            phase: NodePhase::Started,
            detail: None,
            when: Utc::now(),
        })
    }

    pub fn node_succeeded(node_id: impl Into<String>, key: &ContextKey, run_index: u32) -> Self {
        Event::Node(NodeRunEvent {
            node_id: node_id.into(),
            context_key: key.as_str().to_string(),
            run_index: Some(run_index),
            phase: NodePhase::Succeeded,
            detail: None,
            when: Utc::now(),
        })
    }

    pub fn node_failed(
        node_id: impl Into<String>,
        key: &ContextKey,
        detail: impl Into<String>,
    ) -> Self {
        Event::Node(NodeRunEvent {
            node_id: node_id.into(),
            context_key: key.as_str().to_string(),
            run_index: None,
            phase: NodePhase::Failed,
            detail: Some(detail.into()),
            when: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// Short label for grouping in sinks and logs.
    #[must_use]
    pub fn scope_label(&self) -> &str {
        match self {
            Event::Execution(_) => "execution",
            Event::Node(event) => &event.node_id,
            Event::Diagnostic(event) => &event.scope,
        }
    }

    /// Normalized JSON shape used by [`JsonLinesSink`](super::JsonLinesSink):
    /// `{type, scope, message, timestamp, metadata}`.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        match self {
            Event::Execution(event) => json!({
                "type": "execution",
                "scope": "execution",
                "message": format!("{:?}", event.phase).to_lowercase(),
                "timestamp": event.when.to_rfc3339(),
                "metadata": {
                    "executionId": event.execution_id,
                    "routineId": event.routine_id,
                },
            }),
            Event::Node(event) => json!({
                "type": "node",
                "scope": event.node_id,
                "message": format!("{:?}", event.phase).to_lowercase(),
                "timestamp": event.when.to_rfc3339(),
                "metadata": {
                    "contextKey": event.context_key,
                    "runIndex": event.run_index,
                    "detail": event.detail,
                },
            }),
            Event::Diagnostic(event) => json!({
                "type": "diagnostic",
                "scope": event.scope,
                "message": event.message,
                "timestamp": Utc::now().to_rfc3339(),
                "metadata": {},
            }),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Execution(event) => write!(
                f,
                "[{}] execution {:?}",
                event.execution_id,
                event.phase
            ),
            Event::Node(event) => match (&event.run_index, &event.detail) {
                (Some(run), _) => {
                    write!(f, "[{}#{}] {:?}", event.context_key, run, event.phase)
                }
                (None, Some(detail)) => {
                    write!(f, "[{}] {:?}: {}", event.context_key, event.phase, detail)
                }
                (None, None) => write!(f, "[{}] {:?}", event.context_key, event.phase),
            },
            Event::Diagnostic(event) => write!(f, "[{}] {}", event.scope, event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoopStack;

    #[test]
    fn node_events_carry_context_keys() {
        let key = LoopStack::root().entered("e1").context_key("n2");
        let event = Event::node_succeeded("n2", &key, 2);
        assert_eq!(event.scope_label(), "n2");
        let json = event.to_json_value();
        assert_eq!(json["metadata"]["contextKey"], "n2|e1:1");
        assert_eq!(json["metadata"]["runIndex"], 2);
    }

    #[test]
    fn display_is_compact() {
        let key = LoopStack::root().context_key("n1");
        let text = Event::node_failed("n1", &key, "boom").to_string();
        assert!(text.contains("n1"));
        assert!(text.contains("boom"));
    }
}
