//! Persistence sink interface.
//!
//! The scheduler is not durable; durability is the workflow host's job. It
//! does, however, emit every observable transition — execution created,
//! node result stored, workflow status updated — to an injected
//! [`PersistenceSink`] so dashboards can render progress in real time and a
//! crashed scheduler can be replayed from the host's log. Sink failures are
//! logged and never abort the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::types::ExecutionStatus;

/// Record for a newly created execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub routine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub workflow_id: String,
    pub run_id: String,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
}

/// Record for one finished node run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResultRecord {
    pub workflow_id: String,
    pub node_id: String,
    /// `succeeded`, `failed`, or `cancelled`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Workflow-level status update.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Errors a sink may report. The engine downgrades them to warnings.
#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("persistence sink unavailable: {0}")]
    #[diagnostic(code(kianax::persistence::unavailable))]
    Unavailable(String),

    #[error("persistence write failed: {0}")]
    #[diagnostic(code(kianax::persistence::write))]
    Write(String),
}

/// Receives execution records for dashboards and replay.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<(), SinkError>;
    async fn store_node_result(&self, record: NodeResultRecord) -> Result<(), SinkError>;
    async fn update_status(&self, update: StatusUpdate) -> Result<(), SinkError>;
}

/// Sink that drops everything. The default when no sink is injected.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn create_execution(&self, _record: ExecutionRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn store_node_result(&self, _record: NodeResultRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn update_status(&self, _update: StatusUpdate) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Everything a [`MemorySink`] captured, in arrival order.
#[derive(Clone, Debug)]
pub enum SinkEvent {
    Created(ExecutionRecord),
    NodeResult(NodeResultRecord),
    Status(StatusUpdate),
}

/// In-memory sink for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of every captured event.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Captured node-result records only.
    #[must_use]
    pub fn node_results(&self) -> Vec<NodeResultRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::NodeResult(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<(), SinkError> {
        self.events.lock().push(SinkEvent::Created(record));
        Ok(())
    }

    async fn store_node_result(&self, record: NodeResultRecord) -> Result<(), SinkError> {
        self.events.lock().push(SinkEvent::NodeResult(record));
        Ok(())
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<(), SinkError> {
        self.events.lock().push(SinkEvent::Status(update));
        Ok(())
    }
}

/// Wrapper that applies the non-fatal policy: failures are logged at `warn`
/// and swallowed so a broken dashboard never takes down a run.
#[derive(Clone)]
pub struct LoggingSink {
    inner: Arc<dyn PersistenceSink>,
}

impl LoggingSink {
    #[must_use]
    pub fn new(inner: Arc<dyn PersistenceSink>) -> Self {
        Self { inner }
    }

    pub async fn create_execution(&self, record: ExecutionRecord) {
        if let Err(err) = self.inner.create_execution(record).await {
            tracing::warn!(error = %err, "persistence sink rejected execution record");
        }
    }

    pub async fn store_node_result(&self, record: NodeResultRecord) {
        if let Err(err) = self.inner.store_node_result(record).await {
            tracing::warn!(error = %err, "persistence sink rejected node result");
        }
    }

    pub async fn update_status(&self, update: StatusUpdate) {
        if let Err(err) = self.inner.update_status(update).await {
            tracing::warn!(error = %err, "persistence sink rejected status update");
        }
    }
}
