//! Execution id generation.

use uuid::Uuid;

/// Generator for the engine's run-scoped identifiers.
///
/// Ids are UUIDv4-backed with a short prefix so they are recognizable in
/// logs and sink records.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Id for one `execute()` call.
    #[must_use]
    pub fn generate_execution_id(&self) -> String {
        format!("exec_{}", Uuid::new_v4().simple())
    }

    /// Id for the durable workflow the host associates with a run.
    #[must_use]
    pub fn generate_workflow_id(&self) -> String {
        format!("wf_{}", Uuid::new_v4().simple())
    }
}
