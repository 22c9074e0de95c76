//! Plugin dispatch glue: everything between "task is ready" and "plugin
//! future is running".
//!
//! Preparation is synchronous — expression resolution, input gathering,
//! schema checks, credential binding — and happens while the scheduler
//! still owns the state. The returned [`PreparedCall`] is then moved into a
//! spawned future ([`execute_prepared`]) that loads credentials, invokes
//! the plugin, and validates its output.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::{CredentialError, CredentialLoader};
use crate::expressions::{resolve_value, ExecutionMeta, ResolutionScope};
use crate::graphs::ExecutionGraph;
use crate::inputs::{gather_inputs, GatherError, NodeInputs};
use crate::plugins::{
    LoopScope, NodeOutput, NodeState, Plugin, PluginContext, PluginError, PluginRegistry,
    PluginSchemas,
};
use crate::routine::RoutineNode;
use crate::state::{ExecutionState, ScopedOutputs};
use crate::utils::json_ext::{json_type_name, matches_declared_type};

use super::scheduler::Task;

/// Collaborators and run identity shared by every dispatch of a run.
pub struct DispatchEnv {
    pub graph: Arc<ExecutionGraph>,
    pub plugins: Arc<PluginRegistry>,
    pub credentials: Arc<dyn CredentialLoader>,
    pub meta: ExecutionMeta,
    pub workflow_id: String,
    pub user_id: Option<String>,
}

/// Errors that fail a single task at dispatch time or during execution.
#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    #[error("node {node_id}: plugin not found: {plugin_id}")]
    #[diagnostic(code(kianax::dispatch::plugin_not_found))]
    PluginNotFound { node_id: String, plugin_id: String },

    #[error("node {node_id}: input validation failed: {message}")]
    #[diagnostic(code(kianax::dispatch::input_validation))]
    InputValidationFailed { node_id: String, message: String },

    #[error("node {node_id}: output validation failed: {message}")]
    #[diagnostic(code(kianax::dispatch::output_validation))]
    OutputValidationFailed { node_id: String, message: String },

    #[error("node {node_id}: failed to load credential {credential_id}: {message}")]
    #[diagnostic(
        code(kianax::dispatch::credential_load),
        help("Check the node's credentialMappings and the credential store.")
    )]
    CredentialLoadFailed {
        node_id: String,
        credential_id: String,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gather(#[from] GatherError),

    #[error("node {node_id}: emitted branch {branch:?} with no matching edge (available: {available:?})")]
    #[diagnostic(
        code(kianax::dispatch::unrouted_branch),
        help("Add a branch-conditioned connection for this value or change the plugin output.")
    )]
    UnroutedBranch {
        node_id: String,
        branch: String,
        available: Vec<String>,
    },

    #[error("node {node_id}: plugin execution failed: {message}")]
    #[diagnostic(code(kianax::dispatch::plugin_execution))]
    PluginExecutionFailed {
        node_id: String,
        message: String,
        stack: Option<String>,
    },
}

impl DispatchError {
    /// Stable taxonomy tag recorded on error records and sink rows.
    #[must_use]
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::PluginNotFound { .. } => "PLUGIN_NOT_FOUND",
            Self::InputValidationFailed { .. } => "INPUT_VALIDATION_FAILED",
            Self::OutputValidationFailed { .. } => "OUTPUT_VALIDATION_FAILED",
            Self::CredentialLoadFailed { .. } => "CREDENTIAL_LOAD_FAILED",
            Self::Gather(inner) => inner.kind_tag(),
            Self::UnroutedBranch { .. } => "UNROUTED_BRANCH",
            Self::PluginExecutionFailed { .. } => "PLUGIN_EXECUTION_FAILED",
        }
    }

    /// Stack trace, when the underlying plugin error carried one.
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::PluginExecutionFailed { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// One credential to load before plugin invocation.
#[derive(Clone, Debug)]
pub struct CredentialBinding {
    pub requirement_id: String,
    pub credential_id: String,
    pub required: bool,
}

/// Everything a spawned plugin call needs, detached from the scheduler's
/// mutable state.
pub struct PreparedCall {
    pub plugin: Arc<dyn Plugin>,
    pub schemas: PluginSchemas,
    pub inputs: NodeInputs,
    pub config: Value,
    pub node_state: NodeState,
    pub bindings: Vec<CredentialBinding>,
    pub node_id: String,
}

/// Synchronous dispatch preparation: resolve expressions, gather and
/// validate inputs, bind credentials, and scope the node's scratch bag.
pub fn prepare(
    env: &DispatchEnv,
    state: &mut ExecutionState,
    task: &Task,
    node: &RoutineNode,
) -> Result<PreparedCall, DispatchError> {
    let Some(plugin) = env.plugins.get(&node.plugin_id) else {
        return Err(DispatchError::PluginNotFound {
            node_id: node.id.clone(),
            plugin_id: node.plugin_id.clone(),
        });
    };
    let schemas = plugin.schemas();

    // Expressions see outputs as visible from this task's loop scope.
    let outputs = ScopedOutputs::new(state, &task.stack);
    let scope = ResolutionScope {
        variables: env.graph.variables(),
        trigger: env.graph.trigger_data(),
        execution: &env.meta,
        outputs: &outputs,
    };
    let resolved = resolve_value(&node.parameters, &scope);
    for warning in &resolved.warnings {
        tracing::warn!(
            node = %node.id,
            expression = %warning.raw,
            reason = %warning.message,
            "expression resolved to undefined"
        );
    }

    let inputs = gather_inputs(&env.graph, state, &node.id, &task.stack)?;
    validate_inputs(&node.id, &schemas, &inputs)?;

    let bindings = bind_credentials(node, &plugin)?;

    let loop_scope = task.stack.innermost().map(|frame| LoopScope {
        edge_id: frame.edge_id.clone(),
        iteration: frame.iteration,
        accumulator: state
            .loop_state(&frame.edge_id)
            .map(|ls| ls.accumulator.clone())
            .unwrap_or_default(),
    });
    let node_state = NodeState::new(state.node_state(&node.id), loop_scope);

    Ok(PreparedCall {
        plugin,
        schemas,
        inputs,
        config: resolved.value,
        node_state,
        bindings,
        node_id: node.id.clone(),
    })
}

/// The asynchronous half: load credentials, invoke the plugin, validate the
/// output against its declared port schemas.
pub async fn execute_prepared(
    call: PreparedCall,
    env: Arc<DispatchEnv>,
) -> Result<NodeOutput, DispatchError> {
    let mut credentials: FxHashMap<String, _> = FxHashMap::default();
    for binding in &call.bindings {
        match env.credentials.load(&binding.credential_id).await {
            Ok(record) => {
                credentials.insert(binding.requirement_id.clone(), record);
            }
            Err(err) if binding.required => {
                return Err(credential_failure(&call.node_id, &binding.credential_id, err));
            }
            Err(err) => {
                tracing::warn!(
                    node = %call.node_id,
                    credential = %binding.credential_id,
                    error = %err,
                    "optional credential unavailable"
                );
            }
        }
    }

    let context = PluginContext {
        user_id: env.user_id.clone(),
        routine_id: env.meta.routine_id.clone(),
        execution_id: env.meta.execution_id.clone(),
        node_id: call.node_id.clone(),
        credentials,
        trigger_data: env.graph.trigger_data().clone(),
    };

    let output = call
        .plugin
        .execute(call.inputs, call.config, context, call.node_state)
        .await
        .map_err(|err| plugin_failure(&call.node_id, err))?;

    validate_output(&call.node_id, &call.schemas, &output)?;
    Ok(output)
}

/// Bind every credential requirement to a stored-credential id, failing
/// fast when a required one has no mapping. Mappings without a matching
/// requirement load as optional extras.
fn bind_credentials(
    node: &RoutineNode,
    plugin: &Arc<dyn Plugin>,
) -> Result<Vec<CredentialBinding>, DispatchError> {
    let metadata = plugin.metadata();
    let mut bindings = Vec::new();

    for requirement in &metadata.credential_requirements {
        match node.credential_mappings.get(&requirement.id) {
            Some(credential_id) => bindings.push(CredentialBinding {
                requirement_id: requirement.id.clone(),
                credential_id: credential_id.clone(),
                required: requirement.required,
            }),
            None if requirement.required => {
                return Err(DispatchError::CredentialLoadFailed {
                    node_id: node.id.clone(),
                    credential_id: requirement.id.clone(),
                    message: "required credential has no mapping".into(),
                });
            }
            None => {}
        }
    }

    for (requirement_id, credential_id) in &node.credential_mappings {
        if !metadata
            .credential_requirements
            .iter()
            .any(|req| &req.id == requirement_id)
        {
            bindings.push(CredentialBinding {
                requirement_id: requirement_id.clone(),
                credential_id: credential_id.clone(),
                required: false,
            });
        }
    }

    Ok(bindings)
}

fn credential_failure(node_id: &str, credential_id: &str, err: CredentialError) -> DispatchError {
    DispatchError::CredentialLoadFailed {
        node_id: node_id.to_string(),
        credential_id: credential_id.to_string(),
        message: err.to_string(),
    }
}

fn plugin_failure(node_id: &str, err: PluginError) -> DispatchError {
    let (message, stack) = match err {
        PluginError::Failed { message, stack } => (message, stack),
        other => (other.to_string(), None),
    };
    DispatchError::PluginExecutionFailed {
        node_id: node_id.to_string(),
        message,
        stack,
    }
}

/// Unknown input keys are rejected; declared types are checked against the
/// gathered values.
fn validate_inputs(
    node_id: &str,
    schemas: &PluginSchemas,
    inputs: &NodeInputs,
) -> Result<(), DispatchError> {
    for (name, slot) in inputs.iter() {
        let Some(spec) = schemas.inputs.get(name) else {
            return Err(DispatchError::InputValidationFailed {
                node_id: node_id.to_string(),
                message: format!("unknown input {name:?}"),
            });
        };
        if !matches_declared_type(&spec.schema, &slot.value) {
            return Err(DispatchError::InputValidationFailed {
                node_id: node_id.to_string(),
                message: format!(
                    "input {name:?} has type {}, schema expects {}",
                    json_type_name(&slot.value),
                    spec.schema
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                ),
            });
        }
    }
    Ok(())
}

/// Unknown output ports are rejected; declared types are checked against
/// the first item of each port.
fn validate_output(
    node_id: &str,
    schemas: &PluginSchemas,
    output: &NodeOutput,
) -> Result<(), DispatchError> {
    for (name, items) in output.ports() {
        let Some(spec) = schemas.outputs.get(name) else {
            return Err(DispatchError::OutputValidationFailed {
                node_id: node_id.to_string(),
                message: format!("unknown output port {name:?}"),
            });
        };
        if let Some(first) = items.first()
            && !matches_declared_type(&spec.schema, &first.data)
        {
            return Err(DispatchError::OutputValidationFailed {
                node_id: node_id.to_string(),
                message: format!(
                    "port {name:?} carries {}, schema expects {}",
                    json_type_name(&first.data),
                    spec.schema
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                ),
            });
        }
    }
    Ok(())
}
