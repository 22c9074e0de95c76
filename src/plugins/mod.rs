//! Plugin interface consumed by the engine.
//!
//! A plugin is a value implementing [`Plugin`]: it declares metadata and
//! port schemas, and executes with gathered inputs, resolved configuration,
//! a read-only [`PluginContext`], and a scoped [`NodeState`] scratch bag.
//! Plugins are looked up by id in a [`PluginRegistry`]; no inheritance is
//! involved anywhere.
//!
//! # Obligations
//!
//! - Plugins are responsible for their own idempotency; the engine does not
//!   provide exactly-once side effects.
//! - Outputs must be small, JSON-serializable values matching the declared
//!   output schemas; unknown output keys are rejected by the scheduler.
//! - Plugins must not retain references to engine state across calls; the
//!   scratch bag handle is the only sanctioned cross-iteration storage.

pub mod output;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::CredentialRecord;
use crate::inputs::NodeInputs;
pub use output::{ItemMetadata, NodeOutput, PortItem, MAIN_PORT};

/// Core trait for executable plugins.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Identity, display name, version, tags, and credential requirements.
    fn metadata(&self) -> PluginMetadata;

    /// Declared input and output ports. The engine validates gathered
    /// inputs and produced outputs against these.
    fn schemas(&self) -> PluginSchemas;

    /// Execute one node invocation.
    async fn execute(
        &self,
        inputs: NodeInputs,
        config: Value,
        context: PluginContext,
        state: NodeState,
    ) -> Result<NodeOutput, PluginError>;

    /// Shorthand for `metadata().id`.
    fn id(&self) -> String {
        self.metadata().id
    }
}

/// Static description of a plugin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_requirements: Vec<CredentialRequirement>,
}

impl PluginMetadata {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0.0".into(),
            tags: Vec::new(),
            credential_requirements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_credential_requirement(mut self, requirement: CredentialRequirement) -> Self {
        self.credential_requirements.push(requirement);
        self
    }
}

/// One credential a plugin needs, keyed by requirement id and satisfied via
/// the node's `credentialMappings`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRequirement {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl CredentialRequirement {
    /// A requirement whose absence fails the task before dispatch.
    #[must_use]
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
            required: true,
        }
    }

    /// A requirement the plugin can work without.
    #[must_use]
    pub fn optional(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
            required: false,
        }
    }
}

/// Declared input and output ports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PluginSchemas {
    #[serde(default)]
    pub inputs: FxHashMap<String, PortSpec>,
    #[serde(default)]
    pub outputs: FxHashMap<String, PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl PluginSchemas {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn input(mut self, name: impl Into<String>, label: impl Into<String>, schema: Value) -> Self {
        self.inputs.insert(name.into(), PortSpec::new(label, schema));
        self
    }

    #[must_use]
    pub fn output(
        mut self,
        name: impl Into<String>,
        label: impl Into<String>,
        schema: Value,
    ) -> Self {
        self.outputs.insert(name.into(), PortSpec::new(label, schema));
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// Declaration of a single port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortSpec {
    pub label: String,
    /// JSON-schema-shaped declaration; the engine checks the `type` field
    /// of each port against the first item's data.
    pub schema: Value,
}

impl PortSpec {
    #[must_use]
    pub fn new(label: impl Into<String>, schema: Value) -> Self {
        Self {
            label: label.into(),
            schema,
        }
    }
}

/// Read-only execution environment handed to a plugin call.
///
/// Credential records are immutable snapshots valid for the duration of the
/// single call.
#[derive(Clone, Debug)]
pub struct PluginContext {
    pub user_id: Option<String>,
    pub routine_id: String,
    pub execution_id: String,
    pub node_id: String,
    /// Requirement id → loaded credential.
    pub credentials: FxHashMap<String, CredentialRecord>,
    pub trigger_data: Value,
}

/// Scoped handle to a node's scratch bag, plus the loop frame the current
/// invocation runs under.
///
/// Repeated calls for the same node return handles to the same underlying
/// bag, so values written in iteration `k` are visible in iteration `k+1`.
#[derive(Clone, Debug)]
pub struct NodeState {
    bag: Arc<Mutex<FxHashMap<String, Value>>>,
    loop_scope: Option<LoopScope>,
}

/// The innermost loop enclosing an invocation, with that loop's accumulator
/// as of dispatch time.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopScope {
    pub edge_id: String,
    pub iteration: u32,
    pub accumulator: FxHashMap<String, Value>,
}

impl NodeState {
    pub(crate) fn new(
        bag: Arc<Mutex<FxHashMap<String, Value>>>,
        loop_scope: Option<LoopScope>,
    ) -> Self {
        Self { bag, loop_scope }
    }

    /// Detached state for plugins executed outside the engine (tests).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            bag: Arc::new(Mutex::new(FxHashMap::default())),
            loop_scope: None,
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.bag.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.bag.lock().remove(key)
    }

    /// Clone of the whole bag.
    #[must_use]
    pub fn snapshot(&self) -> FxHashMap<String, Value> {
        self.bag.lock().clone()
    }

    /// The innermost loop frame this invocation runs under, if any.
    #[must_use]
    pub fn loop_context(&self) -> Option<&LoopScope> {
        self.loop_scope.as_ref()
    }
}

/// Errors raised by plugin implementations.
///
/// The scheduler wraps these as `PLUGIN_EXECUTION_FAILED` task errors with
/// the message and optional stack preserved.
#[derive(Debug, Error, Diagnostic)]
pub enum PluginError {
    #[error("{message}")]
    #[diagnostic(code(kianax::plugins::execution))]
    Failed {
        message: String,
        stack: Option<String>,
    },

    #[error(transparent)]
    #[diagnostic(code(kianax::plugins::serde))]
    Serde(#[from] serde_json::Error),
}

impl PluginError {
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

/// Registry-by-id lookup for plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: FxHashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its metadata id. Re-registering an id
    /// replaces the previous entry.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.id(), plugin);
    }

    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
