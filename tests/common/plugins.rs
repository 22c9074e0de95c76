#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use kianax_engine::inputs::NodeInputs;
use kianax_engine::plugins::{
    CredentialRequirement, NodeOutput, NodeState, Plugin, PluginContext, PluginError,
    PluginMetadata, PluginSchemas,
};

/// Emits `{price: <config.price or 145>}`.
#[derive(Debug, Clone, Copy)]
pub struct StockPricePlugin;

#[async_trait]
impl Plugin for StockPricePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("stock-price", "Stock Price").with_tags(["finance"])
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().output("price", "Latest price", json!({"type": "number"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let price = config.get("price").cloned().unwrap_or(json!(145));
        Ok(NodeOutput::new().with_port("price", price))
    }
}

/// Emits `{data: "API response"}`.
#[derive(Debug, Clone, Copy)]
pub struct HttpPlugin;

#[async_trait]
impl Plugin for HttpPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("http", "HTTP Request")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().output("data", "Response body", json!({"type": "string"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        Ok(NodeOutput::new().with_port("data", json!("API response")))
    }
}

/// Records the inputs it received and emits `{result: "summary"}`.
#[derive(Debug, Clone, Default)]
pub struct AiTransformPlugin {
    pub seen_inputs: Arc<Mutex<Vec<Value>>>,
}

impl AiTransformPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for AiTransformPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("ai-transform", "AI Transform").with_tags(["ai"])
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new()
            .input("price", "Upstream price", json!({"type": "number"}))
            .input("stockData", "Stock data", json!({"type": "number"}))
            .input("newsData", "News data", json!({"type": "string"}))
            .output("result", "Transformed result", json!({"type": "string"}))
    }

    async fn execute(
        &self,
        inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        self.seen_inputs.lock().push(inputs.to_value());
        Ok(NodeOutput::new().with_port("result", json!("summary")))
    }
}

/// Emits `{success: true}`.
#[derive(Debug, Clone, Copy)]
pub struct EmailPlugin;

#[async_trait]
impl Plugin for EmailPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("email", "Send Email")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new()
            .input("result", "Message body", json!({"type": "string"}))
            .output("success", "Delivery flag", json!({"type": "boolean"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        Ok(NodeOutput::new().with_port("success", json!(true)))
    }
}

/// Emits only a branch, taken from `config.emit` (default `"true"`).
#[derive(Debug, Clone, Copy)]
pub struct IfElsePlugin;

#[async_trait]
impl Plugin for IfElsePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("if-else", "If / Else")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().input("price", "Compared value", json!({"type": "number"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let branch = config
            .get("emit")
            .and_then(Value::as_str)
            .unwrap_or("true")
            .to_string();
        Ok(NodeOutput::new().with_branch(branch))
    }
}

/// Emits `{value: <config.value or 1>}`.
#[derive(Debug, Clone, Copy)]
pub struct SeedPlugin;

#[async_trait]
impl Plugin for SeedPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("seed", "Seed")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().output("value", "Seed value", json!({"type": "integer"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let value = config.get("value").cloned().unwrap_or(json!(1));
        Ok(NodeOutput::new().with_port("value", value))
    }
}

/// Counts its own runs through the scratch bag and emits
/// `{total: 10 * run}`. Records the loop context it observed on each call.
#[derive(Debug, Clone, Default)]
pub struct CounterPlugin {
    /// One entry per call: `{"iteration": n, "accumulator": {...}}`, or
    /// `null` outside loops.
    pub observed: Arc<Mutex<Vec<Value>>>,
}

impl CounterPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for CounterPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("counter", "Counter")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new()
            .input("value", "Seed value", json!({"type": "integer"}))
            .input("total", "Previous total", json!({"type": "number"}))
            .output("total", "Running total", json!({"type": "number"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let run = state.get("count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        state.set("count", json!(run));

        let seen = state.loop_context().map_or(Value::Null, |scope| {
            json!({
                "iteration": scope.iteration,
                "accumulator": scope.accumulator.clone().into_iter().collect::<serde_json::Map<_, _>>(),
            })
        });
        self.observed.lock().push(seen);

        Ok(NodeOutput::new().with_port("total", json!(run * 10)))
    }
}

/// Always fails with a stack-carrying error.
#[derive(Debug, Clone, Copy)]
pub struct FailingPlugin;

#[async_trait]
impl Plugin for FailingPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("failing", "Always Fails")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().output("never", "Never produced", json!({"type": "null"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        Err(PluginError::with_stack("boom", "at failing.rs:1"))
    }
}

/// Sleeps `config.ms` milliseconds (default 10), then emits `{done: true}`.
#[derive(Debug, Clone, Copy)]
pub struct DelayPlugin;

#[async_trait]
impl Plugin for DelayPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("delay", "Delay")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new()
            .input("done", "Upstream completion", json!({"type": "boolean"}))
            .output("done", "Completion flag", json!({"type": "boolean"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let ms = config.get("ms").and_then(Value::as_u64).unwrap_or(10);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(NodeOutput::new().with_port("done", json!(true)))
    }
}

/// Requires the `api_key` credential and echoes its token.
#[derive(Debug, Clone, Copy)]
pub struct CredEchoPlugin;

#[async_trait]
impl Plugin for CredEchoPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("cred-echo", "Credential Echo")
            .with_credential_requirement(CredentialRequirement::required("api_key"))
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().output("token", "Echoed token", json!({"type": "string"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        let token = context
            .credentials
            .get("api_key")
            .and_then(|record| record.data.get("token"))
            .cloned()
            .ok_or_else(|| PluginError::msg("api_key credential missing token"))?;
        Ok(NodeOutput::new().with_port("token", token))
    }
}

/// Declares no outputs but emits one anyway, to exercise output validation.
#[derive(Debug, Clone, Copy)]
pub struct WildPlugin;

#[async_trait]
impl Plugin for WildPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("wild", "Undeclared Output")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new()
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        _config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        Ok(NodeOutput::new().with_port("mystery", json!(42)))
    }
}

/// Records its resolved config and emits nothing.
#[derive(Debug, Clone, Default)]
pub struct ConfigProbePlugin {
    pub seen: Arc<Mutex<Vec<Value>>>,
}

impl ConfigProbePlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for ConfigProbePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("config-probe", "Config Probe")
    }

    fn schemas(&self) -> PluginSchemas {
        PluginSchemas::new().input("price", "Upstream price", json!({"type": "number"}))
    }

    async fn execute(
        &self,
        _inputs: NodeInputs,
        config: Value,
        _context: PluginContext,
        _state: NodeState,
    ) -> Result<NodeOutput, PluginError> {
        self.seen.lock().push(config);
        Ok(NodeOutput::new())
    }
}
