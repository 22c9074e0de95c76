#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use kianax_engine::engine::RoutineEngine;
use kianax_engine::event_bus::EventBus;
use kianax_engine::plugins::{Plugin, PluginRegistry};
use kianax_engine::routine::{
    Connection, EdgeCondition, LoopConfig, Routine, RoutineNode, Variable, VariableType,
};

use super::plugins::{
    CredEchoPlugin, DelayPlugin, EmailPlugin, FailingPlugin, HttpPlugin, IfElsePlugin, SeedPlugin,
    StockPricePlugin, WildPlugin,
};

/// Registry with every stateless test plugin. Tests needing probe handles
/// (ai-transform, counter, config-probe) register those themselves.
pub fn base_registry() -> PluginRegistry {
    PluginRegistry::new()
        .with_plugin(Arc::new(StockPricePlugin))
        .with_plugin(Arc::new(HttpPlugin))
        .with_plugin(Arc::new(EmailPlugin))
        .with_plugin(Arc::new(IfElsePlugin))
        .with_plugin(Arc::new(SeedPlugin))
        .with_plugin(Arc::new(FailingPlugin))
        .with_plugin(Arc::new(DelayPlugin))
        .with_plugin(Arc::new(CredEchoPlugin))
        .with_plugin(Arc::new(WildPlugin))
}

/// Engine over `registry` with a sinkless event bus, so tests stay quiet.
pub fn quiet_engine(registry: PluginRegistry) -> RoutineEngine {
    RoutineEngine::new(registry).with_event_bus(EventBus::sinkless())
}

pub fn routine(name: &str, nodes: Vec<RoutineNode>, connections: Vec<Connection>) -> Routine {
    Routine {
        id: Some(format!("r-{name}")),
        name: name.to_string(),
        nodes,
        connections,
        trigger_data: None,
        variables: Vec::new(),
    }
}

pub fn string_var(name: &str, value: &str) -> Variable {
    Variable::new(name, VariableType::String, json!(value))
}

pub fn number_var(name: &str, value: i64) -> Variable {
    Variable::new(name, VariableType::Number, json!(value))
}

/// Scenario: `n1(stock-price) -> n2(ai-transform) -> n3(email)`.
/// The ai-transform plugin is registered by the caller.
pub fn linear_routine() -> Routine {
    routine(
        "linear",
        vec![
            RoutineNode::new("n1", "stock-price"),
            RoutineNode::new("n2", "ai-transform"),
            RoutineNode::new("n3", "email"),
        ],
        vec![
            Connection::new("e1", "n1", "n2"),
            Connection::new("e2", "n2", "n3"),
        ],
    )
}

/// Scenario: `n1(stock-price)` and `n2(http)` joining into
/// `n3(ai-transform)` through named handles.
pub fn parallel_join_routine() -> Routine {
    let mut r = routine(
        "parallel-join",
        vec![
            RoutineNode::new("n1", "stock-price").with_parameters(json!({"price": 150.5})),
            RoutineNode::new("n2", "http"),
            RoutineNode::new("n3", "ai-transform"),
        ],
        vec![
            Connection::new("e1", "n1", "n3").with_handles(Some("price"), Some("stockData")),
            Connection::new("e2", "n2", "n3").with_handles(Some("data"), Some("newsData")),
        ],
    );
    r.trigger_data = Some(Value::Null);
    r
}

/// Scenario: conditional fan-out. `emit` is the branch value the if-else
/// node produces.
pub fn conditional_routine(emit: &str) -> Routine {
    routine(
        "conditional",
        vec![
            RoutineNode::new("n1", "stock-price"),
            RoutineNode::new("n2", "if-else").with_parameters(json!({"emit": emit})),
            RoutineNode::new("n3", "http"),
            RoutineNode::new("n4", "email"),
        ],
        vec![
            Connection::new("e1", "n1", "n2"),
            Connection::new("e2", "n2", "n3").with_condition(EdgeCondition::Branch {
                value: "true".into(),
            }),
            Connection::new("e3", "n2", "n4").with_condition(EdgeCondition::Branch {
                value: "false".into(),
            }),
        ],
    )
}

/// Scenario: `n1(seed) -> n2(counter)` with a self-loop on `n2`
/// accumulating `total`. The counter plugin is registered by the caller.
pub fn loop_routine(max_iterations: u32) -> Routine {
    routine(
        "loop",
        vec![
            RoutineNode::new("n1", "seed"),
            RoutineNode::new("n2", "counter"),
        ],
        vec![
            Connection::new("e1", "n1", "n2"),
            Connection::new("loop-1", "n2", "n2").with_condition(EdgeCondition::Loop {
                loop_config: Some(
                    LoopConfig::new(max_iterations).with_accumulator_fields(["total"]),
                ),
            }),
        ],
    )
}

/// Registry plus one extra probe plugin.
pub fn registry_with(extra: Arc<dyn Plugin>) -> PluginRegistry {
    base_registry().with_plugin(extra)
}
