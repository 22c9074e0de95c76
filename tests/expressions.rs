mod common;

use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};

use common::fixtures::{number_var, quiet_engine, registry_with, routine, string_var};
use common::plugins::ConfigProbePlugin;
use kianax_engine::engine::ExecutionOptions;
use kianax_engine::expressions::resolver::NoOutputs;
use kianax_engine::expressions::{resolve_value, ExecutionMeta, ResolutionScope};
use kianax_engine::routine::{Connection, RoutineNode};
use kianax_engine::types::ExecutionStatus;
use kianax_engine::utils::collections::new_value_map;

fn empty_scope_parts() -> (ExecutionMeta, Value) {
    (
        ExecutionMeta {
            execution_id: "exec_t".into(),
            routine_id: "r-t".into(),
            started_at: Utc::now(),
        },
        Value::Null,
    )
}

#[tokio::test]
async fn parameters_resolve_with_type_preservation() {
    let probe = Arc::new(ConfigProbePlugin::new());
    let engine = quiet_engine(registry_with(probe.clone()));

    let mut r = routine(
        "exprs",
        vec![RoutineNode::new("n1", "config-probe").with_parameters(json!({
            "url": "{{ vars.apiBase }}/u/{{ trigger.userId }}",
            "limit": "{{ vars.maxItems }}"
        }))],
        vec![],
    );
    r.variables = vec![
        string_var("apiBase", "https://api.example.com"),
        number_var("maxItems", 100),
    ];
    r.trigger_data = Some(json!({"userId": "u-1"}));

    let report = engine.execute(&r, ExecutionOptions::default()).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);

    let seen = probe.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        json!({
            "url": "https://api.example.com/u/u-1",
            "limit": 100
        })
    );
    // The whole-value expression preserved the number type.
    assert!(seen[0]["limit"].is_number());
}

#[tokio::test]
async fn upstream_outputs_resolve_through_nodes_source() {
    let probe = Arc::new(ConfigProbePlugin::new());
    let engine = quiet_engine(registry_with(probe.clone()));

    let r = routine(
        "node-refs",
        vec![
            RoutineNode::new("n1", "stock-price"),
            RoutineNode::new("n2", "config-probe").with_parameters(json!({
                "quoted": "{{ nodes.n1.price }}",
                "record": "{{ nodes.n1 }}"
            })),
        ],
        vec![Connection::new("e1", "n1", "n2")],
    );

    let report = engine.execute(&r, ExecutionOptions::default()).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);

    let seen = probe.seen.lock().clone();
    assert_eq!(seen[0]["quoted"], json!(145));
    assert_eq!(seen[0]["record"], json!({"price": 145}));
}

#[test]
fn execution_metadata_resolves() {
    let (meta, trigger) = empty_scope_parts();
    let variables = new_value_map();
    let scope = ResolutionScope {
        variables: &variables,
        trigger: &trigger,
        execution: &meta,
        outputs: &NoOutputs,
    };
    let resolved = resolve_value(
        &json!({
            "id": "{{ execution.id }}",
            "routine": "{{ execution.routineId }}",
            "at": "{{ execution.startedAt }}"
        }),
        &scope,
    );
    assert_eq!(resolved.value["id"], json!("exec_t"));
    assert_eq!(resolved.value["routine"], json!("r-t"));
    assert!(resolved.value["at"].as_str().unwrap().contains('T'));
}

proptest! {
    /// resolve(resolve(v)) == resolve(v) whenever the first pass produced
    /// no remaining expressions.
    #[test]
    fn resolution_is_idempotent(text in "[a-zA-Z0-9 ./:_-]{0,48}") {
        let (meta, trigger) = empty_scope_parts();
        let mut variables = new_value_map();
        variables.insert("x".into(), json!("value"));
        let scope = ResolutionScope {
            variables: &variables,
            trigger: &trigger,
            execution: &meta,
            outputs: &NoOutputs,
        };

        let value = json!({"a": text, "b": format!("{{{{ vars.x }}}} {text}")});
        let once = resolve_value(&value, &scope);
        let twice = resolve_value(&once.value, &scope);
        prop_assert_eq!(once.value, twice.value);
    }

    /// Values with no expression syntax pass through untouched.
    #[test]
    fn plain_values_pass_through(text in "[a-zA-Z0-9 ]{0,32}", n in any::<i64>()) {
        let (meta, trigger) = empty_scope_parts();
        let variables = new_value_map();
        let scope = ResolutionScope {
            variables: &variables,
            trigger: &trigger,
            execution: &meta,
            outputs: &NoOutputs,
        };
        let value = json!({"s": text, "n": n, "b": true, "z": null});
        let resolved = resolve_value(&value, &scope);
        prop_assert_eq!(resolved.value, value);
        prop_assert!(resolved.warnings.is_empty());
    }
}
