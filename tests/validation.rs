mod common;

use serde_json::json;

use common::fixtures::{base_registry, number_var, routine, string_var};
use kianax_engine::routine::{Connection, EdgeCondition, LoopConfig, RoutineNode};
use kianax_engine::validation::{validate_routine, validate_with_registry, IssueKind};

#[test]
fn linear_routine_is_valid() {
    let r = routine(
        "ok",
        vec![RoutineNode::new("a", "stock-price"), RoutineNode::new("b", "email")],
        vec![Connection::new("e1", "a", "b")],
    );
    let report = validate_routine(&r);
    assert!(report.valid, "unexpected errors: {:?}", report.errors);
    assert!(report.errors.is_empty());
}

#[test]
fn unknown_edge_endpoints_are_rejected() {
    let r = routine(
        "bad-edge",
        vec![RoutineNode::new("a", "p")],
        vec![Connection::new("e1", "a", "ghost")],
    );
    let report = validate_routine(&r);
    assert!(!report.valid);
    assert!(report.has_error(IssueKind::UnknownNodeRef));
}

#[test]
fn duplicate_node_ids_are_rejected() {
    let r = routine(
        "dup",
        vec![RoutineNode::new("a", "p"), RoutineNode::new("a", "q")],
        vec![],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::DuplicateNodeId));
}

#[test]
fn unmarked_cycles_are_rejected() {
    let r = routine(
        "cycle",
        vec![
            RoutineNode::new("a", "p"),
            RoutineNode::new("b", "p"),
            RoutineNode::new("c", "p"),
        ],
        vec![
            Connection::new("e1", "a", "b"),
            Connection::new("e2", "b", "c"),
            Connection::new("e3", "c", "a"),
        ],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::Cycle));
}

#[test]
fn loop_marked_back_edges_are_not_cycles() {
    let r = routine(
        "loop-ok",
        vec![RoutineNode::new("a", "p"), RoutineNode::new("b", "p")],
        vec![
            Connection::new("e1", "a", "b"),
            Connection::new("back", "b", "a").with_condition(EdgeCondition::Loop {
                loop_config: Some(LoopConfig::new(5)),
            }),
        ],
    );
    let report = validate_routine(&r);
    assert!(report.valid, "unexpected errors: {:?}", report.errors);
}

#[test]
fn loop_config_is_required_and_bounded() {
    let missing = routine(
        "loop-missing",
        vec![RoutineNode::new("a", "p")],
        vec![Connection::new("back", "a", "a")
            .with_condition(EdgeCondition::Loop { loop_config: None })],
    );
    assert!(validate_routine(&missing).has_error(IssueKind::MissingLoopConfig));

    for bad in [0, 1001] {
        let r = routine(
            "loop-range",
            vec![RoutineNode::new("a", "p")],
            vec![Connection::new("back", "a", "a").with_condition(EdgeCondition::Loop {
                loop_config: Some(LoopConfig::new(bad)),
            })],
        );
        assert!(
            validate_routine(&r).has_error(IssueKind::LoopIterationsOutOfRange),
            "maxIterations {bad} should be out of range"
        );
    }

    for good in [1, 1000] {
        let r = routine(
            "loop-range-ok",
            vec![RoutineNode::new("a", "p")],
            vec![Connection::new("back", "a", "a").with_condition(EdgeCondition::Loop {
                loop_config: Some(LoopConfig::new(good)),
            })],
        );
        assert!(validate_routine(&r).valid);
    }
}

#[test]
fn disconnected_nodes_are_reported_in_multi_node_routines() {
    let r = routine(
        "island",
        vec![
            RoutineNode::new("a", "p"),
            RoutineNode::new("b", "p"),
            RoutineNode::new("island", "p"),
        ],
        vec![Connection::new("e1", "a", "b")],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::DisconnectedNode));

    // A single node with no edges is a complete routine.
    let single = routine("single", vec![RoutineNode::new("a", "p")], vec![]);
    assert!(validate_routine(&single).valid);
}

#[test]
fn branch_fanout_warns_about_unprovable_coverage() {
    let r = routine(
        "branches",
        vec![
            RoutineNode::new("a", "p"),
            RoutineNode::new("b", "p"),
            RoutineNode::new("c", "p"),
        ],
        vec![
            Connection::new("e1", "a", "b").with_condition(EdgeCondition::Branch {
                value: "true".into(),
            }),
            Connection::new("e2", "a", "c").with_condition(EdgeCondition::Branch {
                value: "false".into(),
            }),
        ],
    );
    let report = validate_routine(&r);
    assert!(report.valid);
    assert!(report.has_warning(IssueKind::BranchCoverage));
}

#[test]
fn undefined_variables_are_rejected() {
    let mut r = routine(
        "vars",
        vec![RoutineNode::new("a", "p").with_parameters(json!({"x": "{{ vars.missing }}"}))],
        vec![],
    );
    r.variables = vec![string_var("present", "yes")];
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::UndefinedVariable));
}

#[test]
fn node_references_must_be_upstream() {
    let r = routine(
        "refs",
        vec![
            RoutineNode::new("a", "p"),
            RoutineNode::new("b", "p")
                .with_parameters(json!({"x": "{{ nodes.a.price }}"})),
            RoutineNode::new("c", "p")
                .with_parameters(json!({"x": "{{ nodes.b.result }}"})),
        ],
        // b is downstream of a; c is NOT downstream of b.
        vec![
            Connection::new("e1", "a", "b"),
            Connection::new("e2", "a", "c"),
        ],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::NotUpstream));
    // The a -> b reference is fine.
    assert!(
        !report
            .errors
            .iter()
            .any(|i| i.node_id.as_deref() == Some("b"))
    );
}

#[test]
fn self_and_unknown_node_references_are_rejected() {
    let r = routine(
        "self-ref",
        vec![
            RoutineNode::new("a", "p").with_parameters(json!({
                "me": "{{ nodes.a.out }}",
                "ghost": "{{ nodes.zz.out }}"
            })),
            RoutineNode::new("b", "p"),
        ],
        vec![Connection::new("e1", "a", "b")],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::SelfReference));
    assert!(report.has_error(IssueKind::InvalidNodeRef));
}

#[test]
fn upstream_references_over_loop_edges_do_not_count() {
    // b -> a only via a loop edge; a referencing b is not upstream.
    let r = routine(
        "loop-not-upstream",
        vec![
            RoutineNode::new("a", "p")
                .with_parameters(json!({"x": "{{ nodes.b.total }}"})),
            RoutineNode::new("b", "p"),
        ],
        vec![
            Connection::new("e1", "a", "b"),
            Connection::new("back", "b", "a").with_condition(EdgeCondition::Loop {
                loop_config: Some(LoopConfig::new(2)),
            }),
        ],
    );
    let report = validate_routine(&r);
    assert!(report.has_error(IssueKind::NotUpstream));
}

#[test]
fn unknown_expression_sources_warn() {
    let mut r = routine(
        "unknown-source",
        vec![RoutineNode::new("a", "p").with_parameters(json!({"x": "{{ env.HOME }}"}))],
        vec![],
    );
    r.variables = vec![number_var("n", 1)];
    let report = validate_routine(&r);
    assert!(report.valid);
    assert!(report.has_warning(IssueKind::UnknownExpressionSource));
}

#[test]
fn registry_validation_checks_plugins_and_handles() {
    let registry = base_registry();

    let unknown_plugin = routine(
        "unknown-plugin",
        vec![RoutineNode::new("a", "no-such-plugin")],
        vec![],
    );
    let report = validate_with_registry(&unknown_plugin, &registry);
    assert!(report.has_error(IssueKind::PluginNotFound));

    let bad_handle = routine(
        "bad-handle",
        vec![
            RoutineNode::new("a", "stock-price"),
            RoutineNode::new("b", "email"),
        ],
        vec![Connection::new("e1", "a", "b").with_handles(Some("nope"), Some("result"))],
    );
    let report = validate_with_registry(&bad_handle, &registry);
    assert!(report.valid);
    assert!(report.has_warning(IssueKind::UnknownSourceHandle));

    let unmapped_credential = routine(
        "unmapped-cred",
        vec![RoutineNode::new("a", "cred-echo")],
        vec![],
    );
    let report = validate_with_registry(&unmapped_credential, &registry);
    assert!(report.has_warning(IssueKind::MissingCredentialMapping));
}
