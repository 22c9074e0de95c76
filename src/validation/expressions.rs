//! Expression reference validation.
//!
//! Every `{{ vars.NAME }}` must name a declared variable, and every
//! `{{ nodes.ID.* }}` must reference a node that is a topological ancestor
//! of the referrer via non-loop edges — otherwise the value could not exist
//! when the referrer runs. Self-references and references to undeclared
//! nodes are rejected outright.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{IssueKind, ValidationIssue, ValidationReport};
use crate::expressions::parser::{find_expressions, parse_reference, RefSource};
use crate::expressions::Reference;
use crate::routine::Routine;
use serde_json::Value;

pub(super) fn check_expressions(routine: &Routine, report: &mut ValidationReport) {
    let declared_vars: FxHashSet<&str> =
        routine.variables.iter().map(|v| v.name.as_str()).collect();
    let node_ids: FxHashSet<&str> = routine.nodes.iter().map(|n| n.id.as_str()).collect();
    let reverse = reverse_adjacency(routine);

    for node in &routine.nodes {
        let mut malformed = Vec::new();
        let references = collect_with_malformed(&node.parameters, &mut malformed);

        for body in malformed {
            report.warnings.push(
                ValidationIssue::new(
                    IssueKind::InvalidExpression,
                    format!("node {}: unparseable expression {{{{ {body} }}}}", node.id),
                )
                .with_node(&node.id),
            );
        }

        for reference in references {
            check_reference(
                node.id.as_str(),
                &reference,
                &declared_vars,
                &node_ids,
                &reverse,
                report,
            );
        }
    }
}

fn check_reference(
    referrer: &str,
    reference: &Reference,
    declared_vars: &FxHashSet<&str>,
    node_ids: &FxHashSet<&str>,
    reverse: &FxHashMap<&str, Vec<&str>>,
    report: &mut ValidationReport,
) {
    match &reference.source {
        RefSource::Vars => {
            let Some(name) = reference.variable_name() else {
                report.warnings.push(
                    ValidationIssue::new(
                        IssueKind::InvalidExpression,
                        format!("node {referrer}: vars reference without a name"),
                    )
                    .with_node(referrer),
                );
                return;
            };
            if !declared_vars.contains(name) {
                report.errors.push(
                    ValidationIssue::new(
                        IssueKind::UndefinedVariable,
                        format!("node {referrer}: variable {name:?} is not declared"),
                    )
                    .with_node(referrer),
                );
            }
        }
        RefSource::Nodes => {
            let Some(target) = reference.node_id() else {
                report.warnings.push(
                    ValidationIssue::new(
                        IssueKind::InvalidExpression,
                        format!("node {referrer}: nodes reference without a node id"),
                    )
                    .with_node(referrer),
                );
                return;
            };
            if target == referrer {
                report.errors.push(
                    ValidationIssue::new(
                        IssueKind::SelfReference,
                        format!("node {referrer} references its own output"),
                    )
                    .with_node(referrer),
                );
            } else if !node_ids.contains(target) {
                report.errors.push(
                    ValidationIssue::new(
                        IssueKind::InvalidNodeRef,
                        format!("node {referrer} references undeclared node {target:?}"),
                    )
                    .with_node(referrer),
                );
            } else if !is_ancestor(target, referrer, reverse) {
                report.errors.push(
                    ValidationIssue::new(
                        IssueKind::NotUpstream,
                        format!(
                            "node {referrer} references {target:?}, which is not upstream of it"
                        ),
                    )
                    .with_node(referrer),
                );
            }
        }
        RefSource::Trigger | RefSource::Execution => {}
        RefSource::Unknown(source) => {
            report.warnings.push(
                ValidationIssue::new(
                    IssueKind::UnknownExpressionSource,
                    format!("node {referrer}: unknown expression source {source:?}"),
                )
                .with_node(referrer),
            );
        }
    }
}

/// Reverse adjacency over non-loop edges: target → sources.
fn reverse_adjacency(routine: &Routine) -> FxHashMap<&str, Vec<&str>> {
    let mut reverse: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for edge in &routine.connections {
        if edge.is_loop() {
            continue;
        }
        reverse
            .entry(edge.target_node_id.as_str())
            .or_default()
            .push(edge.source_node_id.as_str());
    }
    reverse
}

/// BFS up the reverse adjacency from `descendant` looking for `candidate`.
fn is_ancestor(
    candidate: &str,
    descendant: &str,
    reverse: &FxHashMap<&str, Vec<&str>>,
) -> bool {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut frontier: Vec<&str> = vec![descendant];
    while let Some(current) = frontier.pop() {
        let Some(parents) = reverse.get(current) else {
            continue;
        };
        for parent in parents {
            if *parent == candidate {
                return true;
            }
            if seen.insert(parent) {
                frontier.push(parent);
            }
        }
    }
    false
}

/// Like [`crate::expressions::extract_references`], but also reports the
/// bodies that failed to parse so they can be surfaced as warnings.
fn collect_with_malformed(value: &Value, malformed: &mut Vec<String>) -> Vec<Reference> {
    let mut refs = Vec::new();
    walk(value, &mut refs, malformed);
    refs
}

fn walk(value: &Value, refs: &mut Vec<Reference>, malformed: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for (_, _, body) in find_expressions(text) {
                match parse_reference(body) {
                    Ok(reference) => refs.push(reference),
                    Err(_) => malformed.push(body.trim().to_string()),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, refs, malformed);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk(item, refs, malformed);
            }
        }
        _ => {}
    }
}
