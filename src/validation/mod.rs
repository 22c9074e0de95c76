//! Routine validation.
//!
//! The validator rejects any routine that cannot be executed
//! deterministically, before any side effects occur. Structural rules cover
//! edge endpoint resolution, duplicate ids, acyclicity of the non-loop
//! subgraph, loop configuration bounds, and disconnected nodes; expression
//! rules ([`expressions`]) cover declared variables and upstream-only node
//! references. [`validate_with_registry`] adds plugin-aware checks for
//! embedders that can supply the registry ahead of execution.
//!
//! The engine refuses to execute a routine whose report carries any error.

pub mod expressions;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::plugins::PluginRegistry;
use crate::routine::{Connection, Routine};

/// Classification of a validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    // Structural errors
    UnknownNodeRef,
    DuplicateNodeId,
    Cycle,
    DisconnectedNode,
    MissingLoopConfig,
    LoopIterationsOutOfRange,
    // Expression errors
    UndefinedVariable,
    InvalidNodeRef,
    NotUpstream,
    SelfReference,
    // Warnings
    BranchCoverage,
    InvalidExpression,
    UnknownExpressionSource,
    UnknownSourceHandle,
    MissingCredentialMapping,
    // Registry-aware errors
    PluginNotFound,
}

impl IssueKind {
    /// Stable taxonomy tag.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UnknownNodeRef => "UNKNOWN_NODE_REF",
            Self::DuplicateNodeId => "DUPLICATE_NODE_ID",
            Self::Cycle => "CYCLE",
            Self::DisconnectedNode => "DISCONNECTED_NODE",
            Self::MissingLoopConfig => "MISSING_LOOP_CONFIG",
            Self::LoopIterationsOutOfRange => "LOOP_ITERATIONS_OUT_OF_RANGE",
            Self::UndefinedVariable => "UNDEFINED_VARIABLE",
            Self::InvalidNodeRef => "INVALID_NODE_REF",
            Self::NotUpstream => "NOT_UPSTREAM",
            Self::SelfReference => "SELF_REFERENCE",
            Self::BranchCoverage => "BRANCH_COVERAGE",
            Self::InvalidExpression => "INVALID_EXPRESSION",
            Self::UnknownExpressionSource => "UNKNOWN_EXPRESSION_SOURCE",
            Self::UnknownSourceHandle => "UNKNOWN_SOURCE_HANDLE",
            Self::MissingCredentialMapping => "MISSING_CREDENTIAL_MAPPING",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
        }
    }
}

/// One validation finding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
}

impl ValidationIssue {
    #[must_use]
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            edge_id: None,
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_edge(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

/// Outcome of validating a routine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }

    fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    fn warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    /// `true` when any error carries the given kind.
    #[must_use]
    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|issue| issue.kind == kind)
    }

    /// `true` when any warning carries the given kind.
    #[must_use]
    pub fn has_warning(&self, kind: IssueKind) -> bool {
        self.warnings.iter().any(|issue| issue.kind == kind)
    }

    /// One-line summary of every error, for the rejection message.
    #[must_use]
    pub fn summarize_errors(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.kind.tag(), issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate a routine's structure and expressions.
#[must_use]
pub fn validate_routine(routine: &Routine) -> ValidationReport {
    let mut report = ValidationReport::default();

    let node_ids = check_node_ids(routine, &mut report);
    check_edges(routine, &node_ids, &mut report);
    check_cycles(routine, &node_ids, &mut report);
    check_disconnected(routine, &mut report);
    check_branch_coverage(routine, &mut report);
    expressions::check_expressions(routine, &mut report);

    report.finish()
}

/// Validate with plugin-registry knowledge: plugin ids must resolve,
/// required credential requirements must be mapped, and edge source
/// handles should name declared output ports.
#[must_use]
pub fn validate_with_registry(routine: &Routine, registry: &PluginRegistry) -> ValidationReport {
    let mut report = validate_routine(routine);

    for node in &routine.nodes {
        let Some(plugin) = registry.get(&node.plugin_id) else {
            report.error(
                ValidationIssue::new(
                    IssueKind::PluginNotFound,
                    format!("node {} uses unknown plugin {:?}", node.id, node.plugin_id),
                )
                .with_node(&node.id),
            );
            continue;
        };
        for requirement in plugin.metadata().credential_requirements {
            if requirement.required && !node.credential_mappings.contains_key(&requirement.id) {
                report.warning(
                    ValidationIssue::new(
                        IssueKind::MissingCredentialMapping,
                        format!(
                            "node {} does not map required credential {:?}",
                            node.id, requirement.id
                        ),
                    )
                    .with_node(&node.id),
                );
            }
        }
    }

    for edge in &routine.connections {
        let Some(handle) = edge.source_handle.as_deref() else {
            continue;
        };
        let Some(source) = routine.node(&edge.source_node_id) else {
            continue;
        };
        let Some(plugin) = registry.get(&source.plugin_id) else {
            continue;
        };
        if !plugin.schemas().outputs.contains_key(handle) {
            report.warning(
                ValidationIssue::new(
                    IssueKind::UnknownSourceHandle,
                    format!(
                        "edge {} reads port {:?} which plugin {:?} never declares",
                        edge.id, handle, source.plugin_id
                    ),
                )
                .with_edge(&edge.id),
            );
        }
    }

    report.finish()
}

fn check_node_ids(routine: &Routine, report: &mut ValidationReport) -> FxHashSet<String> {
    let mut seen = FxHashSet::default();
    for node in &routine.nodes {
        if !seen.insert(node.id.clone()) {
            report.error(
                ValidationIssue::new(
                    IssueKind::DuplicateNodeId,
                    format!("node id {:?} declared more than once", node.id),
                )
                .with_node(&node.id),
            );
        }
    }
    seen
}

fn check_edges(routine: &Routine, node_ids: &FxHashSet<String>, report: &mut ValidationReport) {
    for edge in &routine.connections {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if !node_ids.contains(endpoint) {
                report.error(
                    ValidationIssue::new(
                        IssueKind::UnknownNodeRef,
                        format!("edge {} references undeclared node {:?}", edge.id, endpoint),
                    )
                    .with_edge(&edge.id),
                );
            }
        }

        if edge.is_loop() {
            match edge.loop_config() {
                None => report.error(
                    ValidationIssue::new(
                        IssueKind::MissingLoopConfig,
                        format!("loop edge {} has no loopConfig", edge.id),
                    )
                    .with_edge(&edge.id),
                ),
                Some(config) if !config.iterations_in_range() => report.error(
                    ValidationIssue::new(
                        IssueKind::LoopIterationsOutOfRange,
                        format!(
                            "loop edge {} maxIterations {} outside [1, 1000]",
                            edge.id, config.max_iterations
                        ),
                    )
                    .with_edge(&edge.id),
                ),
                Some(_) => {}
            }
        }
    }
}

/// DFS with a recursion stack over the non-loop subgraph. The first
/// back-edge found that is not marked as a loop is reported as a cycle.
fn check_cycles(routine: &Routine, node_ids: &FxHashSet<String>, report: &mut ValidationReport) {
    let mut adjacency: FxHashMap<&str, Vec<&Connection>> = FxHashMap::default();
    for edge in &routine.connections {
        if edge.is_loop()
            || !node_ids.contains(&edge.source_node_id)
            || !node_ids.contains(&edge.target_node_id)
        {
            continue;
        }
        adjacency
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge);
    }

    let mut visited: FxHashSet<&str> = FxHashSet::default();
    let mut on_stack: FxHashSet<&str> = FxHashSet::default();

    for node in &routine.nodes {
        if !visited.contains(node.id.as_str())
            && let Some(edge) =
                first_back_edge(node.id.as_str(), &adjacency, &mut visited, &mut on_stack)
        {
            report.error(
                ValidationIssue::new(
                    IssueKind::Cycle,
                    format!(
                        "cycle through edge {} ({} -> {}); only loop-marked back-edges may close cycles",
                        edge.id, edge.source_node_id, edge.target_node_id
                    ),
                )
                .with_edge(&edge.id),
            );
            return;
        }
    }
}

fn first_back_edge<'r>(
    node: &'r str,
    adjacency: &FxHashMap<&'r str, Vec<&'r Connection>>,
    visited: &mut FxHashSet<&'r str>,
    on_stack: &mut FxHashSet<&'r str>,
) -> Option<&'r Connection> {
    visited.insert(node);
    on_stack.insert(node);
    if let Some(edges) = adjacency.get(node) {
        for &edge in edges {
            let target = edge.target_node_id.as_str();
            if on_stack.contains(target) {
                return Some(edge);
            }
            if !visited.contains(target)
                && let Some(found) = first_back_edge(target, adjacency, visited, on_stack)
            {
                return Some(found);
            }
        }
    }
    on_stack.remove(node);
    None
}

fn check_disconnected(routine: &Routine, report: &mut ValidationReport) {
    if routine.nodes.len() <= 1 {
        return;
    }
    let mut connected: FxHashSet<&str> = FxHashSet::default();
    for edge in &routine.connections {
        connected.insert(edge.source_node_id.as_str());
        connected.insert(edge.target_node_id.as_str());
    }
    for node in &routine.nodes {
        if !connected.contains(node.id.as_str()) {
            report.error(
                ValidationIssue::new(
                    IssueKind::DisconnectedNode,
                    format!("node {:?} is not connected to any flow edge", node.id),
                )
                .with_node(&node.id),
            );
        }
    }
}

/// Branch coverage cannot be proved without executing the node, so nodes
/// with branch-conditioned fan-out get a warning listing the values the
/// routine handles.
fn check_branch_coverage(routine: &Routine, report: &mut ValidationReport) {
    let mut by_source: FxHashMap<&str, Vec<&Connection>> = FxHashMap::default();
    for edge in &routine.connections {
        by_source
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge);
    }

    for (source, edges) in by_source {
        if edges.len() < 2 {
            continue;
        }
        let branch_values: Vec<&str> = edges.iter().filter_map(|e| e.branch_value()).collect();
        if branch_values.is_empty() {
            continue;
        }
        report.warning(
            ValidationIssue::new(
                IssueKind::BranchCoverage,
                format!(
                    "node {:?} routes on branches {:?}; coverage of every emitted value cannot be proved statically",
                    source, branch_values
                ),
            )
            .with_node(source),
        );
    }
}
