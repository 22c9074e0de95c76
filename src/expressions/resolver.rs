//! Substitution of parsed references into parameter values.
//!
//! Resolution never raises: unknown sources and missing paths resolve to
//! undefined (JSON `null` in type-preserving position, the empty string in
//! interpolation) and are reported as [`ResolutionWarning`]s for the caller
//! to log. The validator is responsible for rejecting undefined variables
//! and non-upstream node references before execution starts.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::parser::{
    find_expressions, parse_reference, single_expression, PathSegment, RefSource, Reference,
};
use crate::utils::json_ext::to_display_string;

/// Read access to upstream node outputs, as visible from the resolving
/// task's context. Implemented by the execution state with the loop-scope
/// walk; validation uses [`NoOutputs`].
pub trait OutputSource {
    /// `{port: firstItemData}` record across the node's ports in its
    /// visible run.
    fn port_record(&self, node_id: &str) -> Option<Value>;

    /// First item data of one named port of the node's visible run.
    fn port_value(&self, node_id: &str, port: &str) -> Option<Value>;
}

/// An [`OutputSource`] with no outputs at all. Every `nodes.*` reference
/// resolves to undefined.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOutputs;

impl OutputSource for NoOutputs {
    fn port_record(&self, _node_id: &str) -> Option<Value> {
        None
    }

    fn port_value(&self, _node_id: &str, _port: &str) -> Option<Value> {
        None
    }
}

/// Metadata of the running execution, readable as `{{ execution.* }}`.
#[derive(Clone, Debug)]
pub struct ExecutionMeta {
    pub execution_id: String,
    pub routine_id: String,
    pub started_at: DateTime<Utc>,
}

/// Everything a resolution pass can read.
pub struct ResolutionScope<'a> {
    pub variables: &'a FxHashMap<String, Value>,
    pub trigger: &'a Value,
    pub execution: &'a ExecutionMeta,
    pub outputs: &'a dyn OutputSource,
}

/// A reference that did not resolve cleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionWarning {
    /// The expression body as written.
    pub raw: String,
    pub message: String,
}

/// Result of resolving one parameter value.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub value: Value,
    pub warnings: Vec<ResolutionWarning>,
}

/// Resolve every `{{ … }}` occurrence inside `value`, recursively for
/// objects and arrays. Non-string primitives pass through unchanged.
///
/// A string that is exactly one expression is replaced by the referenced
/// value with its type preserved; otherwise each expression interpolates
/// into the surrounding string (objects as JSON, null/undefined as empty).
#[must_use]
pub fn resolve_value(value: &Value, scope: &ResolutionScope<'_>) -> Resolved {
    let mut warnings = Vec::new();
    let value = resolve_inner(value, scope, &mut warnings);
    Resolved { value, warnings }
}

fn resolve_inner(
    value: &Value,
    scope: &ResolutionScope<'_>,
    warnings: &mut Vec<ResolutionWarning>,
) -> Value {
    match value {
        Value::String(text) => resolve_string(text, scope, warnings),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_inner(item, scope, warnings))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_inner(item, scope, warnings));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn resolve_string(
    text: &str,
    scope: &ResolutionScope<'_>,
    warnings: &mut Vec<ResolutionWarning>,
) -> Value {
    if let Some(body) = single_expression(text) {
        return lookup_body(body, scope, warnings).unwrap_or(Value::Null);
    }

    let spans = find_expressions(text);
    if spans.is_empty() {
        return Value::String(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, body) in spans {
        out.push_str(&text[cursor..start]);
        let resolved = lookup_body(body, scope, warnings).unwrap_or(Value::Null);
        out.push_str(&to_display_string(&resolved));
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Value::String(out)
}

fn lookup_body(
    body: &str,
    scope: &ResolutionScope<'_>,
    warnings: &mut Vec<ResolutionWarning>,
) -> Option<Value> {
    let reference = match parse_reference(body) {
        Ok(reference) => reference,
        Err(err) => {
            warnings.push(ResolutionWarning {
                raw: body.trim().to_string(),
                message: err.to_string(),
            });
            return None;
        }
    };
    lookup_reference(&reference, scope, warnings)
}

fn lookup_reference(
    reference: &Reference,
    scope: &ResolutionScope<'_>,
    warnings: &mut Vec<ResolutionWarning>,
) -> Option<Value> {
    match &reference.source {
        RefSource::Vars => {
            let PathSegment::Key(name) = reference.path.first()? else {
                return None;
            };
            let base = scope.variables.get(name)?;
            get_path(base, &reference.path[1..]).cloned()
        }
        RefSource::Nodes => lookup_node(reference, scope),
        RefSource::Trigger => get_path(scope.trigger, &reference.path).cloned(),
        RefSource::Execution => lookup_execution(reference, scope),
        RefSource::Unknown(source) => {
            warnings.push(ResolutionWarning {
                raw: reference.raw.clone(),
                message: format!("unknown expression source: {source}"),
            });
            None
        }
    }
}

fn lookup_node(reference: &Reference, scope: &ResolutionScope<'_>) -> Option<Value> {
    let node_id = reference.node_id()?;
    if reference.path.len() == 1 {
        return scope.outputs.port_record(node_id);
    }
    let port = reference.port_name()?;
    let base = scope.outputs.port_value(node_id, port)?;
    get_path(&base, &reference.path[2..]).cloned()
}

fn lookup_execution(reference: &Reference, scope: &ResolutionScope<'_>) -> Option<Value> {
    let PathSegment::Key(field) = reference.path.first()? else {
        return None;
    };
    match field.as_str() {
        "id" => Some(Value::String(scope.execution.execution_id.clone())),
        "routineId" => Some(Value::String(scope.execution.routine_id.clone())),
        "startedAt" => Some(Value::String(scope.execution.started_at.to_rfc3339())),
        _ => None,
    }
}

/// Walk a path of keys and indexes into a JSON value. Missing steps return
/// `None` without raising.
fn get_path<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match segment {
            PathSegment::Key(key) => current.get(key.as_str())?,
            PathSegment::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}

/// Collect every reference appearing anywhere inside `value`.
///
/// Malformed expression bodies are skipped; the validator reports them
/// through its own channel.
#[must_use]
pub fn extract_references(value: &Value) -> Vec<Reference> {
    let mut refs = Vec::new();
    collect_references(value, &mut refs);
    refs
}

fn collect_references(value: &Value, refs: &mut Vec<Reference>) {
    match value {
        Value::String(text) => {
            for (_, _, body) in find_expressions(text) {
                if let Ok(reference) = parse_reference(body) {
                    refs.push(reference);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, refs);
            }
        }
        _ => {}
    }
}
