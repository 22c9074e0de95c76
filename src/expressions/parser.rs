//! Parsing of `{{ … }}` expression references.

use miette::Diagnostic;
use thiserror::Error;

/// Errors produced while parsing a single expression body.
#[derive(Debug, Error, Diagnostic)]
pub enum ExpressionParseError {
    #[error("empty expression")]
    #[diagnostic(code(kianax::expressions::empty))]
    Empty,

    #[error("invalid path segment at offset {offset}: {found:?}")]
    #[diagnostic(
        code(kianax::expressions::invalid_segment),
        help("segments are identifiers with optional integer indexing, e.g. `items[0].name`")
    )]
    InvalidSegment { offset: usize, found: String },

    #[error("unterminated index in segment {segment:?}")]
    #[diagnostic(code(kianax::expressions::unterminated_index))]
    UnterminatedIndex { segment: String },

    #[error("non-integer index in segment {segment:?}")]
    #[diagnostic(code(kianax::expressions::bad_index))]
    BadIndex { segment: String },
}

/// Root namespace of a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefSource {
    /// Routine-level variables: `vars.NAME[.path…]`.
    Vars,
    /// Upstream node outputs: `nodes.ID[.port[.path…]]`.
    Nodes,
    /// Trigger payload: `trigger[.path…]`.
    Trigger,
    /// Execution metadata: `execution.{id|routineId|startedAt}`.
    Execution,
    /// Anything else. Resolves to undefined with a warning.
    Unknown(String),
}

impl RefSource {
    fn from_ident(ident: &str) -> Self {
        match ident {
            "vars" => Self::Vars,
            "nodes" => Self::Nodes,
            "trigger" => Self::Trigger,
            "execution" => Self::Execution,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One step of a reference path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `{{ … }}` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub source: RefSource,
    pub path: Vec<PathSegment>,
    /// The expression body as written, for diagnostics.
    pub raw: String,
}

impl Reference {
    /// For `nodes.*` references, the referenced node id.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        if self.source != RefSource::Nodes {
            return None;
        }
        match self.path.first() {
            Some(PathSegment::Key(id)) => Some(id),
            _ => None,
        }
    }

    /// For `nodes.ID.PORT…` references, the referenced port name.
    #[must_use]
    pub fn port_name(&self) -> Option<&str> {
        if self.source != RefSource::Nodes {
            return None;
        }
        match self.path.get(1) {
            Some(PathSegment::Key(port)) => Some(port),
            _ => None,
        }
    }

    /// For `vars.NAME…` references, the referenced variable name.
    #[must_use]
    pub fn variable_name(&self) -> Option<&str> {
        if self.source != RefSource::Vars {
            return None;
        }
        match self.path.first() {
            Some(PathSegment::Key(name)) => Some(name),
            _ => None,
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parse one expression body (the text between `{{` and `}}`).
pub fn parse_reference(body: &str) -> Result<Reference, ExpressionParseError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ExpressionParseError::Empty);
    }

    let mut segments: Vec<PathSegment> = Vec::new();
    let mut source: Option<RefSource> = None;

    for (piece_index, piece) in trimmed.split('.').enumerate() {
        if piece.is_empty() {
            return Err(ExpressionParseError::InvalidSegment {
                offset: piece_index,
                found: piece.to_string(),
            });
        }
        let (ident, indexes) = split_indexes(piece)?;
        if ident.is_empty() || !ident.chars().all(is_ident_char) {
            return Err(ExpressionParseError::InvalidSegment {
                offset: piece_index,
                found: piece.to_string(),
            });
        }
        if piece_index == 0 {
            source = Some(RefSource::from_ident(ident));
        } else {
            segments.push(PathSegment::Key(ident.to_string()));
        }
        for index in indexes {
            segments.push(PathSegment::Index(index));
        }
    }

    Ok(Reference {
        // split() always yields at least one piece for non-empty input
        source: source.ok_or(ExpressionParseError::Empty)?,
        path: segments,
        raw: trimmed.to_string(),
    })
}

/// Split `ident[3][0]` into the identifier and its trailing indexes.
fn split_indexes(piece: &str) -> Result<(&str, Vec<usize>), ExpressionParseError> {
    let Some(bracket) = piece.find('[') else {
        return Ok((piece, Vec::new()));
    };
    let (ident, mut rest) = piece.split_at(bracket);
    let mut indexes = Vec::new();
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(ExpressionParseError::InvalidSegment {
                offset: 0,
                found: piece.to_string(),
            });
        }
        let Some(close) = rest.find(']') else {
            return Err(ExpressionParseError::UnterminatedIndex {
                segment: piece.to_string(),
            });
        };
        let digits = &rest[1..close];
        let index = digits
            .parse::<usize>()
            .map_err(|_| ExpressionParseError::BadIndex {
                segment: piece.to_string(),
            })?;
        indexes.push(index);
        rest = &rest[close + 1..];
    }
    Ok((ident, indexes))
}

/// Locate every `{{ … }}` span in a string. Returns `(start, end, body)`
/// with `end` pointing past the closing braces. Unterminated openers are
/// left untouched in the surrounding text.
#[must_use]
pub fn find_expressions(text: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find("{{") {
        let start = cursor + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        found.push((start, end, &text[start + 2..end - 2]));
        cursor = end;
    }
    found
}

/// When the entire string is a single expression with no surrounding
/// characters, return its body. This is the type-preserving case.
#[must_use]
pub fn single_expression(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if !trimmed.starts_with("{{") || !trimmed.ends_with("}}") || trimmed.len() < 4 {
        return None;
    }
    let body = &trimmed[2..trimmed.len() - 2];
    // An inner "}}" would mean two adjacent expressions, not one.
    if body.contains("}}") || body.contains("{{") {
        return None;
    }
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources_and_paths() {
        let r = parse_reference("vars.apiBase").unwrap();
        assert_eq!(r.source, RefSource::Vars);
        assert_eq!(r.variable_name(), Some("apiBase"));

        let r = parse_reference("nodes.n1.price.history[0]").unwrap();
        assert_eq!(r.source, RefSource::Nodes);
        assert_eq!(r.node_id(), Some("n1"));
        assert_eq!(r.port_name(), Some("price"));
        assert_eq!(
            r.path,
            vec![
                PathSegment::Key("n1".into()),
                PathSegment::Key("price".into()),
                PathSegment::Key("history".into()),
                PathSegment::Index(0),
            ]
        );
    }

    #[test]
    fn unknown_source_is_preserved() {
        let r = parse_reference("env.HOME").unwrap();
        assert_eq!(r.source, RefSource::Unknown("env".into()));
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(parse_reference("").is_err());
        assert!(parse_reference("vars..x").is_err());
        assert!(parse_reference("vars.items[").is_err());
        assert!(parse_reference("vars.items[one]").is_err());
    }

    #[test]
    fn finds_spans_and_single_expressions() {
        let text = "{{ vars.apiBase }}/u/{{ trigger.userId }}";
        let spans = find_expressions(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].2.trim(), "vars.apiBase");
        assert!(single_expression(text).is_none());
        assert_eq!(
            single_expression("{{ vars.maxItems }}").map(str::trim),
            Some("vars.maxItems")
        );
    }
}
