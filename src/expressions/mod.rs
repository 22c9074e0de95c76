//! Expression substitution for node parameters.
//!
//! Parameters may embed `{{ source.path }}` references that are resolved at
//! dispatch time against routine variables, upstream node outputs, trigger
//! data, and execution metadata. Substitution is path-based, not
//! Turing-complete: the grammar is
//!
//! ```text
//! "{{" S* source ("." segment)* S* "}}"
//! source  ∈ { vars, nodes, trigger, execution }
//! segment ∈ identifier | identifier "[" integer "]"
//! ```
//!
//! [`parser`] turns expression text into [`parser::Reference`] values;
//! [`resolver`] substitutes them into parameter values, preserving types
//! for whole-value expressions and interpolating otherwise.

pub mod parser;
pub mod resolver;

pub use parser::{ExpressionParseError, PathSegment, Reference, RefSource};
pub use resolver::{
    extract_references, resolve_value, ExecutionMeta, OutputSource, Resolved, ResolutionScope,
    ResolutionWarning,
};
