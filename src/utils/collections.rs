//! Constructors for the hash-map types used throughout the engine.
//!
//! The engine uses [`FxHashMap`] for all internal keyed storage. These
//! helpers exist so call sites do not repeat the turbofish-heavy default
//! constructors.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// New empty `String -> Value` map, the shape of scratch bags, variables,
/// and accumulator records.
#[must_use]
pub fn new_value_map() -> FxHashMap<String, Value> {
    FxHashMap::default()
}
