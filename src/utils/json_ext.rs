//! JSON helpers shared by the resolver, gatherer, and schema checks.

use serde_json::Value;

/// Human-readable JSON type name, matching the vocabulary used in port
/// schemas (`"object"`, `"array"`, `"string"`, `"number"`, `"integer"`,
/// `"boolean"`, `"null"`).
#[must_use]
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `true` when `declared` accepts a value of `value`'s JSON type.
///
/// `"integer"` values satisfy a declared `"number"`; everything satisfies a
/// missing or non-string declaration.
#[must_use]
pub fn matches_declared_type(declared: &Value, value: &Value) -> bool {
    let Some(expected) = declared.get("type").and_then(Value::as_str) else {
        return true;
    };
    let actual = json_type_name(value);
    actual == expected || (expected == "number" && actual == "integer")
}

/// Canonical string form used when interpolating a value into a larger
/// string: strings pass through unquoted, `null` becomes empty, other
/// primitives use their JSON form, and objects/arrays stringify as JSON.
#[must_use]
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_names_cover_integer_vs_number() {
        assert_eq!(json_type_name(&json!(3)), "integer");
        assert_eq!(json_type_name(&json!(3.5)), "number");
        assert!(matches_declared_type(&json!({"type": "number"}), &json!(3)));
        assert!(!matches_declared_type(&json!({"type": "integer"}), &json!(3.5)));
    }

    #[test]
    fn display_string_forms() {
        assert_eq!(to_display_string(&Value::Null), "");
        assert_eq!(to_display_string(&json!("x")), "x");
        assert_eq!(to_display_string(&json!(100)), "100");
        assert_eq!(to_display_string(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
