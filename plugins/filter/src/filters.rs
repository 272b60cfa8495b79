//! Filter predicates.

use serde_json::Value;

/// True when `value` is a non-zero number, a numeric string that parses to a
/// non-zero value, or an array with at least one non-zero element. Types the
/// filter cannot judge pass as non-zero.
pub fn is_non_zero(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => s.parse::<f64>().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(items) => items.iter().any(is_non_zero),
        _ => true,
    }
}
