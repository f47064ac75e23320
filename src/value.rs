//! Containment matching over JSON values.
//!
//! Step conditions are partial-match predicates: every key or element named
//! by the pattern must be present in the target with a matching value, and
//! anything the pattern does not mention is ignored. This mirrors jsonb
//! containment (`@>`) so flows behave the same against the memory store and
//! the Postgres store.

use serde_json::Value;

/// Returns true when `target` contains `pattern`.
///
/// - Objects: every pattern key must exist in the target and contain the
///   pattern value recursively.
/// - Arrays: every pattern element must be contained by at least one target
///   element (order-independent).
/// - Scalars and null compare by equality.
pub fn value_contains(target: &Value, pattern: &Value) -> bool {
    match (target, pattern) {
        (Value::Object(target), Value::Object(pattern)) => {
            pattern.iter().all(|(key, expected)| match target.get(key) {
                Some(actual) => value_contains(actual, expected),
                None => false,
            })
        }
        (Value::Array(target), Value::Array(pattern)) => pattern
            .iter()
            .all(|expected| target.iter().any(|actual| value_contains(actual, expected))),
        _ => target == pattern,
    }
}

/// Evaluates a step's condition pair against its input.
///
/// `condition` must be contained by the input and `condition_not` must not
/// be. An absent or empty pattern always matches.
pub fn condition_met(
    input: &Value,
    condition: Option<&Value>,
    condition_not: Option<&Value>,
) -> bool {
    let positive = match condition {
        Some(pattern) if !is_empty_pattern(pattern) => value_contains(input, pattern),
        _ => true,
    };
    let negative = match condition_not {
        Some(pattern) if !is_empty_pattern(pattern) => !value_contains(input, pattern),
        _ => true,
    };
    positive && negative
}

fn is_empty_pattern(pattern: &Value) -> bool {
    match pattern {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
