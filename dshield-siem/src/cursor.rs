//! Opaque stream cursors
//!
//! A cursor is the sort-key value(s) of the last returned document,
//! serialized deterministically. Multi-value cursors (timestamp + id for
//! session streams) join components with `|`.

use dshield_core::ValidationError;
use serde_json::Value;

const SEPARATOR: char = '|';

/// Encode the sort values of the last document into a cursor token.
///
/// Returns `None` for an empty sort value list (no more documents).
pub fn encode_cursor(sort_values: &[Value]) -> Option<String> {
    if sort_values.is_empty() {
        return None;
    }
    Some(
        sort_values
            .iter()
            .map(component_to_string)
            .collect::<Vec<_>>()
            .join(&SEPARATOR.to_string()),
    )
}

/// Decode a cursor token back into `search_after` values.
///
/// Numeric components decode as JSON numbers (the backend compares sort
/// keys by type), everything else as strings.
pub fn decode_cursor(cursor: &str) -> Result<Vec<Value>, ValidationError> {
    if cursor.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "cursor".to_string(),
            reason: "cursor must not be empty".to_string(),
        });
    }
    Ok(cursor.split(SEPARATOR).map(parse_component).collect())
}

fn component_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_component(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(text.to_string())
}
