//! Lookups over tree-shaped records (scalar | sequence | mapping).

use serde_json::Value;

/// Walk a dotted path one mapping lookup at a time.
///
/// Returns `None` when any component is missing or a non-mapping value sits
/// in the middle of the path.
pub fn resolve_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |node, key| node.as_object()?.get(key))
}

/// Text form of a scalar; `None` for null, sequences and mappings.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Join a sequence into one string with a single space between elements.
pub fn join_sequence(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
