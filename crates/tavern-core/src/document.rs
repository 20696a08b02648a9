//! Schemaless document records and lenient field accessors.
//!
//! A [`Document`] is the unit of persistence for both per-user records and
//! named game-data sections. The store enforces no schema; these helpers give
//! callers a consistent, forgiving way to read and mutate numeric fields,
//! including nested ones addressed by a dotted path (`"inventory.health_potion"`).
//!
//! Lenient rule: a missing or non-numeric field reads as `0`. Game records
//! accumulate fields from many features over their lifetime, and economy code
//! must not fail because an unrelated feature stored something odd.

use serde_json::{Map, Value};

/// An opaque persisted record: field names mapped to JSON values.
pub type Document = Map<String, Value>;

/// Look up a value by dotted path.
///
/// Returns `None` if any path segment is missing or an intermediate value is
/// not an object.
#[must_use]
pub fn get<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut node = doc.get(first)?;
    for part in parts {
        node = node.as_object()?.get(part)?;
    }
    Some(node)
}

/// Read a numeric field by dotted path, treating missing or non-numeric
/// values as `0`. Fractional values truncate toward zero.
#[must_use]
pub fn get_i64(doc: &Document, path: &str) -> i64 {
    get(doc, path).map_or(0, as_i64_lenient)
}

/// Set a value by dotted path, creating intermediate objects as needed.
///
/// An intermediate that exists but is not an object is replaced by a fresh
/// object; the old value at that segment is discarded.
pub fn set(doc: &mut Document, path: &str, value: Value) {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else { return };
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        doc.insert(first.to_string(), value);
        return;
    }
    let slot = doc
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    set_nested(slot, &rest, value);
}

/// Add `delta` to a numeric field by dotted path and return the new value.
///
/// A missing or non-numeric field counts as `0` before the increment.
pub fn incr_i64(doc: &mut Document, path: &str, delta: i64) -> i64 {
    let next = get_i64(doc, path) + delta;
    set(doc, path, Value::from(next));
    next
}

#[allow(clippy::cast_possible_truncation)]
fn as_i64_lenient(value: &Value) -> i64 {
    if let Some(n) = value.as_i64() {
        n
    } else if let Some(f) = value.as_f64() {
        f as i64
    } else {
        0
    }
}

fn set_nested(node: &mut Value, path: &[&str], value: Value) {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Some(map) = node.as_object_mut() else {
        return;
    };
    match path {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_nested(child, rest, value);
        }
    }
}
