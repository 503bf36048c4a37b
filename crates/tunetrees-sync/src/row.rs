//! Shared row representation.
//!
//! A `Row` is a loosely-typed JSON object. Every layer above the local store
//! (adapter, outbox, push, pull) moves rows around as `Row` rather than a
//! generated per-table struct — the registry being declarative only pays off
//! if nothing downstream needs a recompile to add a column.

use serde_json::Value;

pub type Row = serde_json::Map<String, Value>;

pub fn get_str<'a>(row: &'a Row, col: &str) -> Option<&'a str> {
    row.get(col).and_then(Value::as_str)
}

pub fn get_bool(row: &Row, col: &str) -> Option<bool> {
    match row.get(col) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}
