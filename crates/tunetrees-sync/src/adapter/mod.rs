//! Casing + Adapter Layer.
//!
//! Pure, stateless row transforms between the remote wire shape (camelCase
//! JSON) and the local store shape (snake_case SQLite row). Nothing here
//! touches the network or the database — `toLocal`/`toRemote` are free
//! functions over `Row` so they're trivial to unit test in isolation.

pub mod overrides;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::registry::TableMeta;
use crate::row::Row;

/// `camelCase` (remote) -> `snake_case` (local).
pub(crate) fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `snake_case` (local) -> `camelCase` (remote).
pub(crate) fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for c in s.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Accepts ISO-T (`2024-05-01T12:00:00Z`) or space-separated
/// (`2024-05-01 12:00:00`) input, always emits canonical RFC3339 with a `Z`
/// suffix.
pub fn normalize_timestamp(raw: &str) -> String {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc).to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    }
    let space_form = raw.replacen('T', " ", 1).trim_end_matches('Z').to_string();
    if let Ok(naive) = NaiveDateTime::parse_from_str(&space_form, "%Y-%m-%d %H:%M:%S%.f") {
        let dt = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
        return dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    }
    // Already canonical, or unparseable — pass through rather than panic;
    // a malformed timestamp surfaces as a downstream comparison anomaly,
    // not a crash in the adapter.
    raw.to_string()
}

/// Current instant in the canonical RFC3339/UTC form every `last_modified_at`
/// column uses.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn local_name(remote_key: &str, meta: &TableMeta) -> String {
    for (local, remote) in meta.name_overrides.renames {
        if *remote == remote_key {
            return local.to_string();
        }
    }
    camel_to_snake(remote_key)
}

fn remote_name(local_key: &str, meta: &TableMeta) -> String {
    for (local, remote) in meta.name_overrides.renames {
        if *local == local_key {
            return remote.to_string();
        }
    }
    snake_to_camel(local_key)
}

fn coerce_bool_to_local(v: &Value) -> Value {
    match v {
        Value::Number(n) => Value::Bool(n.as_i64().map(|i| i != 0).unwrap_or(false)),
        other => other.clone(),
    }
}

fn coerce_bool_to_remote(v: &Value) -> Value {
    match v {
        Value::Bool(b) => Value::Number((*b as i64).into()),
        other => other.clone(),
    }
}

/// `toLocal(remoteRow, tableMeta)`: rename keys, coerce booleans, normalize
/// timestamps — the shape the local store's upsert expects.
pub fn to_local(remote_row: &Row, meta: &TableMeta) -> Row {
    let override_cols = overrides::for_table(meta.name).map(|o| o.datetime_cols).unwrap_or(&[]);
    let mut out = Row::new();
    for (remote_key, value) in remote_row {
        let local_key = local_name(remote_key, meta);
        let value = if meta.boolean_cols.contains(&local_key.as_str()) {
            coerce_bool_to_local(value)
        } else if local_key == meta.timestamp_col || override_cols.contains(&local_key.as_str()) {
            value
                .as_str()
                .map(|s| Value::String(normalize_timestamp(s)))
                .unwrap_or_else(|| value.clone())
        } else {
            value.clone()
        };
        out.insert(local_key, value);
    }
    out
}

/// `toRemote(localRow, tableMeta)`: inverse of [`to_local`], plus stripping
/// outbox-only bookkeeping columns that have no remote counterpart.
pub fn to_remote(local_row: &Row, meta: &TableMeta) -> Row {
    const OUTBOX_ONLY: &[&str] = &["outbox_seq", "sync_writer_origin"];
    let override_cols = overrides::for_table(meta.name).map(|o| o.datetime_cols).unwrap_or(&[]);
    let mut out = Row::new();
    for (local_key, value) in local_row {
        if OUTBOX_ONLY.contains(&local_key.as_str()) {
            continue;
        }
        let remote_key = remote_name(local_key, meta);
        let value = if meta.boolean_cols.contains(&local_key.as_str()) {
            coerce_bool_to_remote(value)
        } else if local_key == meta.timestamp_col || override_cols.contains(&local_key.as_str()) {
            value
                .as_str()
                .map(|s| Value::String(normalize_timestamp(s)))
                .unwrap_or_else(|| value.clone())
        } else {
            value.clone()
        };
        out.insert(remote_key, value);
    }
    out
}

/// Column set used as the upsert conflict target.
pub fn conflict_keys(meta: &TableMeta) -> Vec<&'static str> {
    meta.push_rule.conflict_target.columns()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog;
    use serde_json::json;

    #[test]
    fn camel_snake_roundtrip() {
        assert_eq!(camel_to_snake("windowStartUtc"), "window_start_utc");
        assert_eq!(snake_to_camel("window_start_utc"), "windowStartUtc");
    }

    #[test]
    fn to_local_coerces_booleans_and_renames() {
        let reg = catalog::build();
        let meta = reg.get("playlist").unwrap();
        let remote = serde_json::from_value::<Row>(json!({
            "id": "p1",
            "userRef": "u1",
            "isDefault": 1,
            "genreDefault": "irish",
            "lastModifiedAt": "2024-05-01 12:00:00",
        }))
        .unwrap();
        let local = to_local(&remote, meta);
        assert_eq!(local.get("is_default"), Some(&Value::Bool(true)));
        assert_eq!(local.get("default_genre"), Some(&Value::String("irish".into())));
        assert_eq!(
            local.get("last_modified_at"),
            Some(&Value::String("2024-05-01T12:00:00.000Z".into()))
        );
    }

    #[test]
    fn to_remote_strips_outbox_only_columns() {
        let reg = catalog::build();
        let meta = reg.get("tune").unwrap();
        let local = serde_json::from_value::<Row>(json!({
            "id": "t1",
            "outbox_seq": 42,
        }))
        .unwrap();
        let remote = to_remote(&local, meta);
        assert!(!remote.contains_key("outboxSeq"));
        assert_eq!(remote.get("id"), Some(&Value::String("t1".into())));
    }

    #[test]
    fn conflict_keys_match_composite_pk() {
        let reg = catalog::build();
        let meta = reg.get("playlist_tune").unwrap();
        assert_eq!(conflict_keys(meta), vec!["playlist", "tune"]);
    }
}
