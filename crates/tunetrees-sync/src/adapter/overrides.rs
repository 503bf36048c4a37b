//! Per-table adapter overrides for shapes the generic casing/boolean rules
//! don't cover. These live beside the registry entry they modify, not
//! inside the engine.

/// Extra datetime columns (beyond `timestamp_col`) that must be normalized to
/// canonical RFC3339 on read and write.
pub struct AdapterOverride {
    pub table: &'static str,
    pub datetime_cols: &'static [&'static str],
}

/// `daily_practice_queue.window_start_utc` is the frozen window boundary
/// whose wire representation has both ISO-T and space-separated forms in the
/// wild. We canonicalize to RFC3339 with a `Z` suffix on every read and
/// write; `adapter::normalize_timestamp` accepts either form as input.
const OVERRIDES: &[AdapterOverride] = &[AdapterOverride {
    table: "daily_practice_queue",
    datetime_cols: &["window_start_utc"],
}];

pub fn for_table(table: &str) -> Option<&'static AdapterOverride> {
    OVERRIDES.iter().find(|o| o.table == table)
}
