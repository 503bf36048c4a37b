//! Conflict Resolver: deterministic last-write-wins.
//!
//! A pure function, called by both pipelines — push uses it to interpret a
//! remote rejection, pull uses it to decide whether an incoming row is worth
//! applying. `device_id` is diagnostic only and never enters the comparison.

use crate::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    KeepLocal,
    TakeRemote,
    Noop,
}

/// `(sync_version, last_modified_at)` compared lexicographically, version
/// first, timestamp as tiebreaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionStamp {
    pub sync_version: i64,
    pub last_modified_at: String,
}

impl VersionStamp {
    pub fn of(row: &Row, version_col: &str, timestamp_col: &str) -> Option<Self> {
        let sync_version = row.get(version_col)?.as_i64()?;
        let last_modified_at = row.get(timestamp_col)?.as_str()?.to_string();
        Some(Self {
            sync_version,
            last_modified_at,
        })
    }
}

/// Given the two stamps for the same logical row, decide the winner. Equal
/// stamps is a `Noop` — nothing to do, not a tie that needs breaking.
pub fn resolve(local: &VersionStamp, remote: &VersionStamp) -> Decision {
    use std::cmp::Ordering;
    match local.cmp(remote) {
        Ordering::Greater => Decision::KeepLocal,
        Ordering::Less => Decision::TakeRemote,
        Ordering::Equal => Decision::Noop,
    }
}

/// `local` is `None` when the row doesn't exist yet locally — always take
/// the incoming row in that case.
pub fn resolve_optional(local: Option<&VersionStamp>, remote: &VersionStamp) -> Decision {
    match local {
        Some(local) => resolve(local, remote),
        None => Decision::TakeRemote,
    }
}
