//! Outbox: an append-only queue of pending local mutations.
//!
//! Rows are written here exclusively by the SQL triggers the store installer
//! creates per syncable table — nothing in this module ever inserts an
//! outbox row itself. What this module owns is the status state
//! machine (`pending -> syncing -> {deleted, failed}` and back) and the
//! backoff policy that keeps a flaky connection from hammering the remote.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SyncResult;
use crate::registry::RowKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "insert" => Self::Insert,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

/// One row of the outbox.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub seq: i64,
    pub table_name: String,
    pub row_key: RowKey,
    pub operation: Operation,
    pub payload_snapshot: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub status: Status,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Creates the outbox table itself. Per-table triggers that *populate* it
/// live in [`crate::store`], generated from the registry.
pub fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_key TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload_snapshot TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS _outbox_table_status_seq
            ON _outbox(table_name, status, seq);",
    )
}

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    let row_key_json: String = row.get("row_key")?;
    let row_key: RowKey = serde_json::from_str(&row_key_json).unwrap_or(RowKey::Single(row_key_json));
    let payload_raw: String = row.get("payload_snapshot")?;
    let payload_snapshot = serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null);
    let enqueued_at: String = row.get("enqueued_at")?;
    let status: String = row.get("status")?;
    let operation: String = row.get("operation")?;
    Ok(OutboxRow {
        seq: row.get("seq")?,
        table_name: row.get("table_name")?,
        row_key,
        operation: Operation::parse(&operation),
        payload_snapshot,
        enqueued_at: enqueued_at
            .parse()
            .unwrap_or_else(|_| Utc::now()),
        status: match status.as_str() {
            "syncing" => Status::Syncing,
            "synced" => Status::Synced,
            "failed" => Status::Failed,
            _ => Status::Pending,
        },
        attempts: row.get::<_, i64>("attempts")? as u32,
        last_error: row.get("last_error")?,
    })
}

/// Claims up to `limit` `pending` (or back-off-expired `failed`) rows for
/// `table`, in `seq` order, transitioning them to `syncing` in the same
/// statement. Caller is expected to be inside a
/// transaction so the claim is atomic with whatever else the push pipeline
/// does with these rows.
pub fn claim_batch(
    conn: &Connection,
    table: &str,
    limit: usize,
    backoff_ready: impl Fn(u32) -> bool,
) -> SyncResult<Vec<OutboxRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, table_name, row_key, operation, payload_snapshot, enqueued_at, status, attempts, last_error
         FROM _outbox WHERE table_name = ?1 AND status IN ('pending', 'failed') ORDER BY seq ASC",
    )?;
    let candidates = stmt
        .query_map(params![table], row_from)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut claimed = Vec::with_capacity(limit.min(candidates.len()));
    for row in candidates {
        if claimed.len() >= limit {
            break;
        }
        if row.status == Status::Failed && !backoff_ready(row.attempts) {
            continue;
        }
        conn.execute(
            "UPDATE _outbox SET status = 'syncing' WHERE seq = ?1",
            params![row.seq],
        )?;
        claimed.push(OutboxRow {
            status: Status::Syncing,
            ..row
        });
    }
    Ok(claimed)
}

/// Distinct table names with at least one row still owed to the remote.
pub fn tables_with_pending(conn: &Connection) -> SyncResult<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT table_name FROM _outbox WHERE status IN ('pending', 'failed')")?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// `{pending, syncing, failed}` counts for `queueStats()`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub syncing: u64,
    pub failed: u64,
}

pub fn queue_stats(conn: &Connection) -> SyncResult<QueueStats> {
    let mut stats = QueueStats::default();
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM _outbox GROUP BY status")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?;
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => stats.pending = count,
            "syncing" => stats.syncing = count,
            "failed" => stats.failed = count,
            _ => {}
        }
    }
    Ok(stats)
}

/// Push succeeded: the outbox entry has served its purpose.
pub fn ack(conn: &Connection, seq: i64) -> SyncResult<()> {
    conn.execute("DELETE FROM _outbox WHERE seq = ?1", params![seq])?;
    Ok(())
}

/// Remote rejected the write as stale: mark `synced` and drop it. Not a
/// failure — pull will bring the row the remote considers authoritative.
pub fn mark_stale(conn: &Connection, seq: i64) -> SyncResult<()> {
    conn.execute(
        "UPDATE _outbox SET status = 'synced' WHERE seq = ?1",
        params![seq],
    )?;
    conn.execute("DELETE FROM _outbox WHERE seq = ?1 AND status = 'synced'", params![seq])?;
    Ok(())
}

/// Transport failure: revert to `pending`/`failed`, bump `attempts`, record
/// the error.
pub fn fail(conn: &Connection, seq: i64, max_attempts: u32, error: &str) -> SyncResult<()> {
    let attempts: i64 = conn
        .query_row("SELECT attempts FROM _outbox WHERE seq = ?1", params![seq], |r| r.get(0))
        .optional()?
        .unwrap_or(0);
    let attempts = attempts as u32 + 1;
    let status = if attempts >= max_attempts { "failed" } else { "pending" };
    conn.execute(
        "UPDATE _outbox SET status = ?1, attempts = ?2, last_error = ?3 WHERE seq = ?4",
        params![status, attempts, error, seq],
    )?;
    Ok(())
}

/// Exponential backoff keyed on `attempts`, capped.
pub fn backoff_delay(attempts: u32, initial: Duration, max: Duration) -> Duration {
    let mut backoff = backoff::ExponentialBackoff {
        initial_interval: initial,
        max_interval: max,
        max_elapsed_time: None,
        multiplier: 2.0,
        ..Default::default()
    };
    // `ExponentialBackoff` tracks elapsed-time internally; stepping it
    // `attempts` times gives the same deterministic interval a stateless
    // "current delay for this attempt count" query needs.
    use backoff::backoff::Backoff as _;
    let mut delay = initial;
    for _ in 0..attempts {
        delay = backoff.next_backoff().unwrap_or(max);
    }
    delay.min(max)
}
