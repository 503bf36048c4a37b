//! Local Store + Trigger Installer.
//!
//! Bootstraps the embedded SQLite schema and installs the triggers that make
//! every local `INSERT`/`UPDATE`/`DELETE` on a syncable table durably enqueue
//! an outbox row in the same transaction.
//!
//! This engine doesn't know a table's business columns — those come from
//! the schema-codegen tool the registry stands in for. What it owns is the
//! sync envelope every syncable row carries: the
//! key columns, `sync_version`, `last_modified_at`, `device_id`, `deleted`,
//! plus a `payload_json` column holding the rest of the row verbatim. That
//! keeps the engine's generated DDL entirely table-agnostic, the same way
//! `Row` being a loose JSON map keeps every pipeline stage agnostic.
//!
//! Concurrency model: one `rusqlite::Connection`, one writer, guarded by a
//! `parking_lot::Mutex`. The "sync-writer" flag the pull pipeline uses to
//! suppress outbox triggers is a `TEMP` table — SQLite temp objects are
//! connection-scoped, so this only works with a single connection.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::adapter::now_rfc3339;
use crate::error::{SyncError, SyncResult};
use crate::registry::{ChangeCategory, KeyColumns, Registry, RowKey, TableMeta};
use crate::row::Row;

/// Bumped whenever the generated schema shape changes; mismatches trigger
/// the reset path.
pub const SCHEMA_VERSION: i64 = 1;

pub struct LocalStore {
    conn: Mutex<Connection>,
    registry: std::sync::Arc<Registry>,
}

impl LocalStore {
    pub fn open(path: &Path, registry: std::sync::Arc<Registry>) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, registry)
    }

    pub fn open_in_memory(registry: std::sync::Arc<Registry>) -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, registry)
    }

    fn from_connection(conn: Connection, registry: std::sync::Arc<Registry>) -> SyncResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        let store = Self {
            conn: Mutex::new(conn),
            registry,
        };
        store.bootstrap()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Creates the outbox, watermark, and schema-version tables, then a data
    /// table + trigger set per table in the registry. Checks the schema
    /// version marker and runs the reset path on mismatch.
    fn bootstrap(&self) -> SyncResult<()> {
        let conn = self.conn();
        crate::outbox::create_table(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _watermark (
                table_name TEXT PRIMARY KEY,
                last_modified_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS _schema_version (version INTEGER NOT NULL);
            CREATE TEMP TABLE IF NOT EXISTS sync_writer_flag (enabled INTEGER NOT NULL);",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT version FROM _schema_version LIMIT 1", [], |r| r.get(0))
            .optional()?;
        match existing {
            None => {
                conn.execute("INSERT INTO _schema_version(version) VALUES (?1)", params![SCHEMA_VERSION])?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                // Local store corruption: drop every data table, keep the
                // outbox (it's readable — append-only, no DDL changes), and
                // let the orchestrator's next pre-sync repopulate watermarks
                // and data from scratch.
                for table in self.registry.all() {
                    conn.execute(&format!("DROP TABLE IF EXISTS \"{}\"", table.name), [])?;
                }
                conn.execute("DELETE FROM _watermark", [])?;
                conn.execute("UPDATE _schema_version SET version = ?1", params![SCHEMA_VERSION])?;
            }
            Some(_) => {}
        }

        for table in self.registry.all() {
            self.create_table_and_triggers(&conn, table)?;
        }
        Ok(())
    }

    fn create_table_and_triggers(&self, conn: &Connection, meta: &TableMeta) -> SyncResult<()> {
        let key_cols = meta.primary_key.columns();
        let mut cols = Vec::new();
        for c in &key_cols {
            cols.push(format!("\"{c}\" TEXT NOT NULL"));
        }
        cols.push(format!("\"{}\" INTEGER NOT NULL DEFAULT 1", meta.version_col));
        cols.push(format!("\"{}\" TEXT NOT NULL", meta.timestamp_col));
        if let Some(device_col) = meta.device_col {
            cols.push(format!("\"{device_col}\" TEXT"));
        }
        cols.push(format!("\"{}\" INTEGER NOT NULL DEFAULT 0", meta.deleted_col));
        cols.push("payload_json TEXT NOT NULL DEFAULT '{}'".to_string());
        let pk = key_cols.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({}, PRIMARY KEY ({}))",
            meta.name,
            cols.join(", "),
            pk
        );
        conn.execute(&ddl, [])?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS \"{}_last_modified_idx\" ON \"{}\"(\"{}\")",
                meta.name, meta.name, meta.timestamp_col
            ),
            [],
        )?;

        if meta.is_syncable_via_outbox() {
            self.install_outbox_triggers(conn, meta, &key_cols)?;
        }
        Ok(())
    }

    /// Installs `AFTER INSERT/UPDATE/DELETE` triggers that write the outbox
    /// row, skipping entirely while the sync-writer flag is set — pull-applied
    /// rows must not themselves enqueue outbox entries. Version bumping is
    /// deliberately *not* done here — see [`LocalStore::write_local_row`] and
    /// `DESIGN.md` for why.
    fn install_outbox_triggers(&self, conn: &Connection, meta: &TableMeta, key_cols: &[&'static str]) -> SyncResult<()> {
        let key_json_expr = row_key_json_expr(key_cols, "NEW");
        let guard = "NOT EXISTS (SELECT 1 FROM temp.sync_writer_flag WHERE enabled = 1)";

        conn.execute(
            &format!(
                "CREATE TRIGGER IF NOT EXISTS \"trg_{name}_outbox_ai\" AFTER INSERT ON \"{name}\"
                 WHEN {guard}
                 BEGIN
                    INSERT INTO _outbox (table_name, row_key, operation, payload_snapshot, enqueued_at)
                    VALUES ('{name}', {key_json}, 'insert', NEW.payload_json, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
                 END;",
                name = meta.name,
                guard = guard,
                key_json = key_json_expr,
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE TRIGGER IF NOT EXISTS \"trg_{name}_outbox_au\" AFTER UPDATE ON \"{name}\"
                 WHEN {guard}
                 BEGIN
                    INSERT INTO _outbox (table_name, row_key, operation, payload_snapshot, enqueued_at)
                    VALUES ('{name}', {key_json}, 'update', NEW.payload_json, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
                 END;",
                name = meta.name,
                guard = guard,
                key_json = key_json_expr,
            ),
            [],
        )?;

        // Hard deletes are rare — normal removal is the tombstone UPDATE
        // above.
        let old_key_json_expr = row_key_json_expr(key_cols, "OLD");
        conn.execute(
            &format!(
                "CREATE TRIGGER IF NOT EXISTS \"trg_{name}_outbox_ad\" AFTER DELETE ON \"{name}\"
                 WHEN {guard}
                 BEGIN
                    INSERT INTO _outbox (table_name, row_key, operation, payload_snapshot, enqueued_at)
                    VALUES ('{name}', {key_json}, 'delete', {key_json}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
                 END;",
                name = meta.name,
                guard = guard,
                key_json = old_key_json_expr,
            ),
            [],
        )?;
        Ok(())
    }

    /// Sets or clears the session-scoped sync-writer flag. The pull pipeline
    /// wraps every batch apply in this so its writes don't loop back into
    /// the outbox.
    pub fn set_sync_writer(&self, enabled: bool) -> SyncResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM sync_writer_flag", [])?;
        conn.execute("INSERT INTO sync_writer_flag(enabled) VALUES (?1)", params![enabled as i64])?;
        Ok(())
    }

    /// A local, UI-originated write: created client-side and written
    /// through the local store, captured by triggers. Bumps
    /// `sync_version`/`last_modified_at`/`device_id` atomically unless the
    /// caller already set them explicitly — setting them explicitly is
    /// permitted, but this is the only place that ever bumps them, so it
    /// must not double-bump.
    pub fn write_local_row(&self, table: &'static str, mut row: Row, device_id: Option<&str>) -> SyncResult<()> {
        let meta = self.registry.require(table)?;
        let conn = self.conn();
        let key = row_key_of(&row, meta)?;
        let existing_version = self.current_version(&conn, meta, &key)?;

        let caller_set_version = row.contains_key(meta.version_col);
        if !caller_set_version {
            let next = existing_version.map(|v| v + 1).unwrap_or(1);
            row.insert(meta.version_col.to_string(), Value::from(next));
        }
        if !row.contains_key(meta.timestamp_col) {
            row.insert(meta.timestamp_col.to_string(), Value::String(now_rfc3339()));
        }
        if let (Some(device_col), Some(device_id)) = (meta.device_col, device_id) {
            row.entry(device_col.to_string()).or_insert_with(|| Value::String(device_id.to_string()));
        }
        if !row.contains_key(meta.deleted_col) {
            row.insert(meta.deleted_col.to_string(), Value::from(0));
        }

        self.upsert_raw(&conn, meta, &key, &row)
    }

    /// A remote-originated write applied by the pull pipeline. Caller MUST
    /// have set the sync-writer flag first. Never bumps anything — the
    /// incoming row's `sync_version`/`last_modified_at` are authoritative.
    pub fn apply_remote_row(&self, table: &'static str, row: &Row) -> SyncResult<()> {
        let meta = self.registry.require(table)?;
        let conn = self.conn();
        let key = row_key_of(row, meta)?;
        self.upsert_raw(&conn, meta, &key, row)
    }

    fn upsert_raw(&self, conn: &Connection, meta: &TableMeta, key: &RowKey, row: &Row) -> SyncResult<()> {
        let key_cols = meta.primary_key.columns();
        let key_values = key.as_parts();

        let version: i64 = row.get(meta.version_col).and_then(Value::as_i64).unwrap_or(1);
        let timestamp: String = row.get(meta.timestamp_col).and_then(Value::as_str).unwrap_or_default().to_string();
        let deleted: i64 = row.get(meta.deleted_col).and_then(Value::as_i64).unwrap_or(0);
        let payload = serde_json::to_string(row)?;

        let exists: bool = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM \"{}\" WHERE {}",
                    meta.name,
                    where_clause(&key_cols)
                ),
                rusqlite::params_from_iter(key_values.iter()),
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if exists {
            let mut assignments = format!("\"{}\" = ?", meta.version_col);
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(version)];
            assignments.push_str(&format!(", \"{}\" = ?", meta.timestamp_col));
            bind.push(Box::new(timestamp.clone()));
            assignments.push_str(&format!(", \"{}\" = ?", meta.deleted_col));
            bind.push(Box::new(deleted));
            assignments.push_str(", payload_json = ?");
            bind.push(Box::new(payload.clone()));
            if let Some(d) = meta.device_col {
                if let Some(v) = row.get(d).and_then(Value::as_str) {
                    assignments.push_str(&format!(", \"{d}\" = ?"));
                    bind.push(Box::new(v.to_string()));
                }
            }
            let where_sql = where_clause(&key_cols);
            for v in &key_values {
                bind.push(Box::new(v.to_string()));
            }
            let sql = format!("UPDATE \"{}\" SET {} WHERE {}", meta.name, assignments, where_sql);
            conn.execute(&sql, rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref())))?;
        } else {
            let mut col_names: Vec<String> = key_cols.iter().map(|c| format!("\"{c}\"")).collect();
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = key_values.iter().map(|v| Box::new(v.to_string()) as Box<dyn rusqlite::ToSql>).collect();
            col_names.push(format!("\"{}\"", meta.version_col));
            bind.push(Box::new(version));
            col_names.push(format!("\"{}\"", meta.timestamp_col));
            bind.push(Box::new(timestamp));
            col_names.push(format!("\"{}\"", meta.deleted_col));
            bind.push(Box::new(deleted));
            col_names.push("payload_json".to_string());
            bind.push(Box::new(payload));
            if let Some(d) = meta.device_col {
                if let Some(v) = row.get(d).and_then(Value::as_str) {
                    col_names.push(format!("\"{d}\""));
                    bind.push(Box::new(v.to_string()));
                }
            }
            let placeholders = vec!["?"; col_names.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                meta.name,
                col_names.join(", "),
                placeholders
            );
            conn.execute(&sql, rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref())))?;
        }
        Ok(())
    }

    fn current_version(&self, conn: &Connection, meta: &TableMeta, key: &RowKey) -> SyncResult<Option<i64>> {
        let key_cols = meta.primary_key.columns();
        let key_values = key.as_parts();
        conn.query_row(
            &format!("SELECT \"{}\" FROM \"{}\" WHERE {}", meta.version_col, meta.name, where_clause(&key_cols)),
            rusqlite::params_from_iter(key_values.iter()),
            |r| r.get(0),
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn get_row(&self, table: &'static str, key: &RowKey) -> SyncResult<Option<Row>> {
        let meta = self.registry.require(table)?;
        let conn = self.conn();
        let key_cols = meta.primary_key.columns();
        let key_values = key.as_parts();
        conn.query_row(
            &format!("SELECT payload_json FROM \"{}\" WHERE {}", meta.name, where_clause(&key_cols)),
            rusqlite::params_from_iter(key_values.iter()),
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .map(|s| serde_json::from_str(&s).map_err(SyncError::from))
        .transpose()
    }

    pub fn get_watermark(&self, table: &str) -> SyncResult<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT last_modified_at FROM _watermark WHERE table_name = ?1",
            params![table],
            |r| r.get(0),
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn set_watermark(&self, table: &str, ts: &str) -> SyncResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO _watermark(table_name, last_modified_at) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET last_modified_at = excluded.last_modified_at
             WHERE excluded.last_modified_at > _watermark.last_modified_at",
            params![table, ts],
        )?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_arc(&self) -> std::sync::Arc<Registry> {
        self.registry.clone()
    }

    /// Deletes every row from every table plus the outbox and watermarks,
    /// keeping the schema — run on logout.
    pub fn clear_all_data(&self) -> SyncResult<()> {
        let conn = self.conn();
        for table in self.registry.all() {
            conn.execute(&format!("DELETE FROM \"{}\"", table.name), [])?;
        }
        conn.execute("DELETE FROM _outbox", [])?;
        conn.execute("DELETE FROM _watermark", [])?;
        Ok(())
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> SyncResult<T>) -> SyncResult<T> {
        let conn = self.conn();
        f(&conn)
    }

    /// Runs `f` with the sync-writer flag set, clearing it afterward even if
    /// `f` errors.
    pub fn with_sync_writer<T>(&self, f: impl FnOnce() -> SyncResult<T>) -> SyncResult<T> {
        self.set_sync_writer(true)?;
        let result = f();
        self.set_sync_writer(false)?;
        result
    }
}

fn row_key_of(row: &Row, meta: &TableMeta) -> SyncResult<RowKey> {
    let cols = meta.primary_key.columns();
    let mut parts = Vec::with_capacity(cols.len());
    for c in &cols {
        let v = row
            .get(*c)
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::SchemaMismatch {
                table: meta.name,
                detail: format!("missing key column {c}"),
            })?;
        parts.push(v.to_string());
    }
    Ok(match meta.primary_key {
        KeyColumns::Single(_) => RowKey::Single(parts.into_iter().next().unwrap()),
        KeyColumns::Composite(_) => RowKey::Composite(parts),
    })
}

fn where_clause(cols: &[&'static str]) -> String {
    cols.iter().map(|c| format!("\"{c}\" = ?")).collect::<Vec<_>>().join(" AND ")
}

fn row_key_json_expr(key_cols: &[&'static str], prefix: &str) -> String {
    if key_cols.len() == 1 {
        format!("{}.\"{}\"", prefix, key_cols[0])
    } else {
        let parts = key_cols.iter().map(|c| format!("{prefix}.\"{c}\"")).collect::<Vec<_>>().join(", ");
        format!("json_array({parts})")
    }
}
