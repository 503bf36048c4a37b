//! Pull Pipeline: brings local state forward from a watermark.
//!
//! Requests are issued in FK-safe order (registry-declared `depends_on`),
//! applied inside a single local transaction with the sync-writer flag set,
//! and rows that fail to apply due to a missing FK parent are deferred and
//! retried within the same batch until a fixpoint.

use std::collections::HashMap;

use chrono::Utc;
use tracing::instrument;

use crate::adapter;
use crate::conflict::{resolve_optional, Decision, VersionStamp};
use crate::error::{SyncError, SyncResult};
use crate::registry::{PullRule, Registry, RowKey, TableMeta};
use crate::remote::{PullRequest, PullTableRequest, RemoteWorker, RpcRequest};
use crate::row::Row;
use crate::store::LocalStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct PullSummary {
    pub applied: usize,
    pub skipped_local_wiser: usize,
    pub deferred_dropped: usize,
}

/// A pull request's context: the user id, an optional genre filter, and
/// anything else a declared rule needs from the caller.
#[derive(Debug, Clone, Default)]
pub struct PullContext {
    pub user_id: String,
    pub selected_genre_ids: Option<Vec<String>>,
}

impl PullContext {
    fn params_for(&self, rule: &PullRule) -> HashMap<String, serde_json::Value> {
        let mut params = HashMap::new();
        params.insert("userId".to_string(), serde_json::Value::String(self.user_id.clone()));
        if let Some(genres) = &self.selected_genre_ids {
            if matches!(
                rule,
                PullRule::InCollection { .. } | PullRule::Rpc { .. } | PullRule::Compound { .. }
            ) {
                params.insert(
                    "genreIds".to_string(),
                    serde_json::Value::Array(genres.iter().cloned().map(serde_json::Value::String).collect()),
                );
                params.insert(
                    "selectedGenreIds".to_string(),
                    serde_json::Value::Array(genres.iter().cloned().map(serde_json::Value::String).collect()),
                );
            }
        }
        params
    }
}

/// Pulls the given tables (already filtered to what the caller wants this
/// cycle — full registry for a routine tick, the pre-sync subset for
/// bootstrapping). Tables are *fetched* in FK-safe order (for sane
/// watermark/pagination bookkeeping), but every row is *applied* as one
/// pooled batch — the real remote API answers many tables in a single
/// `/sync/pull` round trip, so a child row can legitimately be sitting next
/// to its not-yet-applied parent; FK-safe fetch order alone doesn't
/// guarantee FK-safe *arrival* order once rows are threaded through paging
/// and RPC calls.
#[instrument(skip(store, remote, ctx))]
pub async fn run(
    store: &LocalStore,
    remote: &dyn RemoteWorker,
    ctx: &PullContext,
    tables: &[&'static str],
    page_size: u32,
) -> SyncResult<PullSummary> {
    let registry = store.registry();
    let ordered = registry.fk_safe_order(tables.iter().copied());

    let mut fetched = Vec::new();
    for table in ordered {
        let meta = registry.require(table)?;
        let rows = fetch_all_pages(remote, store, meta, ctx, page_size).await?;
        fetched.push((meta, rows));
    }

    let mut summary = PullSummary::default();
    apply_pooled(store, fetched, &mut summary)?;
    Ok(summary)
}

async fn fetch_all_pages(
    remote: &dyn RemoteWorker,
    store: &LocalStore,
    meta: &TableMeta,
    ctx: &PullContext,
    page_size: u32,
) -> SyncResult<Vec<Row>> {
    let since = store.get_watermark(meta.name)?;

    if let PullRule::Rpc { name, .. } = &meta.pull_rule {
        let mut params = ctx.params_for(&meta.pull_rule);
        if let Some(since) = &since {
            params.insert("afterTimestamp".to_string(), serde_json::Value::String(since.clone()));
        }
        params.insert("limit".to_string(), serde_json::Value::from(page_size));
        return remote.rpc(RpcRequest { name, params }).await;
    }

    let mut offset = 0;
    let mut all = Vec::new();
    loop {
        let req = PullRequest {
            user_id: ctx.user_id.clone(),
            tables: vec![PullTableRequest {
                name: meta.name,
                since: since.clone(),
                limit: page_size,
                offset,
                rule: meta.pull_rule.clone(),
                params: ctx.params_for(&meta.pull_rule),
            }],
        };
        let resp = remote.pull(req).await?;
        let Some(page) = resp.tables.into_iter().next() else {
            break;
        };
        let got = page.rows.len() as u32;
        all.extend(page.rows);
        match page.next_cursor {
            Some(cursor) if got >= page_size => offset = cursor.offset,
            _ => break,
        }
        if got < page_size {
            break;
        }
    }
    Ok(all)
}

/// Applies every fetched table's rows as one pooled batch inside a single
/// sync-writer scope, deferring rows whose FK parent hasn't landed yet and
/// retrying deferred rows until a fixpoint. `fetched` preserves each
/// table's rows grouped so the per-table watermark can still be advanced
/// once its rows settle.
fn apply_pooled<'a>(
    store: &LocalStore,
    fetched: Vec<(&'a TableMeta, Vec<Row>)>,
    summary: &mut PullSummary,
) -> SyncResult<()> {
    let mut pending: Vec<(&'a TableMeta, Row)> = fetched
        .iter()
        .flat_map(|(meta, rows)| rows.iter().map(move |r| (*meta, adapter::to_local(r, meta))))
        .collect();
    let mut max_seen: HashMap<&'static str, String> = HashMap::new();

    store.with_sync_writer(|| {
        loop {
            let before = pending.len();
            let mut still_deferred = Vec::new();
            for (meta, row) in pending.drain(..) {
                match try_apply_one(store, meta, &row) {
                    Ok(Applied::Yes) => {
                        summary.applied += 1;
                        bump_max(max_seen.entry(meta.name).or_default(), &row, meta);
                    }
                    Ok(Applied::SkippedLocalWiser) => {
                        summary.skipped_local_wiser += 1;
                        bump_max(max_seen.entry(meta.name).or_default(), &row, meta);
                    }
                    Err(SyncError::ForeignKeyUnresolved { .. }) => still_deferred.push((meta, row)),
                    Err(other) => return Err(other),
                }
            }
            pending = still_deferred;
            if pending.is_empty() {
                break;
            }
            if pending.len() == before {
                // Fixpoint reached with rows still unresolved: logged and
                // skipped rather than applied with a dangling FK.
                summary.deferred_dropped += pending.len();
                break;
            }
        }
        Ok(())
    })?;

    for (meta, _) in &fetched {
        if let Some(ts) = max_seen.get(meta.name) {
            store.set_watermark(meta.name, ts)?;
        }
    }
    Ok(())
}

enum Applied {
    Yes,
    SkippedLocalWiser,
}

fn try_apply_one(store: &LocalStore, meta: &TableMeta, row: &Row) -> SyncResult<Applied> {
    if !fk_parents_present(store, meta, row)? {
        return Err(SyncError::ForeignKeyUnresolved {
            table: meta.name,
            key: row_key_best_effort(meta, row),
        });
    }

    let key = row_key_best_effort(meta, row);
    let existing = store.get_row(meta.name, &key)?;
    let remote_stamp = VersionStamp::of(row, meta.version_col, meta.timestamp_col).ok_or_else(|| SyncError::SchemaMismatch {
        table: meta.name,
        detail: "pulled row missing sync_version/last_modified_at".to_string(),
    })?;
    let local_stamp = existing
        .as_ref()
        .and_then(|r| VersionStamp::of(r, meta.version_col, meta.timestamp_col));

    match resolve_optional(local_stamp.as_ref(), &remote_stamp) {
        Decision::KeepLocal => Ok(Applied::SkippedLocalWiser),
        Decision::TakeRemote | Decision::Noop => {
            store.apply_remote_row(meta.name, row)?;
            Ok(Applied::Yes)
        }
    }
}

/// A pulled row's FK parents (registry-declared `foreign_keys`) must already
/// exist locally — except reference tables and self-contained tables with
/// no declared foreign key, which trivially pass.
fn fk_parents_present(store: &LocalStore, meta: &TableMeta, row: &Row) -> SyncResult<bool> {
    let registry: &Registry = store.registry();
    for fk in meta.foreign_keys {
        if registry.get(fk.parent_table).is_none() {
            continue;
        }
        let Some(fk_value) = row.get(fk.column).and_then(serde_json::Value::as_str) else {
            continue; // nullable FK (e.g. `private_for`), nothing to check
        };
        let key = RowKey::single(fk_value);
        if store.get_row(fk.parent_table, &key)?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn row_key_best_effort(meta: &TableMeta, row: &Row) -> RowKey {
    let cols = meta.primary_key.columns();
    if cols.len() == 1 {
        RowKey::Single(row.get(cols[0]).and_then(serde_json::Value::as_str).unwrap_or_default().to_string())
    } else {
        RowKey::Composite(
            cols.iter()
                .map(|c| row.get(*c).and_then(serde_json::Value::as_str).unwrap_or_default().to_string())
                .collect(),
        )
    }
}

fn bump_max(max_seen: &mut String, row: &Row, meta: &TableMeta) {
    if let Some(ts) = row.get(meta.timestamp_col).and_then(serde_json::Value::as_str) {
        if ts > max_seen.as_str() {
            *max_seen = ts.to_string();
        }
    }
}

pub fn now_watermark() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog;
    use crate::remote::InMemoryRemoteWorker;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(user: &str) -> PullContext {
        PullContext {
            user_id: user.to_string(),
            selected_genre_ids: None,
        }
    }

    #[tokio::test]
    async fn pull_applies_newer_remote_row() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let remote = InMemoryRemoteWorker::new();
        remote.seed(
            "user_profile",
            RowKey::single("u1"),
            serde_json::from_value(json!({
                "id": "u1",
                "syncVersion": 2,
                "lastModifiedAt": "2024-01-01T00:00:00.000Z",
            }))
            .unwrap(),
        );

        let summary = run(&store, &remote, &ctx("u1"), &["user_profile"], 100).await.unwrap();
        assert_eq!(summary.applied, 1);
        let got = store.get_row("user_profile", &RowKey::single("u1")).unwrap().unwrap();
        assert_eq!(got.get("sync_version").and_then(serde_json::Value::as_i64), Some(2));
    }

    #[tokio::test]
    async fn pull_skips_when_local_is_wiser() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let row: Row = serde_json::from_value(json!({
            "id": "u1",
            "sync_version": 5,
            "last_modified_at": "2030-01-01T00:00:00.000Z",
        }))
        .unwrap();
        store.write_local_row("user_profile", row, Some("dev-a")).unwrap();

        let remote = InMemoryRemoteWorker::new();
        remote.seed(
            "user_profile",
            RowKey::single("u1"),
            serde_json::from_value(json!({
                "id": "u1",
                "syncVersion": 2,
                "lastModifiedAt": "2020-01-01T00:00:00.000Z",
            }))
            .unwrap(),
        );

        let summary = run(&store, &remote, &ctx("u1"), &["user_profile"], 100).await.unwrap();
        assert_eq!(summary.skipped_local_wiser, 1);
        let got = store.get_row("user_profile", &RowKey::single("u1")).unwrap().unwrap();
        assert_eq!(got.get("sync_version").and_then(serde_json::Value::as_i64), Some(5));
    }

    #[tokio::test]
    async fn pull_applied_rows_do_not_reenter_outbox() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let remote = InMemoryRemoteWorker::new();
        remote.seed(
            "user_profile",
            RowKey::single("u1"),
            serde_json::from_value(json!({
                "id": "u1",
                "syncVersion": 2,
                "lastModifiedAt": "2024-01-01T00:00:00.000Z",
            }))
            .unwrap(),
        );
        run(&store, &remote, &ctx("u1"), &["user_profile"], 100).await.unwrap();

        let stats = store.with_connection(|c| crate::outbox::queue_stats(c)).unwrap();
        assert_eq!(stats.pending, 0);
    }

    /// A pull batch arrives with a `playlist_tune` row *before* its `tune`
    /// parent. `run()`'s FK-safe fetch order would never produce this
    /// ourselves, so this drives `apply_pooled` directly with the rows
    /// deliberately listed child-before-parent, exactly like a combined
    /// `/sync/pull` response whose table order doesn't match the FK graph.
    #[test]
    fn fk_deferral_resolves_within_batch() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let registry = store.registry();

        let playlist_tune_row: Row = serde_json::from_value(json!({
            "playlist": "p1", "tune": "t1",
            "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
        }))
        .unwrap();
        let tune_row: Row = serde_json::from_value(
            json!({ "id": "t1", "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z" }),
        )
        .unwrap();
        let playlist_row: Row = serde_json::from_value(json!({
            "id": "p1", "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z", "userRef": "u1",
        }))
        .unwrap();

        let fetched = vec![
            (registry.require("playlist_tune").unwrap(), vec![playlist_tune_row]),
            (registry.require("tune").unwrap(), vec![tune_row]),
            (registry.require("playlist").unwrap(), vec![playlist_row]),
        ];

        let mut summary = PullSummary::default();
        apply_pooled(&store, fetched, &mut summary).unwrap();

        assert_eq!(summary.deferred_dropped, 0);
        assert_eq!(summary.applied, 3);

        let key = RowKey::Composite(vec!["p1".to_string(), "t1".to_string()]);
        assert!(store.get_row("playlist_tune", &key).unwrap().is_some());
    }

    #[test]
    fn fk_unresolved_at_fixpoint_is_dropped_not_applied() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let registry = store.registry();

        // `tune` parent never arrives in this batch at all.
        let playlist_tune_row: Row = serde_json::from_value(json!({
            "playlist": "p1", "tune": "t-missing",
            "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
        }))
        .unwrap();
        let playlist_row: Row = serde_json::from_value(json!({
            "id": "p1", "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z", "userRef": "u1",
        }))
        .unwrap();

        let fetched = vec![
            (registry.require("playlist_tune").unwrap(), vec![playlist_tune_row]),
            (registry.require("playlist").unwrap(), vec![playlist_row]),
        ];

        let mut summary = PullSummary::default();
        apply_pooled(&store, fetched, &mut summary).unwrap();

        assert_eq!(summary.deferred_dropped, 1);
        let key = RowKey::Composite(vec!["p1".to_string(), "t-missing".to_string()]);
        assert!(store.get_row("playlist_tune", &key).unwrap().is_none());
    }
}
