//! Push Pipeline: drains the outbox to the remote worker.
//!
//! Batches are grouped by table to maximize upsert efficiency, claimed in
//! `seq` order so relative ordering of mutations to the same row key is
//! preserved across a push cycle.

use std::sync::Arc;

use tracing::instrument;

use crate::adapter;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::outbox::{self, Operation, OutboxRow};
use crate::registry::RowKey;
use crate::remote::{PushBatch, PushOutcome, PushRequest, RemoteWorker};
use crate::store::LocalStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct PushSummary {
    pub applied: usize,
    pub rejected_stale: usize,
    pub failed: usize,
}

/// Drains every table with outbox backlog, one push request per table with
/// a pending batch.
#[instrument(skip(store, remote, config))]
pub async fn run(
    store: &LocalStore,
    remote: &dyn RemoteWorker,
    user_id: &str,
    config: &SyncConfig,
) -> SyncResult<PushSummary> {
    let mut summary = PushSummary::default();
    let tables = store.with_connection(|conn| outbox::tables_with_pending(conn))?;

    for table in tables {
        let meta = match store.registry().get(&table) {
            Some(m) => m,
            None => continue, // unknown table in outbox shouldn't happen; skip defensively
        };
        let claimed = store.with_connection(|conn| {
            outbox::claim_batch(conn, &table, config.push_batch_size, |attempts| {
                // claim_batch only sees `pending`/`failed` rows; a `failed`
                // row is only worth retrying once its backoff has elapsed.
                // We don't track per-row last-attempt time here (kept out of
                // the outbox row shape), so a failed row is simply eligible
                // again on the next tick once attempts are
                // below the ceiling — backoff timing is enforced by the
                // orchestrator's tick interval, not re-derived per row.
                attempts < config.max_attempts
            })
        })?;
        if claimed.is_empty() {
            continue;
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        // A batch can carry more than one outbox row for the same row key
        // (e.g. S4's insert -> tombstone -> reinsert of the same composite
        // key), so every seq for that key must be remembered, not just the
        // last one — otherwise the earlier rows are never acked and sit in
        // `syncing` forever.
        let mut by_key: std::collections::HashMap<RowKey, Vec<i64>> = std::collections::HashMap::new();
        for row in &claimed {
            by_key.entry(row.row_key.clone()).or_default().push(row.seq);
            match row.operation {
                Operation::Delete => deletes.push(row.row_key.clone()),
                Operation::Insert | Operation::Update => {
                    let local_row: serde_json::Map<String, serde_json::Value> =
                        serde_json::from_value(row.payload_snapshot.clone()).unwrap_or_default();
                    upserts.push(adapter::to_remote(&local_row, meta));
                }
            }
        }

        let req = PushRequest {
            user_id: user_id.to_string(),
            batches: vec![PushBatch {
                table: meta.name,
                conflict_target: adapter::conflict_keys(meta),
                upserts,
                deletes,
            }],
        };

        match remote.push(req).await {
            Ok(resp) => {
                apply_results(store, &resp.results, &by_key, &mut summary)?;
            }
            Err(err) => {
                // Transport failure: every claimed row in this batch reverts
                // to pending with attempts bumped.
                store.with_connection(|conn| {
                    for row in &claimed {
                        outbox::fail(conn, row.seq, config.max_attempts, &err.to_string())?;
                    }
                    Ok(())
                })?;
                summary.failed += claimed.len();
            }
        }
    }

    Ok(summary)
}

fn apply_results(
    store: &LocalStore,
    results: &[crate::remote::PushResult],
    by_key: &std::collections::HashMap<RowKey, Vec<i64>>,
    summary: &mut PushSummary,
) -> SyncResult<()> {
    // A batch can carry more than one `PushResult` for the same row key (one
    // upsert per claimed outbox row, all sharing a key) — the first result
    // seen for a key settles every outbox row under it, so later results for
    // an already-settled key are skipped rather than re-acking the same seqs.
    let mut remaining = by_key.clone();
    store.with_connection(|conn| {
        for result in results {
            let Some(seqs) = remaining.remove(&result.row_key) else {
                continue;
            };
            for seq in seqs {
                match result.outcome {
                    PushOutcome::Applied => {
                        outbox::ack(conn, seq)?;
                        summary.applied += 1;
                    }
                    PushOutcome::RejectedStale => {
                        // Remote is wiser: drop the outbox entry, pull brings
                        // the authoritative row down next cycle.
                        outbox::mark_stale(conn, seq)?;
                        summary.rejected_stale += 1;
                    }
                    PushOutcome::Error => {
                        // A declared application-level error (e.g. schema
                        // mismatch) isn't transient — don't let it keep
                        // retrying, land straight in `failed` for operator
                        // inspection.
                        outbox::fail(
                            conn,
                            seq,
                            0,
                            result.error.as_deref().unwrap_or("remote rejected write"),
                        )?;
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Exposes `Arc<dyn RemoteWorker>` callers a convenience wrapper so the
/// orchestrator doesn't need to juggle `&dyn` lifetimes across await points.
pub async fn run_arc(
    store: &LocalStore,
    remote: &Arc<dyn RemoteWorker>,
    user_id: &str,
    config: &SyncConfig,
) -> SyncResult<PushSummary> {
    run(store, remote.as_ref(), user_id, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog;
    use crate::remote::InMemoryRemoteWorker;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn push_acks_on_apply_and_clears_outbox() {
        let store = LocalStore::open_in_memory(StdArc::new(catalog::build())).unwrap();
        let row: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(json!({ "id": "u1" })).unwrap();
        store.write_local_row("user_profile", row, Some("dev-a")).unwrap();

        let remote = InMemoryRemoteWorker::new();
        let config = SyncConfig::default();
        let summary = run(&store, &remote, "u1", &config).await.unwrap();
        assert_eq!(summary.applied, 1);

        let stats = store.with_connection(|c| outbox::queue_stats(c)).unwrap();
        assert_eq!(stats.pending, 0);
        assert!(remote.get("user_profile", &RowKey::single("u1")).is_some());
    }

    #[tokio::test]
    async fn stale_rejection_drops_outbox_without_failing() {
        let store = LocalStore::open_in_memory(StdArc::new(catalog::build())).unwrap();
        let remote = InMemoryRemoteWorker::new();
        // Remote already has a newer version than what we're about to push.
        remote.seed(
            "tune",
            RowKey::single("t1"),
            serde_json::from_value(json!({
                "id": "t1",
                "syncVersion": 9,
                "lastModifiedAt": "2030-01-01T00:00:00.000Z",
            }))
            .unwrap(),
        );

        let row: serde_json::Map<String, serde_json::Value> = serde_json::from_value(json!({
            "id": "t1",
            "sync_version": 3,
            "last_modified_at": "2020-01-01T00:00:00.000Z",
        }))
        .unwrap();
        store.write_local_row("tune", row, Some("dev-a")).unwrap();

        let config = SyncConfig::default();
        let summary = run(&store, &remote, "u1", &config).await.unwrap();
        assert_eq!(summary.rejected_stale, 1);
        let stats = store.with_connection(|c| outbox::queue_stats(c)).unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
    }

    /// Editing the same row twice before a push cycle runs leaves two outbox
    /// rows sharing one row key in the claimed batch. Both must be drained —
    /// not just the last one claimed — or the earlier row is stranded in
    /// `syncing` forever.
    #[tokio::test]
    async fn multiple_outbox_rows_for_same_key_are_all_acked() {
        let store = LocalStore::open_in_memory(StdArc::new(catalog::build())).unwrap();
        let row: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(json!({ "id": "u1" })).unwrap();
        store.write_local_row("user_profile", row.clone(), Some("dev-a")).unwrap();
        store.write_local_row("user_profile", row, Some("dev-a")).unwrap();

        let stats_before = store.with_connection(|c| outbox::queue_stats(c)).unwrap();
        assert_eq!(stats_before.pending, 2);

        let remote = InMemoryRemoteWorker::new();
        let config = SyncConfig::default();
        let summary = run(&store, &remote, "u1", &config).await.unwrap();
        assert_eq!(summary.applied, 2);

        let stats_after = store.with_connection(|c| outbox::queue_stats(c)).unwrap();
        assert_eq!(stats_after.pending, 0);
        assert_eq!(stats_after.syncing, 0);
        assert_eq!(stats_after.failed, 0);
    }
}
