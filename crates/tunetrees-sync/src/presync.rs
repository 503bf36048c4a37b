//! Pre-Sync + Filter Builder.
//!
//! Downloads the small metadata tables a cold-start device needs before it
//! can compute the effective genre set `U`, then installs `U` as a request
//! override for the main pull. This is the one place the pull pipeline's
//! table-agnostic genre filter (`inCollection`/`rpc`) gets its actual values
//! from — everything downstream stays declarative.

use std::collections::BTreeSet;

use tracing::instrument;

use crate::error::SyncResult;
use crate::pull::{self, PullContext};
use crate::remote::{RemoteWorker, RpcRequest};
use crate::row::Row;
use crate::store::LocalStore;

/// Small tables pulled in full, in dependency order, before anything else.
const METADATA_TABLES: &[&str] = &["user_profile", "user_genre_selection", "instrument", "genre", "playlist"];

#[derive(Debug, Default, Clone)]
pub struct PreSyncOutcome {
    pub selected_genre_ids: Vec<String>,
    pub metadata_rows_applied: usize,
}

/// Runs the metadata pre-fetch, computes `U`, and returns it for the caller
/// (the orchestrator) to thread into the main pull as a [`PullContext`]
/// override.
#[instrument(skip(store, remote))]
pub async fn run(
    store: &LocalStore,
    remote: &dyn RemoteWorker,
    user_id: &str,
    is_initial_sync: bool,
    page_size: u32,
) -> SyncResult<PreSyncOutcome> {
    let ctx = PullContext {
        user_id: user_id.to_string(),
        selected_genre_ids: None,
    };
    let metadata_summary = pull::run(store, remote, &ctx, METADATA_TABLES, page_size).await?;

    let u = compute_effective_genre_set(store, remote, user_id, is_initial_sync).await?;

    Ok(PreSyncOutcome {
        selected_genre_ids: u.into_iter().collect(),
        metadata_rows_applied: metadata_summary.applied,
    })
}

/// `U = E ∪ P ∪ X`. `E` and `P` always come from the local store (they were
/// just pre-fetched); `X` comes from the local store once the device has
/// synced before, or from a single remote probe on a cold start where local
/// has no memberships yet.
async fn compute_effective_genre_set(
    store: &LocalStore,
    remote: &dyn RemoteWorker,
    user_id: &str,
    is_initial_sync: bool,
) -> SyncResult<BTreeSet<String>> {
    let mut u = BTreeSet::new();

    // E: explicitly selected genres.
    u.extend(local_genre_column(store, "user_genre_selection", "genre")?);

    // P: non-null playlist default genres.
    u.extend(local_genre_column(store, "playlist", "default_genre")?);

    // X: genres referenced by existing playlist-tune memberships.
    if is_initial_sync {
        let rows = remote
            .rpc(RpcRequest {
                name: "sync_get_member_genres",
                params: [("userId".to_string(), serde_json::Value::String(user_id.to_string()))].into(),
            })
            .await?;
        u.extend(rows.iter().filter_map(|r| r.get("genre").and_then(serde_json::Value::as_str)).map(str::to_string));
    } else {
        u.extend(local_member_genres(store)?);
    }

    Ok(u)
}

fn local_genre_column(store: &LocalStore, table: &'static str, column: &str) -> SyncResult<Vec<String>> {
    store.with_connection(|conn| {
        let meta = store.registry().require(table)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT payload_json FROM \"{}\" WHERE \"{}\" = 0",
            meta.name, meta.deleted_col
        ))?;
        let mut out = Vec::new();
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for raw in rows {
            let raw = raw?;
            let row: Row = serde_json::from_str(&raw).unwrap_or_default();
            if let Some(g) = row.get(column).and_then(serde_json::Value::as_str) {
                out.push(g.to_string());
            }
        }
        Ok(out)
    })
}

fn local_member_genres(store: &LocalStore) -> SyncResult<Vec<String>> {
    // playlist_tune carries no genre column itself — the genre lives on the
    // tune each membership references, so this joins through the payload.
    store.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT t.payload_json FROM playlist_tune pt
             JOIN tune t ON t.id = pt.tune
             WHERE pt.deleted = 0",
        )?;
        let mut out = Vec::new();
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for raw in rows {
            let raw = raw?;
            let row: Row = serde_json::from_str(&raw).unwrap_or_default();
            if let Some(g) = row.get("genre").and_then(serde_json::Value::as_str) {
                out.push(g.to_string());
            }
        }
        Ok(out)
    })
}

/// Orphan cleanup: when a user deselects a genre, annotations
/// (`note`/`reference`) tied *exclusively* to tunes whose genre is no longer
/// in `U` and aren't private to the user are purged. Memberships themselves
/// are never touched — they represent stronger user intent than a note.
#[instrument(skip(store))]
pub fn purge_orphaned_annotations(store: &LocalStore, user_id: &str, selected_genre_ids: &[String]) -> SyncResult<usize> {
    store.with_connection(|conn| {
        let mut purged = 0;
        for table in ["note", "reference"] {
            // Only pure-public tunes (`private_for IS NULL`) are candidates —
            // a tune private to this user is never orphaned by a genre
            // deselect.
            let mut stmt = conn.prepare(&format!(
                "SELECT {table}.\"id\" FROM \"{table}\"
                 JOIN tune ON tune.id = json_extract({table}.payload_json, '$.tune_ref')
                 WHERE {table}.deleted = 0
                   AND tune.deleted = 0
                   AND json_extract(tune.payload_json, '$.private_for') IS NULL
                   AND (json_extract({table}.payload_json, '$.user_ref') IS NULL
                        OR json_extract({table}.payload_json, '$.user_ref') = ?1)",
            ))?;
            let ids: Vec<String> = stmt
                .query_map(rusqlite::params![user_id], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for id in ids {
                let genre: Option<String> = conn
                    .query_row(
                        &format!(
                            "SELECT json_extract(tune.payload_json, '$.genre') FROM \"{table}\"
                             JOIN tune ON tune.id = json_extract({table}.payload_json, '$.tune_ref')
                             WHERE {table}.\"id\" = ?1"
                        ),
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .unwrap_or(None);
                let orphaned = genre.map(|g| !selected_genre_ids.contains(&g)).unwrap_or(false);
                if orphaned {
                    conn.execute(&format!("DELETE FROM \"{table}\" WHERE \"id\" = ?1"), rusqlite::params![id])?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{catalog, RowKey};
    use crate::remote::InMemoryRemoteWorker;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn effective_genre_set_unions_selection_default_and_membership() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();

        let selection: Row = serde_json::from_value(json!({ "user_ref": "u1", "genre": "irish" })).unwrap();
        store.write_local_row("user_genre_selection", selection, None).unwrap();

        let playlist: Row = serde_json::from_value(json!({ "id": "p1", "user_ref": "u1", "default_genre": "scottish" })).unwrap();
        store.write_local_row("playlist", playlist, None).unwrap();

        let tune: Row = serde_json::from_value(json!({ "id": "t_folk", "genre": "folk" })).unwrap();
        store.write_local_row("tune", tune, None).unwrap();
        let membership: Row = serde_json::from_value(json!({ "playlist": "p1", "tune": "t_folk" })).unwrap();
        store.write_local_row("playlist_tune", membership, None).unwrap();

        let remote = InMemoryRemoteWorker::new();
        let u = compute_effective_genre_set(&store, &remote, "u1", false).await.unwrap();
        assert_eq!(u, BTreeSet::from(["irish".to_string(), "scottish".to_string(), "folk".to_string()]));
    }

    #[tokio::test]
    async fn cold_start_probes_remote_for_membership_genres() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let remote = InMemoryRemoteWorker::new();
        remote.set_rpc("sync_get_member_genres", |_params| {
            vec![serde_json::from_value(json!({ "genre": "folk" })).unwrap()]
        });

        let u = compute_effective_genre_set(&store, &remote, "u1", true).await.unwrap();
        assert!(u.contains("folk"));
    }

    #[tokio::test]
    async fn purge_removes_annotation_on_orphaned_public_tune_only() {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let tune: Row = serde_json::from_value(json!({ "id": "t1", "genre": "klezmer" })).unwrap();
        store.write_local_row("tune", tune, None).unwrap();
        let note: Row = serde_json::from_value(json!({ "id": "n1", "tune_ref": "t1", "user_ref": "u1" })).unwrap();
        store.write_local_row("note", note, None).unwrap();

        let purged = purge_orphaned_annotations(&store, "u1", &["irish".to_string()]).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_row("note", &RowKey::single("n1")).unwrap().is_none());
    }
}
