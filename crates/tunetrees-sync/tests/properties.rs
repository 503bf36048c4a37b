//! Property-based tests over randomized mutation schedules.
//!
//! A `proptest!` body drives a random schedule against a real (if
//! temporary/in-memory) store and remote rather than a stub, then checks an
//! invariant that must hold no matter what the schedule was.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use tunetrees_sync::config::SyncConfig;
use tunetrees_sync::conflict::{resolve, Decision, VersionStamp};
use tunetrees_sync::outbox;
use tunetrees_sync::pull::{self, PullContext};
use tunetrees_sync::push;
use tunetrees_sync::registry::{catalog, RowKey};
use tunetrees_sync::remote::InMemoryRemoteWorker;
use tunetrees_sync::row::Row;
use tunetrees_sync::store::LocalStore;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn row(v: serde_json::Value) -> Row {
    serde_json::from_value(v).unwrap()
}

/// A plain (version, timestamp) pair strategy mirroring what a row's
/// `VersionStamp` is built from.
fn stamp_strategy() -> impl Strategy<Value = (i64, i64)> {
    (1i64..1000, 0i64..1_000_000)
}

fn stamp_from(v: i64, frac: i64) -> VersionStamp {
    VersionStamp {
        sync_version: v,
        last_modified_at: format!("2024-01-01T00:00:00.{:06}Z", frac.rem_euclid(1_000_000)),
    }
}

proptest! {
    /// LWW determinism: the resolver's verdict for a pair of
    /// stamps must not depend on which one is passed as "local" vs "remote";
    /// swapping the arguments must swap the verdict symmetrically.
    #[test]
    fn lww_resolution_is_symmetric(
        (va, ta) in stamp_strategy(),
        (vb, tb) in stamp_strategy(),
    ) {
        let a = stamp_from(va, ta);
        let b = stamp_from(vb, tb);
        let ab = resolve(&a, &b);
        let ba = resolve(&b, &a);
        match ab {
            Decision::TakeRemote => prop_assert_eq!(ba, Decision::KeepLocal),
            Decision::KeepLocal => prop_assert_eq!(ba, Decision::TakeRemote),
            Decision::Noop => prop_assert_eq!(ba, Decision::Noop),
        }
    }

    /// Monotonicity: applying a strictly increasing sequence of
    /// local writes to the same row never lets `sync_version` decrease; the
    /// engine bumps it by exactly one on every write that doesn't set it
    /// explicitly.
    #[test]
    fn local_writes_never_decrease_sync_version(num_writes in 1usize..30) {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        let mut last_version = 0i64;
        for i in 0..num_writes {
            store
                .write_local_row("tune", row(json!({ "id": "t1", "title": format!("v{i}") })), Some("dev-a"))
                .unwrap();
            let got = store.get_row("tune", &RowKey::single("t1")).unwrap().unwrap();
            let version = got.get("sync_version").and_then(serde_json::Value::as_i64).unwrap();
            prop_assert!(version > last_version, "version went from {} to {}", last_version, version);
            last_version = version;
        }
        prop_assert_eq!(last_version, num_writes as i64);
    }

    /// Durability of writes: every successful `write_local_row`
    /// on a syncable table leaves behind exactly one more outbox row than
    /// existed before it, for any schedule of distinct row ids.
    #[test]
    fn every_local_write_enqueues_an_outbox_row(ids in prop::collection::vec("[a-z]{1,8}", 1..15)) {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let before: i64 = store
                .with_connection(|c| Ok(c.query_row("SELECT COUNT(*) FROM _outbox", [], |r| r.get(0))?))
                .unwrap();
            store
                .write_local_row("tune", row(json!({ "id": format!("{id}-{i}") })), Some("dev-a"))
                .unwrap();
            let after: i64 = store
                .with_connection(|c| Ok(c.query_row("SELECT COUNT(*) FROM _outbox", [], |r| r.get(0))?))
                .unwrap();
            prop_assert_eq!(after, before + 1);
        }
    }

    /// Idempotent push: replaying the exact same push batch
    /// (same rows, same versions) against the remote a second time must
    /// leave it in the same final state — the remote's own LWW rule makes a
    /// duplicate delivery a no-op rather than a double-apply.
    #[test]
    fn replaying_a_push_batch_is_idempotent(
        version in 1i64..50,
        title in "[A-Za-z ]{1,12}",
    ) {
        let rt = runtime();
        rt.block_on(async {
            let remote = InMemoryRemoteWorker::new();
            let config = SyncConfig::default();

            let make_store = || LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();

            let store_a = make_store();
            store_a
                .write_local_row(
                    "tune",
                    row(json!({ "id": "t1", "title": title.clone(), "sync_version": version, "last_modified_at": "2024-06-01T00:00:00.000Z" })),
                    Some("dev-a"),
                )
                .unwrap();
            push::run(&store_a, &remote, "u1", &config).await.unwrap();
            let after_first = remote.get("tune", &RowKey::single("t1")).unwrap();

            // Second, independent store pushes the identical row again —
            // models a retried/duplicated delivery of the same mutation.
            let store_b = make_store();
            store_b
                .write_local_row(
                    "tune",
                    row(json!({ "id": "t1", "title": title, "sync_version": version, "last_modified_at": "2024-06-01T00:00:00.000Z" })),
                    Some("dev-a"),
                )
                .unwrap();
            push::run(&store_b, &remote, "u1", &config).await.unwrap();
            let after_second = remote.get("tune", &RowKey::single("t1")).unwrap();

            prop_assert_eq!(after_first, after_second);
            Ok(())
        })?;
    }

    /// Composite-key stability: writing a tombstone and then a
    /// fresh insert to the same composite-key row, for any interleaving of
    /// version bumps, never changes the key columns themselves — only
    /// `deleted`/`sync_version` move.
    #[test]
    fn composite_key_columns_never_mutate_across_writes(n_cycles in 1usize..8) {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        store.write_local_row("playlist", row(json!({ "id": "p1", "user_ref": "u1" })), Some("dev-a")).unwrap();
        store.write_local_row("tune", row(json!({ "id": "t1" })), Some("dev-a")).unwrap();

        for _ in 0..n_cycles {
            store.write_local_row("playlist_tune", row(json!({ "playlist": "p1", "tune": "t1", "deleted": 1 })), Some("dev-a")).unwrap();
            store.write_local_row("playlist_tune", row(json!({ "playlist": "p1", "tune": "t1", "deleted": 0 })), Some("dev-a")).unwrap();

            let key = RowKey::Composite(vec!["p1".to_string(), "t1".to_string()]);
            let got = store.get_row("playlist_tune", &key).unwrap().unwrap();
            prop_assert_eq!(got.get("playlist").and_then(serde_json::Value::as_str), Some("p1"));
            prop_assert_eq!(got.get("tune").and_then(serde_json::Value::as_str), Some("t1"));
        }
    }

    /// No sync feedback loop: applying any number of
    /// remote-originated rows through the sync-writer path produces zero new
    /// outbox entries, regardless of how many rows or which table.
    #[test]
    fn applying_remote_rows_never_grows_the_outbox(n_rows in 1usize..20) {
        let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
        for i in 0..n_rows {
            let r = row(json!({
                "id": format!("t{i}"),
                "sync_version": 1,
                "last_modified_at": "2024-01-01T00:00:00.000Z",
            }));
            store.with_sync_writer(|| store.apply_remote_row("tune", &r)).unwrap();
        }
        let stats = store.with_connection(outbox::queue_stats).unwrap();
        prop_assert_eq!(stats.pending, 0);
        prop_assert_eq!(stats.syncing, 0);
        prop_assert_eq!(stats.failed, 0);
    }

    /// FK safety on pull: for any combination of whether a `playlist_tune`
    /// membership's `playlist`/`tune` parents are present on the remote,
    /// `pull::run` never leaves a locally-applied membership whose parent is
    /// missing — either both parents land and the membership applies, or a
    /// missing parent defers the membership to fixpoint and it is dropped,
    /// never applied with a dangling reference.
    #[test]
    fn fk_safety_no_applied_row_references_missing_parent(
        playlist_present in any::<bool>(),
        tune_present in any::<bool>(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = LocalStore::open_in_memory(Arc::new(catalog::build())).unwrap();
            let remote = InMemoryRemoteWorker::new();

            remote.seed(
                "user_profile",
                RowKey::single("u1"),
                row(json!({
                    "id": "u1", "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
                })),
            );

            let membership_row = row(json!({
                "playlist": "p1", "tune": "t1",
                "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
            }));
            remote.set_rpc("sync_get_playlist_tune_memberships", move |_| vec![membership_row.clone()]);

            if playlist_present {
                remote.seed(
                    "playlist",
                    RowKey::single("p1"),
                    row(json!({
                        "id": "p1", "userRef": "u1",
                        "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
                    })),
                );
            }
            if tune_present {
                let tune_row = row(json!({
                    "id": "t1", "syncVersion": 1, "lastModifiedAt": "2024-01-01T00:00:00.000Z",
                }));
                remote.set_rpc("sync_get_user_tunes", move |_| vec![tune_row.clone()]);
            }

            let ctx = PullContext { user_id: "u1".to_string(), selected_genre_ids: None };
            pull::run(&store, &remote, &ctx, &["playlist_tune", "playlist", "tune", "user_profile"], 100)
                .await
                .unwrap();

            let membership_key = RowKey::Composite(vec!["p1".to_string(), "t1".to_string()]);
            let applied = store.get_row("playlist_tune", &membership_key).unwrap().is_some();
            prop_assert_eq!(applied, playlist_present && tune_present);
            if applied {
                prop_assert!(store.get_row("playlist", &RowKey::single("p1")).unwrap().is_some());
                prop_assert!(store.get_row("tune", &RowKey::single("t1")).unwrap().is_some());
            }
            Ok(())
        })?;
    }
}
