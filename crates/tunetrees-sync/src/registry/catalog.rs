//! Concrete TuneTrees table declarations.
//!
//! This module is the one place a table name is written down anywhere in
//! this crate. It stands in for a schema-codegen tool — in a full
//! application this file would be generated from the authoritative remote
//! schema rather than hand-maintained.

use super::{BoolOp, ChangeCategory, ForeignKey, KeyColumns, NameOverrides, PullRule, PushRule, Registry, TableMeta};

const fn user_push(pk: KeyColumns) -> PushRule {
    PushRule {
        conflict_target: pk,
        soft_delete: true,
    }
}

/// Builds the full registry: reference tables first (no FK concerns — they
/// are migrated by release, not user-writable), then user-scoped tables in
/// the order a human reading the data model would reach for them.
pub fn build() -> Registry {
    Registry::new(vec![
        // ---- reference tables: pull-only, no outbox ----
        TableMeta {
            name: "genre",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: None,
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::None,
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::Reference,
            foreign_keys: &[],
        },
        TableMeta {
            name: "tune_type",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: None,
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::None,
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::Reference,
            foreign_keys: &[],
        },
        TableMeta {
            name: "instrument",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: None,
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::None,
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::Reference,
            foreign_keys: &[],
        },
        TableMeta {
            name: "genre_tune_type",
            primary_key: KeyColumns::Composite(&["genre", "tune_type"]),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: None,
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::None,
            push_rule: user_push(KeyColumns::Composite(&["genre", "tune_type"])),
            category: ChangeCategory::Reference,
            foreign_keys: &[
                ForeignKey { parent_table: "genre", column: "genre" },
                ForeignKey { parent_table: "tune_type", column: "tune_type" },
            ],
        },
        // ---- user-scoped syncable tables ----
        TableMeta {
            name: "user_profile",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::EqUserId { col: "id" },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[],
        },
        TableMeta {
            name: "user_genre_selection",
            primary_key: KeyColumns::Composite(&["user_ref", "genre"]),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::EqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Composite(&["user_ref", "genre"])),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
                ForeignKey { parent_table: "genre", column: "genre" },
            ],
        },
        TableMeta {
            name: "preferences",
            primary_key: KeyColumns::Single("user_ref"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &["fsrs_enabled"],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::EqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Single("user_ref")),
            category: ChangeCategory::User,
            foreign_keys: &[ForeignKey { parent_table: "user_profile", column: "user_ref" }],
        },
        TableMeta {
            name: "playlist",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &["is_default"],
            name_overrides: NameOverrides {
                renames: &[("default_genre", "genre_default")],
            },
            pull_rule: PullRule::EqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
                ForeignKey { parent_table: "instrument", column: "instrument_ref" },
            ],
        },
        // Tune is the large catalog table the pre-sync filter exists for.
        // Ownership (private_for) and genre-scoping can't both be expressed
        // as a single AND/OR combinator over simple column matches, so the
        // server exposes a function that already encodes "mine, any genre,
        // OR public and genre in U" via the `rpc` escape hatch.
        TableMeta {
            name: "tune",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::Rpc {
                name: "sync_get_user_tunes",
                params: &["userId", "genreIds"],
            },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "genre", column: "genre" },
                ForeignKey { parent_table: "tune_type", column: "type" },
                ForeignKey { parent_table: "user_profile", column: "private_for" },
            ],
        },
        TableMeta {
            name: "playlist_tune",
            primary_key: KeyColumns::Composite(&["playlist", "tune"]),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::Rpc {
                name: "sync_get_playlist_tune_memberships",
                params: &["userId"],
            },
            push_rule: user_push(KeyColumns::Composite(&["playlist", "tune"])),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "playlist", column: "playlist" },
                ForeignKey { parent_table: "tune", column: "tune" },
            ],
        },
        TableMeta {
            name: "practice_record",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::Rpc {
                name: "sync_get_practice_records",
                params: &["userId"],
            },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "playlist", column: "playlist_ref" },
                ForeignKey { parent_table: "tune", column: "tune_ref" },
            ],
        },
        TableMeta {
            name: "daily_practice_queue",
            primary_key: KeyColumns::Composite(&["user_ref", "playlist", "window_start_utc", "tune"]),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::EqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Composite(&[
                "user_ref",
                "playlist",
                "window_start_utc",
                "tune",
            ])),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "playlist", column: "playlist" },
                ForeignKey { parent_table: "tune", column: "tune" },
            ],
        },
        TableMeta {
            name: "note",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::OrNullEqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "tune", column: "tune_ref" },
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
            ],
        },
        TableMeta {
            name: "reference",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::OrNullEqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "tune", column: "tune_ref" },
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
            ],
        },
        TableMeta {
            name: "tag",
            primary_key: KeyColumns::Single("id"),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &[],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::OrNullEqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Single("id")),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "tune", column: "tune_ref" },
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
            ],
        },
        // Synced rather than local-only, to keep unsubmitted evaluation
        // previews available across devices.
        TableMeta {
            name: "table_transient_data",
            primary_key: KeyColumns::Composite(&["user_ref", "playlist_ref", "tune_ref"]),
            unique_keys: &[],
            timestamp_col: "last_modified_at",
            version_col: "sync_version",
            device_col: Some("device_id"),
            deleted_col: "deleted",
            boolean_cols: &["submitted"],
            name_overrides: NameOverrides::default(),
            pull_rule: PullRule::EqUserId { col: "user_ref" },
            push_rule: user_push(KeyColumns::Composite(&["user_ref", "playlist_ref", "tune_ref"])),
            category: ChangeCategory::User,
            foreign_keys: &[
                ForeignKey { parent_table: "playlist", column: "playlist_ref" },
                ForeignKey { parent_table: "tune", column: "tune_ref" },
                ForeignKey { parent_table: "user_profile", column: "user_ref" },
            ],
        },
    ])
}

/// Example showing the `Compound` combinator is wired up even though none of
/// the catalog tables above happen to need it yet — used by registry unit
/// tests exercising the evaluator.
#[cfg(test)]
pub(crate) fn example_compound_rule() -> PullRule {
    PullRule::Compound {
        op: BoolOp::Or,
        rules: vec![
            PullRule::EqUserId { col: "private_for" },
            PullRule::InCollection {
                col: "genre",
                collection: "selectedGenres",
            },
        ],
    }
}
