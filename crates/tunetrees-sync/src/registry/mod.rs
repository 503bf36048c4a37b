//! Metadata Registry.
//!
//! The registry is the single source of truth for how each table is synced.
//! Nothing downstream (adapter, outbox, push, pull, conflict) matches on a
//! table name — they all walk `TableMeta` and the declared rules. The actual
//! table list lives in [`catalog`], which stands in for a schema-codegen
//! tool generating this declaration from the database's own schema.

pub mod catalog;

use std::collections::HashMap;

/// Column(s) that identify a row. Composite tables (e.g. `playlist_tune`)
/// never mutate these columns in place — a delete-then-reinsert writes a
/// tombstone and a fresh row rather than touching the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyColumns {
    Single(&'static str),
    Composite(&'static [&'static str]),
}

impl KeyColumns {
    pub fn columns(&self) -> Vec<&'static str> {
        match self {
            Self::Single(c) => vec![c],
            Self::Composite(cs) => cs.to_vec(),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Composite(cs) => cs.len(),
        }
    }
}

/// Runtime key *values* for a specific row — used in outbox rows, error
/// messages, and deferred-FK bookkeeping. Mirrors [`KeyColumns`]'s shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Single(String),
    Composite(Vec<String>),
}

impl RowKey {
    pub fn single(value: impl Into<String>) -> Self {
        Self::Single(value.into())
    }

    pub fn as_parts(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Composite(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.as_parts().join(","))
    }
}

/// Pull rule: how the pull pipeline (or an RPC) filters a table's rows for
/// the current user. Serializable so the declared rule itself travels on the
/// wire as part of a pull table request (spec §6.2).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PullRule {
    /// `col = userId` — strictly private rows.
    EqUserId { col: &'static str },
    /// `col IS NULL OR col = userId` — public-or-mine.
    OrNullEqUserId { col: &'static str },
    /// `col IN U[collection]`, e.g. `genre IN selectedGenres`.
    InCollection {
        col: &'static str,
        collection: &'static str,
    },
    /// Boolean combination of sub-rules. `AND`/`OR` skip `null` sub-results
    /// (a sub-rule that cannot be evaluated imposes no constraint).
    Compound {
        op: BoolOp,
        rules: Vec<PullRule>,
    },
    /// Server-side function that already encodes the filter.
    Rpc {
        name: &'static str,
        params: &'static [&'static str],
    },
    /// Reference tables and a handful of always-visible tables (e.g. the
    /// caller's own `user_profile` row) have no row-level filter at all.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOp {
    And,
    Or,
}

/// Push rule: conflict target for upserts, and whether deletes are physical.
#[derive(Debug, Clone)]
pub struct PushRule {
    pub conflict_target: KeyColumns,
    /// Always `true` — hard deletes are never propagated, only soft
    /// tombstones (`deleted_col` set).
    pub soft_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCategory {
    /// Goes through the outbox; triggers are installed.
    User,
    /// Pull-only, no outbox, no triggers.
    Reference,
}

/// Per-table naming convention override, e.g. remote `genre_default` vs
/// local `default_genre`. Most tables need no override — naming already
/// agrees after the standard snake_case <-> camelCase conversion.
#[derive(Debug, Clone, Default)]
pub struct NameOverrides {
    /// (local_name, remote_name) pairs that don't follow the standard
    /// casing conversion.
    pub renames: &'static [(&'static str, &'static str)],
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: &'static str,
    pub primary_key: KeyColumns,
    /// Additional unique keys usable as upsert conflict targets, beyond the PK.
    pub unique_keys: &'static [KeyColumns],
    pub timestamp_col: &'static str,
    pub version_col: &'static str,
    pub device_col: Option<&'static str>,
    pub deleted_col: &'static str,
    pub boolean_cols: &'static [&'static str],
    pub name_overrides: NameOverrides,
    pub pull_rule: PullRule,
    pub push_rule: PushRule,
    pub category: ChangeCategory,
    /// Foreign keys this table carries into other tables: the parent table
    /// name plus the *local* column holding the reference. Declared, not
    /// inferred — column naming doesn't follow a fixed convention (e.g.
    /// `playlist.user_ref` points at `user_profile`, not a column literally
    /// named `user_profile`), so guessing from the parent's table name would
    /// silently skip enforcement for exactly the relations that don't happen
    /// to match. Drives both FK-safe pull ordering and per-row FK-parent
    /// presence checks.
    pub foreign_keys: &'static [ForeignKey],
}

/// One declared foreign key: `column` on this table holds a (nullable)
/// reference to `parent_table`'s primary key.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub parent_table: &'static str,
    pub column: &'static str,
}

impl TableMeta {
    /// Parent table names this table depends on, for FK-safe ordering.
    pub fn depends_on(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.foreign_keys.iter().map(|fk| fk.parent_table)
    }

    pub fn is_syncable_via_outbox(&self) -> bool {
        self.category == ChangeCategory::User
    }
}

/// Evaluates a declared [`PullRule`] against a single row. `None` means "no
/// constraint could be evaluated" — for a bare rule that's only true of
/// [`PullRule::Rpc`] (the filter is server-side, not something this function
/// can compute), and for [`PullRule::InCollection`] when the named collection
/// isn't present in `collections` at all. [`BoolOp`] combination skips those
/// `None` sub-results per spec — a sub-rule that can't be evaluated imposes
/// no constraint rather than vetoing the row.
///
/// Production filtering happens server-side; this function exists so the
/// in-memory remote test double enforces the same contract real remotes are
/// specified to apply, instead of silently no-op'ing rule-based privacy.
pub fn evaluate(
    rule: &PullRule,
    row: &crate::row::Row,
    user_id: &str,
    collections: &HashMap<&str, Vec<String>>,
) -> Option<bool> {
    match rule {
        PullRule::None => Some(true),
        PullRule::EqUserId { col } => row.get(*col).and_then(|v| v.as_str()).map(|v| v == user_id),
        PullRule::OrNullEqUserId { col } => match row.get(*col) {
            None => Some(true),
            Some(serde_json::Value::Null) => Some(true),
            Some(serde_json::Value::String(s)) => Some(s == user_id),
            Some(_) => Some(false),
        },
        PullRule::InCollection { col, collection } => {
            let set = collections.get(collection)?;
            let value = row.get(*col).and_then(|v| v.as_str())?;
            Some(set.iter().any(|g| g == value))
        }
        PullRule::Compound { op, rules } => {
            let present: Vec<bool> = rules
                .iter()
                .filter_map(|r| evaluate(r, row, user_id, collections))
                .collect();
            if present.is_empty() {
                return None;
            }
            Some(match op {
                BoolOp::And => present.into_iter().all(|b| b),
                BoolOp::Or => present.into_iter().any(|b| b),
            })
        }
        PullRule::Rpc { .. } => None,
    }
}

pub struct Registry {
    tables: HashMap<&'static str, TableMeta>,
    /// Insertion order, used as a stable fallback for topo-sort ties.
    order: Vec<&'static str>,
}

impl Registry {
    pub fn new(tables: Vec<TableMeta>) -> Self {
        let mut map = HashMap::with_capacity(tables.len());
        let mut order = Vec::with_capacity(tables.len());
        for t in tables {
            order.push(t.name);
            map.insert(t.name, t);
        }
        Self { tables: map, order }
    }

    pub fn get(&self, name: &str) -> Option<&TableMeta> {
        self.tables.get(name)
    }

    pub fn require(&self, name: &'static str) -> Result<&TableMeta, crate::error::SyncError> {
        self.get(name)
            .ok_or(crate::error::SyncError::UnknownTable(name))
    }

    pub fn user_tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.order
            .iter()
            .filter_map(move |n| self.tables.get(n))
            .filter(|t| t.category == ChangeCategory::User)
    }

    pub fn reference_tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.order
            .iter()
            .filter_map(move |n| self.tables.get(n))
            .filter(|t| t.category == ChangeCategory::Reference)
    }

    pub fn all(&self) -> impl Iterator<Item = &TableMeta> {
        self.order.iter().filter_map(move |n| self.tables.get(n))
    }

    /// Topologically sorts the given table names so that a table always
    /// appears after every table it `depends_on`. Ties break by registration
    /// order for determinism.
    pub fn fk_safe_order<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<&'static str> {
        let wanted: Vec<&'static str> = names
            .into_iter()
            .filter_map(|n| self.tables.get(n).map(|t| t.name))
            .collect();

        let mut visited: HashMap<&'static str, bool> = HashMap::new();
        let mut out = Vec::with_capacity(wanted.len());

        fn visit(
            name: &'static str,
            tables: &HashMap<&'static str, TableMeta>,
            wanted: &[&'static str],
            visited: &mut HashMap<&'static str, bool>,
            out: &mut Vec<&'static str>,
        ) {
            match visited.get(name) {
                Some(true) => return,
                Some(false) => return, // cycle guard: already on stack, skip
                None => {}
            }
            visited.insert(name, false);
            if let Some(meta) = tables.get(name) {
                for dep in meta.depends_on() {
                    if wanted.contains(&dep) {
                        visit(dep, tables, wanted, visited, out);
                    }
                }
            }
            visited.insert(name, true);
            out.push(name);
        }

        for name in &self.order {
            if wanted.contains(name) {
                visit(name, &self.tables, &wanted, &mut visited, &mut out);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog::example_compound_rule;
    use serde_json::json;

    fn row(v: serde_json::Value) -> crate::row::Row {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn eq_user_id_matches_only_owner() {
        let mine = row(json!({ "user_ref": "u1" }));
        let theirs = row(json!({ "user_ref": "u2" }));
        let rule = PullRule::EqUserId { col: "user_ref" };
        let collections = HashMap::new();
        assert_eq!(evaluate(&rule, &mine, "u1", &collections), Some(true));
        assert_eq!(evaluate(&rule, &theirs, "u1", &collections), Some(false));
    }

    #[test]
    fn or_null_eq_user_id_admits_public_and_own_rows() {
        let public = row(json!({ "user_ref": null }));
        let mine = row(json!({ "user_ref": "u1" }));
        let theirs = row(json!({ "user_ref": "u2" }));
        let rule = PullRule::OrNullEqUserId { col: "user_ref" };
        let collections = HashMap::new();
        assert_eq!(evaluate(&rule, &public, "u1", &collections), Some(true));
        assert_eq!(evaluate(&rule, &mine, "u1", &collections), Some(true));
        assert_eq!(evaluate(&rule, &theirs, "u1", &collections), Some(false));
    }

    #[test]
    fn in_collection_checks_membership_and_is_null_when_uncomputable() {
        let folk = row(json!({ "genre": "folk" }));
        let rule = PullRule::InCollection { col: "genre", collection: "selectedGenres" };

        let mut collections = HashMap::new();
        collections.insert("selectedGenres", vec!["irish".to_string(), "folk".to_string()]);
        assert_eq!(evaluate(&rule, &folk, "u1", &collections), Some(true));

        let no_collections = HashMap::new();
        assert_eq!(evaluate(&rule, &folk, "u1", &no_collections), None);
    }

    #[test]
    fn compound_or_skips_null_subrules_instead_of_vetoing() {
        let private_tune = row(json!({ "private_for": "u1", "genre": "klezmer" }));
        let rule = example_compound_rule();
        // No genre collection supplied: the `InCollection` sub-rule is null
        // and must be skipped, leaving `eqUserId` as the sole deciding vote.
        let collections = HashMap::new();
        assert_eq!(evaluate(&rule, &private_tune, "u1", &collections), Some(true));
    }

    #[test]
    fn compound_and_requires_every_evaluable_subrule() {
        let rule = PullRule::Compound {
            op: BoolOp::And,
            rules: vec![
                PullRule::EqUserId { col: "private_for" },
                PullRule::InCollection { col: "genre", collection: "selectedGenres" },
            ],
        };
        let mut collections = HashMap::new();
        collections.insert("selectedGenres", vec!["irish".to_string()]);
        let row_mine_wrong_genre = row(json!({ "private_for": "u1", "genre": "folk" }));
        assert_eq!(evaluate(&rule, &row_mine_wrong_genre, "u1", &collections), Some(false));
    }
}
