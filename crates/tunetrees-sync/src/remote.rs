//! The remote worker boundary.
//!
//! [`RemoteWorker`] is the one trait the push and pull pipelines depend on.
//! Tests substitute [`InMemoryRemoteWorker`]; production code uses
//! [`HttpRemoteWorker`] over the same `reqwest` client the rest of the
//! workspace already depends on. Modeling the boundary as a trait, rather
//! than a concrete HTTP client threaded through every function, keeps the
//! pipelines swappable onto any transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;
use crate::registry::RowKey;
use crate::row::Row;

#[derive(Debug, Clone, Serialize)]
pub struct PushBatch {
    pub table: &'static str,
    pub conflict_target: Vec<&'static str>,
    pub upserts: Vec<Row>,
    pub deletes: Vec<RowKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub user_id: String,
    pub batches: Vec<PushBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushOutcome {
    Applied,
    RejectedStale,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResult {
    pub table: String,
    pub row_key: RowKey,
    pub outcome: PushOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullTableRequest {
    pub name: &'static str,
    pub since: Option<String>,
    pub limit: u32,
    pub offset: u32,
    /// The declared pull rule itself (spec §6.2) — a real remote already
    /// knows how to filter its own tables, but sending the rule lets it be
    /// table-agnostic on the server side too, and lets a test double enforce
    /// the same contract production is specified to apply.
    pub rule: crate::registry::PullRule,
    /// Extra context the declared rule needs: `selectedGenreIds`, userId,
    /// etc.
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequest {
    pub user_id: String,
    pub tables: Vec<PullTableRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullTableResponse {
    pub name: String,
    pub rows: Vec<Row>,
    pub next_cursor: Option<PullCursor>,
    pub max_last_modified_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PullCursor {
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullResponse {
    pub tables: Vec<PullTableResponse>,
}

/// A single RPC call for rule-based tables and the cold-start membership
/// genre probe.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub name: &'static str,
    pub params: HashMap<String, Value>,
}

/// The boundary the push/pull pipelines and the realtime subscriber talk to.
/// Everything above this trait is transport-agnostic.
#[async_trait]
pub trait RemoteWorker: Send + Sync {
    async fn push(&self, req: PushRequest) -> SyncResult<PushResponse>;
    async fn pull(&self, req: PullRequest) -> SyncResult<PullResponse>;
    async fn rpc(&self, req: RpcRequest) -> SyncResult<Vec<Row>>;
}

/// Production implementation over `reqwest`. Errors from the transport
/// itself map straight onto `SyncError::Transport` via `#[from]`.
pub struct HttpRemoteWorker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteWorker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RemoteWorker for HttpRemoteWorker {
    async fn push(&self, req: PushRequest) -> SyncResult<PushResponse> {
        let resp = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn pull(&self, req: PullRequest) -> SyncResult<PullResponse> {
        let resp = self
            .client
            .post(format!("{}/sync/pull", self.base_url))
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn rpc(&self, req: RpcRequest) -> SyncResult<Vec<Row>> {
        let resp = self
            .client
            .post(format!("{}/rpc/{}", self.base_url, req.name))
            .json(&req.params)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// In-memory stand-in used by the integration and property tests, and by
/// anything exercising the pipelines without a live worker. Holds its
/// authoritative copy of every table keyed by row key, applying the same
/// last-write-wins rule the real worker applies, so rejections are
/// exercised exactly like production.
pub struct InMemoryRemoteWorker {
    state: Mutex<HashMap<&'static str, HashMap<RowKey, Row>>>,
    rpc_handlers: Mutex<HashMap<&'static str, Box<dyn Fn(&HashMap<String, Value>) -> Vec<Row> + Send + Sync>>>,
}

impl Default for InMemoryRemoteWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteWorker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            rpc_handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn wrap(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Seeds or overwrites the remote's copy of a row, bypassing LWW — used
    /// by tests to set up "device B already pushed" preconditions.
    pub fn seed(&self, table: &'static str, key: RowKey, row: Row) {
        self.state.lock().entry(table).or_default().insert(key, row);
    }

    pub fn get(&self, table: &'static str, key: &RowKey) -> Option<Row> {
        self.state.lock().get(table).and_then(|t| t.get(key)).cloned()
    }

    pub fn table_rows(&self, table: &'static str) -> Vec<Row> {
        self.state
            .lock()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a named RPC that computes its result set from the in-memory
    /// state and the request params, e.g. `sync_get_user_tunes`.
    pub fn set_rpc(
        &self,
        name: &'static str,
        handler: impl Fn(&HashMap<String, Value>) -> Vec<Row> + Send + Sync + 'static,
    ) {
        self.rpc_handlers.lock().insert(name, Box::new(handler));
    }

    fn apply_upsert(&self, table: &'static str, row: Row, version_col: &str, timestamp_col: &str, key: RowKey) -> PushResult {
        use crate::conflict::{resolve_optional, VersionStamp};

        let mut state = self.state.lock();
        let table_map = state.entry(table).or_default();
        let existing = table_map.get(&key);
        let incoming_stamp = VersionStamp::of(&row, version_col, timestamp_col);
        let existing_stamp = existing.and_then(|r| VersionStamp::of(r, version_col, timestamp_col));

        let Some(incoming_stamp) = incoming_stamp else {
            return PushResult {
                table: table.to_string(),
                row_key: key,
                outcome: PushOutcome::Error,
                error: Some("missing sync_version/last_modified_at".to_string()),
            };
        };

        match resolve_optional(existing_stamp.as_ref(), &incoming_stamp) {
            crate::conflict::Decision::KeepLocal => PushResult {
                table: table.to_string(),
                row_key: key,
                outcome: PushOutcome::RejectedStale,
                error: None,
            },
            crate::conflict::Decision::TakeRemote | crate::conflict::Decision::Noop => {
                table_map.insert(key.clone(), row);
                PushResult {
                    table: table.to_string(),
                    row_key: key,
                    outcome: PushOutcome::Applied,
                    error: None,
                }
            }
        }
    }
}

#[async_trait]
impl RemoteWorker for InMemoryRemoteWorker {
    async fn push(&self, req: PushRequest) -> SyncResult<PushResponse> {
        let mut results = Vec::new();
        for batch in req.batches {
            for row in batch.upserts {
                let key = key_from_row(&row, &batch.conflict_target);
                // version/timestamp column names aren't on the wire batch;
                // callers of this mock always use the registry's standard
                // names, which every table in the catalog uses.
                results.push(self.apply_upsert(batch.table, row, "syncVersion", "lastModifiedAt", key));
            }
            for key in batch.deletes {
                self.state.lock().entry(batch.table).or_default().remove(&key);
                results.push(PushResult {
                    table: batch.table.to_string(),
                    row_key: key,
                    outcome: PushOutcome::Applied,
                    error: None,
                });
            }
        }
        Ok(PushResponse { results })
    }

    async fn pull(&self, req: PullRequest) -> SyncResult<PullResponse> {
        let state = self.state.lock();
        let mut tables = Vec::new();
        for t in req.tables {
            let collections = collections_from_params(&t.params);
            let rows: Vec<Row> = state
                .get(t.name)
                .map(|m| {
                    m.values()
                        .filter(|r| {
                            t.since.as_deref().map_or(true, |since| {
                                r.get("lastModifiedAt")
                                    .and_then(Value::as_str)
                                    .map(|ts| ts > since)
                                    .unwrap_or(true)
                            })
                        })
                        // `Rpc`-ruled tables are never fetched through this
                        // generic path (the pull pipeline calls `rpc()`
                        // instead), so `evaluate` returning `None` for them
                        // never applies here — every rule this loop actually
                        // sees is one it can decide, defaulting open only if
                        // a collection genuinely wasn't supplied. The declared
                        // rule's column names are the local (snake_case)
                        // convention, so the row's wire (camelCase) keys are
                        // translated before evaluating, same as `toLocal`
                        // does for the rest of the pipeline.
                        .filter(|r| {
                            let local_keyed = snake_keyed(r);
                            crate::registry::evaluate(&t.rule, &local_keyed, &req.user_id, &collections).unwrap_or(true)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let max_last_modified_at = rows
                .iter()
                .filter_map(|r| r.get("lastModifiedAt").and_then(Value::as_str))
                .max()
                .map(str::to_string);
            tables.push(PullTableResponse {
                name: t.name.to_string(),
                rows,
                next_cursor: None,
                max_last_modified_at,
            });
        }
        Ok(PullResponse { tables })
    }

    async fn rpc(&self, req: RpcRequest) -> SyncResult<Vec<Row>> {
        let handlers = self.rpc_handlers.lock();
        Ok(handlers.get(req.name).map(|h| h(&req.params)).unwrap_or_default())
    }
}

/// Pulls the `selectedGenreIds` param (as set by
/// [`crate::pull::PullContext::params_for`]) into the `{collectionName: [...]}`
/// shape [`crate::registry::evaluate`] expects for `InCollection`/`Compound`
/// rules. The catalog's only declared collection name is `"selectedGenres"`.
/// Renames a wire-format row's keys to the local (snake_case) convention the
/// registry's declared rules are written against, without the full `toLocal`
/// coercions (timestamp/bool normalization) `evaluate` has no need for.
fn snake_keyed(row: &Row) -> Row {
    row.iter()
        .map(|(k, v)| (crate::adapter::camel_to_snake(k), v.clone()))
        .collect()
}

fn collections_from_params(params: &HashMap<String, Value>) -> HashMap<&str, Vec<String>> {
    let mut out = HashMap::new();
    if let Some(Value::Array(items)) = params.get("selectedGenreIds") {
        let genres: Vec<String> = items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        out.insert("selectedGenres", genres);
    }
    out
}

fn key_from_row(row: &Row, conflict_target: &[&'static str]) -> RowKey {
    if conflict_target.len() == 1 {
        let col = conflict_target[0];
        let remote_col = crate::adapter::snake_to_camel(col);
        let v = row
            .get(col)
            .or_else(|| row.get(&remote_col))
            .and_then(Value::as_str)
            .unwrap_or_default();
        RowKey::Single(v.to_string())
    } else {
        let parts = conflict_target
            .iter()
            .map(|c| {
                let remote_col = crate::adapter::snake_to_camel(c);
                row.get(*c)
                    .or_else(|| row.get(&remote_col))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        RowKey::Composite(parts)
    }
}
