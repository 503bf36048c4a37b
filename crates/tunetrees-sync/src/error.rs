//! Error taxonomy for the sync core.

use crate::registry::RowKey;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Network down, 5xx, timeouts — push items return to `pending` and back off.
    #[error("transient transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote already has a newer version of this row; not a failure, just a signal
    /// to drop the outbox entry and let pull bring the winner down.
    #[error("stale write rejected for {table}/{key:?}")]
    StaleWrite { table: &'static str, key: RowKey },

    /// Unknown column / incompatible shape. Fatal: orchestrator pauses.
    #[error("schema mismatch on table {table}: {detail}")]
    SchemaMismatch { table: &'static str, detail: String },

    /// A pulled row's foreign key parent never arrived in the batch.
    #[error("unresolved foreign key for {table}/{key:?} after fixpoint")]
    ForeignKeyUnresolved { table: &'static str, key: RowKey },

    /// Session/identity provider rejected the request.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Local store failed to open, or schema-version marker mismatched beyond repair.
    #[error("local store corrupted or unreadable: {0}")]
    StoreCorrupt(String),

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no table metadata registered for {0}")]
    UnknownTable(&'static str),

    #[error("sync already in progress")]
    AlreadySyncing,

    #[error("no authenticated session")]
    NoSession,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. } | Self::Auth(_) | Self::StoreCorrupt(_)
        )
    }
}
