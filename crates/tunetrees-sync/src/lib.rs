//! Bidirectional sync engine for the local-first client.
//!
//! Modules map directly onto the pipeline stages: rows are written through
//! [`store`] (which fires the outbox triggers), drained by [`push`], applied
//! on the way in by [`pull`] with [`conflict`] breaking ties, [`presync`]
//! bootstraps a device's genre filter before the first real pull, and
//! [`realtime`] nudges an otherwise poll-only [`orchestrator`] when the
//! remote has something new. [`registry`] is the declarative table catalog
//! everything else reads instead of hardcoding per-table logic.

pub mod adapter;
pub mod conflict;
pub mod config;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod outbox;
pub mod presync;
pub mod pull;
pub mod push;
pub mod realtime;
pub mod registry;
pub mod remote;
pub mod row;
pub mod store;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use orchestrator::{Orchestrator, SyncStatus};
pub use outbox::QueueStats;
pub use realtime::{HttpRealtimeTransport, RealtimeTransport};
pub use registry::{catalog, Registry, RowKey, TableMeta};
pub use remote::{HttpRemoteWorker, RemoteWorker};
pub use row::Row;
pub use store::LocalStore;
