//! Ambient configuration for the sync core.
//!
//! Mirrors the shape of a host application's config object (tick interval,
//! batch sizes, backoff caps) rather than hard-coding these as constants, so
//! the orchestrator stays testable with tight intervals and small batches.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the orchestrator runs a periodic tick when idle.
    pub tick_interval: Duration,
    /// Max outbox rows claimed per table per push batch.
    pub push_batch_size: usize,
    /// Max rows requested per table per pull page.
    pub pull_page_size: u32,
    /// Burst coalescing window for the realtime subscriber.
    pub realtime_coalesce_window: Duration,
    /// Base delay for exponential backoff on transport failures.
    pub backoff_initial: Duration,
    /// Cap for exponential backoff.
    pub backoff_max: Duration,
    /// Attempts before a failed outbox row is left for operator inspection
    /// instead of being retried automatically.
    pub max_attempts: u32,
    /// Base URL of the remote sync worker.
    pub remote_base_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            push_batch_size: 200,
            pull_page_size: 500,
            realtime_coalesce_window: Duration::from_millis(250),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            max_attempts: 10,
            remote_base_url: "https://sync.tunetrees.app".to_string(),
        }
    }
}
