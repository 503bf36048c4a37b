//! Realtime Subscriber.
//!
//! Nudges the orchestrator when the remote reports a table has changed; it
//! never applies rows itself, only tells the caller which tables are now
//! worth a pull. Notifications arriving within a short window are coalesced
//! into one nudge so a burst of remote writes doesn't fire a pull per row.
//!
//! The wire protocol is left open, so this is built as a polling long-request
//! behind a [`RealtimeTransport`] trait — the same shape `RemoteWorker` takes
//! for push/pull, so a future WebSocket/SSE transport slots in without
//! touching the coalescing logic.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::error::SyncResult;
use crate::registry::Registry;

/// The boundary the subscriber polls. A call either returns the tables that
/// changed since the last call, or blocks (server-side) until one does or a
/// server-enforced timeout elapses, in which case it resolves with an empty
/// list — the caller just polls again.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn poll_once(&self, user_id: &str) -> SyncResult<Vec<String>>;
}

/// Production implementation: a long-poll HTTP request reusing the same
/// client `HttpRemoteWorker` would use, kept separate since the subscriber
/// is a standing subscription with its own retry/backoff shape, not a
/// request/response call.
pub struct HttpRealtimeTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRealtimeTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RealtimeTransport for HttpRealtimeTransport {
    async fn poll_once(&self, user_id: &str) -> SyncResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Resp {
            tables: Vec<String>,
        }
        let resp = self
            .client
            .get(format!("{}/sync/subscribe", self.base_url))
            .query(&[("userId", user_id)])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<Resp>().await?.tables)
    }
}

/// A running subscription. Dropping this without calling [`shutdown`]
/// leaves the background task running — callers should always call
/// `shutdown` on logout so it's torn down deterministically before local
/// state is cleared.
pub struct RealtimeSubscriber {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl RealtimeSubscriber {
    /// Starts the poll loop. `on_nudge` is called with the coalesced set of
    /// changed table names (already resolved against the registry, so
    /// notifications for unknown tables are dropped rather than handed to
    /// the caller) at most once per `coalesce_window`.
    #[instrument(skip(transport, registry, on_nudge))]
    pub fn spawn(
        transport: Arc<dyn RealtimeTransport>,
        registry: Arc<Registry>,
        user_id: String,
        coalesce_window: Duration,
        mut on_nudge: impl FnMut(Vec<&'static str>) + Send + 'static,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_task = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let notified = shutdown_task.notified();
                tokio::pin!(notified);
                tokio::select! {
                    _ = &mut notified => break,
                    result = transport.poll_once(&user_id) => {
                        match result {
                            Ok(tables) => {
                                let resolved = resolve_tables(&registry, tables);
                                if resolved.is_empty() {
                                    continue;
                                }
                                let mut pending: HashSet<&'static str> = resolved.into_iter().collect();
                                tokio::select! {
                                    _ = tokio::time::sleep(coalesce_window) => {}
                                    _ = shutdown_task.notified() => {
                                        on_nudge(pending.drain().collect());
                                        break;
                                    }
                                }
                                on_nudge(pending.drain().collect());
                            }
                            Err(err) => {
                                warn!(error = %err, "realtime poll failed, retrying after backoff");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Tears the subscription down and waits for the background task to
    /// actually stop, rather than a fire-and-forget signal.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RealtimeSubscriber {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown.notify_one();
        }
    }
}

fn resolve_tables(registry: &Registry, tables: Vec<String>) -> Vec<&'static str> {
    tables
        .iter()
        .filter_map(|t| registry.get(t).map(|m| m.name))
        .collect()
}

/// In-process transport: notifications are pushed by the caller, and
/// `poll_once` yields them one batch at a time, otherwise waiting for more
/// to be pushed (modeling a real long-poll that blocks until something
/// happens). Used the same way [`crate::remote::InMemoryRemoteWorker`] is —
/// by this crate's own tests and by anything exercising the orchestrator
/// without a live subscription endpoint.
pub struct QueueRealtimeTransport {
    queue: Mutex<std::collections::VecDeque<Vec<String>>>,
    notify: Notify,
}

impl Default for QueueRealtimeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueRealtimeTransport {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, tables: Vec<String>) {
        self.queue.lock().push_back(tables);
        self.notify.notify_one();
    }
}

#[async_trait]
impl RealtimeTransport for QueueRealtimeTransport {
    async fn poll_once(&self, _user_id: &str) -> SyncResult<Vec<String>> {
        loop {
            if let Some(batch) = self.queue.lock().pop_front() {
                return Ok(batch);
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn burst_within_window_coalesces_into_one_nudge() {
        let registry = StdArc::new(catalog::build());
        let transport = StdArc::new(QueueRealtimeTransport::new());
        let nudges: Arc<Mutex<Vec<Vec<&'static str>>>> = Arc::new(Mutex::new(Vec::new()));
        let nudges_clone = nudges.clone();

        let sub = RealtimeSubscriber::spawn(
            transport.clone(),
            registry,
            "u1".to_string(),
            Duration::from_millis(50),
            move |tables| nudges_clone.lock().push(tables),
        );

        transport.push(vec!["tune".to_string()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.push(vec!["playlist_tune".to_string()]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        sub.shutdown().await;

        let calls = nudges.lock();
        assert_eq!(calls.len(), 1);
        let mut tables = calls[0].clone();
        tables.sort_unstable();
        assert_eq!(tables, vec!["playlist_tune", "tune"]);
    }

    #[tokio::test]
    async fn unknown_table_name_is_dropped_silently() {
        let registry = StdArc::new(catalog::build());
        let transport = StdArc::new(QueueRealtimeTransport::new());
        let nudges: Arc<Mutex<Vec<Vec<&'static str>>>> = Arc::new(Mutex::new(Vec::new()));
        let nudges_clone = nudges.clone();

        let sub = RealtimeSubscriber::spawn(
            transport.clone(),
            registry,
            "u1".to_string(),
            Duration::from_millis(30),
            move |tables| nudges_clone.lock().push(tables),
        );

        transport.push(vec!["not_a_real_table".to_string()]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.shutdown().await;

        assert!(nudges.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_further_nudges() {
        let registry = StdArc::new(catalog::build());
        let transport = StdArc::new(QueueRealtimeTransport::new());
        let nudges: Arc<Mutex<Vec<Vec<&'static str>>>> = Arc::new(Mutex::new(Vec::new()));
        let nudges_clone = nudges.clone();

        let sub = RealtimeSubscriber::spawn(
            transport.clone(),
            registry,
            "u1".to_string(),
            Duration::from_millis(20),
            move |tables| nudges_clone.lock().push(tables),
        );
        sub.shutdown().await;

        transport.push(vec!["tune".to_string()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(nudges.lock().is_empty());
    }
}
