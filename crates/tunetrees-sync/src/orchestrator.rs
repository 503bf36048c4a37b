//! Orchestrator / Scheduler.
//!
//! Owns the sync lifecycle end to end and is the only piece of this crate a
//! host application talks to directly: `begin_session` on login,
//! `end_session` on logout, `force_sync` for a manual nudge,
//! `queue_stats`/`status` for the UI's aggregate signal.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{self, QueueStats};
use crate::presync;
use crate::pull::{self, PullContext};
use crate::push;
use crate::realtime::{RealtimeSubscriber, RealtimeTransport};
use crate::remote::RemoteWorker;
use crate::store::LocalStore;

/// The aggregate user-visible signal: what the UI shows for a
/// connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Offline,
    Online,
    Syncing,
}

struct SessionShared {
    user_id: String,
    device_id: String,
    selected_genre_ids: Mutex<Vec<String>>,
    status: Mutex<SyncStatus>,
    in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    tick_shutdown: Arc<Notify>,
    tick_handle: JoinHandle<()>,
    subscriber: RealtimeSubscriber,
}

pub struct Orchestrator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteWorker>,
    realtime: Arc<dyn RealtimeTransport>,
    config: SyncConfig,
    session: Mutex<Option<ActiveSession>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteWorker>,
        realtime: Arc<dyn RealtimeTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            realtime,
            config,
            session: Mutex::new(None),
        }
    }

    /// `beginSession(userId, deviceId)`: initialize pre-sync, then start
    /// periodic ticks and the realtime subscriber.
    #[instrument(skip(self))]
    pub async fn begin_session(&self, user_id: &str, device_id: &str) -> SyncResult<()> {
        if self.session.lock().is_some() {
            return Err(SyncError::Other("session already active".to_string()));
        }

        let is_initial_sync = self.store.get_watermark("user_profile")?.is_none();
        let outcome = presync::run(
            self.store.as_ref(),
            self.remote.as_ref(),
            user_id,
            is_initial_sync,
            self.config.pull_page_size,
        )
        .await?;
        info!(
            device_id,
            rows = outcome.metadata_rows_applied,
            genres = outcome.selected_genre_ids.len(),
            "pre-sync complete"
        );

        let shared = Arc::new(SessionShared {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            selected_genre_ids: Mutex::new(outcome.selected_genre_ids),
            status: Mutex::new(SyncStatus::Online),
            in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        });

        let tick_shutdown = Arc::new(Notify::new());
        let tick_handle = spawn_tick_loop(
            self.store.clone(),
            self.remote.clone(),
            shared.clone(),
            self.config.clone(),
            tick_shutdown.clone(),
        );

        let subscriber = {
            let store = self.store.clone();
            let remote = self.remote.clone();
            let shared = shared.clone();
            let config = self.config.clone();
            RealtimeSubscriber::spawn(
                self.realtime.clone(),
                self.store.registry_arc(),
                user_id.to_string(),
                self.config.realtime_coalesce_window,
                move |tables| {
                    let store = store.clone();
                    let remote = remote.clone();
                    let shared = shared.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let _ = run_cycle(&store, remote.as_ref(), &shared, &config, Some(tables)).await;
                    });
                },
            )
        };

        *self.session.lock() = Some(ActiveSession {
            shared,
            tick_shutdown,
            tick_handle,
            subscriber,
        });
        Ok(())
    }

    /// `endSession()`: stop subscriber, quiesce in-flight sync, clear local
    /// data.
    #[instrument(skip(self))]
    pub async fn end_session(&self) -> SyncResult<()> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        session.tick_shutdown.notify_one();
        let _ = session.tick_handle.await;
        session.subscriber.shutdown().await;

        while session.shared.in_flight.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.store.clear_all_data()
    }

    /// `forceSync()`: nudges an immediate cycle, collapsed into whatever
    /// cycle is already in flight if one is running.
    #[instrument(skip(self))]
    pub async fn force_sync(&self) -> SyncResult<()> {
        let shared = {
            let guard = self.session.lock();
            guard.as_ref().map(|s| s.shared.clone()).ok_or(SyncError::NoSession)?
        };
        run_cycle(&self.store, self.remote.as_ref(), &shared, &self.config, None).await
    }

    /// `queueStats()`: `{pending, syncing, failed}`.
    pub fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.store.with_connection(|conn| outbox::queue_stats(conn))
    }

    /// The local store handle the host application reads and writes through
    /// directly — UI writes pass through the normal tables.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn status(&self) -> SyncStatus {
        self.session.lock().as_ref().map(|s| *s.shared.status.lock()).unwrap_or(SyncStatus::Offline)
    }

    /// The concrete call site for orphan cleanup: the host calls this when
    /// the user's genre selection changes in settings.
    #[instrument(skip(self))]
    pub fn on_genre_selection_changed(&self, new_selection: Vec<String>) -> SyncResult<usize> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(SyncError::NoSession)?;
        *session.shared.selected_genre_ids.lock() = new_selection.clone();
        presync::purge_orphaned_annotations(&self.store, &session.shared.user_id, &new_selection)
    }
}

fn spawn_tick_loop(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteWorker>,
    shared: Arc<SessionShared>,
    config: SyncConfig,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let attempts = shared.consecutive_failures.load(Ordering::SeqCst);
            let delay = if attempts == 0 {
                config.tick_interval
            } else {
                outbox::backoff_delay(attempts, config.backoff_initial, config.backoff_max)
            };

            let notified = shutdown.notified();
            tokio::pin!(notified);
            tokio::select! {
                _ = &mut notified => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let _ = run_cycle(&store, remote.as_ref(), &shared, &config, None).await;
        }
    })
}

/// One push-then-pull cycle: push, then pull. `tables` restricts the pull
/// to a realtime nudge's affected tables; `None` means the routine
/// full-registry incremental pull. Collapses into a no-op if a cycle is
/// already running for this session — at most one sync cycle runs at a
/// time per user, overlapping triggers are collapsed.
async fn run_cycle(
    store: &LocalStore,
    remote: &dyn RemoteWorker,
    shared: &SessionShared,
    config: &SyncConfig,
    tables: Option<Vec<&'static str>>,
) -> SyncResult<()> {
    if shared.in_flight.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    *shared.status.lock() = SyncStatus::Syncing;

    let outcome = async {
        push::run(store, remote, &shared.user_id, config).await?;

        let ctx = PullContext {
            user_id: shared.user_id.clone(),
            selected_genre_ids: Some(shared.selected_genre_ids.lock().clone()),
        };
        let target_tables: Vec<&'static str> = match tables {
            Some(t) => t,
            None => store.registry().all().map(|t| t.name).collect(),
        };
        pull::run(store, remote, &ctx, &target_tables, config.pull_page_size).await?;
        Ok(())
    }
    .await;

    shared.in_flight.store(false, Ordering::SeqCst);

    match &outcome {
        Ok(()) => {
            shared.consecutive_failures.store(0, Ordering::SeqCst);
            *shared.status.lock() = SyncStatus::Online;
        }
        Err(err) => {
            shared.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            warn!(error = %err, "sync cycle failed");
            *shared.status.lock() = if err.is_fatal() { SyncStatus::Offline } else { SyncStatus::Online };
        }
    }

    outcome
}
