//! Orchestration of sync sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use edgesync_common::{facts, Error, Result, SessionId, SyncTick};
use edgesync_peer::{CentralPeer, StartSessionRequest};
use edgesync_store::{Database, ModelRegistry, SnapshotStore};

use crate::clock::TickClock;
use crate::config::SyncConfig;
use crate::merge::FieldTickResolver;
use crate::persist::{PersistOptions, Persister, SaveStats};
use crate::pull::Puller;
use crate::push::Pusher;
use crate::state::{LastRun, SyncPhase, SyncState};

/// Why a sync was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReason {
    /// Ask central to serve this session ahead of its queue.
    pub urgent: bool,
    pub label: String,
}

impl SyncReason {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            urgent: false,
            label: label.into(),
        }
    }

    pub fn urgent(label: impl Into<String>) -> Self {
        Self {
            urgent: true,
            label: label.into(),
        }
    }

    /// The reason used by the periodic scheduler.
    pub fn scheduled() -> Self {
        Self::new("scheduled")
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// What a trigger led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerResult {
    /// False when sync is switched off in configuration.
    pub enabled: bool,
    /// Central asked the facility to come back later.
    pub queued: bool,
    /// A session ran to completion.
    pub ran: bool,
}

impl TriggerResult {
    fn disabled() -> Self {
        Self {
            enabled: false,
            queued: false,
            ran: false,
        }
    }

    fn queued() -> Self {
        Self {
            enabled: true,
            queued: true,
            ran: false,
        }
    }

    fn ran() -> Self {
        Self {
            enabled: true,
            queued: false,
            ran: true,
        }
    }
}

type RunOutput = std::result::Result<TriggerResult, Arc<Error>>;
type SharedRun = Shared<BoxFuture<'static, RunOutput>>;

/// The running cycle and the one queued behind it.
#[derive(Default)]
struct Runs {
    current: Option<SharedRun>,
    next: Option<SharedRun>,
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionSummary {
    pushed: usize,
    pulled: u64,
    saved: SaveStats,
}

struct Inner {
    db: Database,
    registry: ModelRegistry,
    peer: Arc<dyn CentralPeer>,
    config: SyncConfig,
    clock: TickClock,
    pusher: Pusher,
    puller: Puller,
    persister: Persister,
    state: RwLock<SyncState>,
    runs: Mutex<Runs>,
}

/// Drives sync sessions for a facility.
///
/// At most one session runs at a time. Triggers arriving while one runs are
/// coalesced onto a single follow-up cycle.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(db: Database, registry: ModelRegistry, peer: Arc<dyn CentralPeer>, config: SyncConfig) -> Self {
        let inner = Inner {
            clock: TickClock::new(db.clone()),
            pusher: Pusher::new(db.clone(), registry.clone(), config.push.clone()),
            puller: Puller::new(db.clone(), registry.clone(), config.pull.clone()),
            persister: Persister::new(Arc::new(FieldTickResolver)),
            state: RwLock::new(SyncState::new()),
            runs: Mutex::new(Runs::default()),
            db,
            registry,
            peer,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Request a sync and wait for the cycle that serves it.
    ///
    /// With no sync running a new cycle starts. With one running, the caller
    /// waits for it and then for exactly one more cycle, which every caller
    /// arriving in the meantime shares.
    ///
    /// # Errors
    /// - The cycle serving this trigger failed
    pub async fn trigger_sync(&self, reason: SyncReason) -> Result<TriggerResult> {
        if !self.inner.config.enabled {
            debug!(reason = %reason, "Sync disabled, ignoring trigger");
            return Ok(TriggerResult::disabled());
        }

        let run = {
            let mut runs = self.inner.runs.lock().await;
            if let Some(next) = runs.next.clone() {
                debug!(reason = %reason, "Joining queued sync");
                next
            } else if let Some(current) = runs.current.clone() {
                debug!(reason = %reason, "Sync running, queueing one more");
                let next = self.spawn_run(Some(current), reason);
                runs.next = Some(next.clone());
                next
            } else {
                let run = self.spawn_run(None, reason);
                runs.current = Some(run.clone());
                run
            }
        };

        run.await.map_err(unshare)
    }

    /// Whether a cycle is running or queued.
    pub async fn is_sync_running(&self) -> bool {
        self.inner.runs.lock().await.current.is_some()
    }

    /// Summary of the last finished cycle.
    pub async fn last_run(&self) -> Option<LastRun> {
        self.inner.state.read().await.last_run.clone()
    }

    pub async fn state(&self) -> SyncState {
        self.inner.state.read().await.clone()
    }

    /// Start a cycle on its own task, after `after` if given.
    ///
    /// The cycle makes progress whether or not anyone awaits it.
    fn spawn_run(&self, after: Option<SharedRun>, reason: SyncReason) -> SharedRun {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = after {
                // Its outcome belongs to its own callers.
                let _ = previous.await;
            }
            let result = inner.run_sync(&reason).await.map_err(Arc::new);
            let mut runs = inner.runs.lock().await;
            runs.current = runs.next.take();
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(Arc::new(Error::Internal(format!("sync task failed: {}", e)))))
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn enter(&self, phase: SyncPhase) {
        self.state.write().await.enter(phase);
    }

    async fn finish(&self, started: Instant, summary: SessionSummary, queued: bool, error: Option<&Error>) {
        let run = LastRun {
            completed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            pushed: summary.pushed,
            pulled: summary.pulled,
            saved: summary.saved.total(),
            queued,
            error: error.map(ToString::to_string),
        };
        self.state.write().await.finish(run);
    }

    async fn run_sync(&self, reason: &SyncReason) -> Result<TriggerResult> {
        let started = Instant::now();
        self.state.write().await.runs += 1;
        self.enter(SyncPhase::Negotiating).await;

        let since = match self.clock.get(facts::LAST_SUCCESSFUL_SYNC_PULL).await {
            Ok(tick) => tick.unwrap_or(SyncTick::FULL_RESYNC),
            Err(e) => {
                self.finish(started, SessionSummary::default(), false, Some(&e)).await;
                return Err(e);
            }
        };
        info!(reason = %reason, urgent = reason.urgent, since = %since, "Sync attempt");

        let request = StartSessionRequest {
            urgent: reason.urgent,
            last_synced_tick: since,
        };
        let granted = match self.peer.start_session(request).await.and_then(|r| r.granted()) {
            Ok(granted) => granted,
            Err(e) => {
                error!(reason = %reason, error = %e, "Could not start sync session");
                self.finish(started, SessionSummary::default(), false, Some(&e)).await;
                return Err(e);
            }
        };
        let Some((session_id, started_at_tick)) = granted else {
            info!(reason = %reason, "Central queued the sync request");
            self.finish(started, SessionSummary::default(), true, None).await;
            return Ok(TriggerResult::queued());
        };
        info!(session_id = %session_id, started_at_tick = %started_at_tick, "Sync session received");

        let mut summary = SessionSummary::default();
        let result = self
            .run_session(&session_id, started_at_tick, since, &mut summary)
            .await;

        if let Err(e) = &result {
            let phase = self.state.read().await.phase;
            self.enter(SyncPhase::Errored).await;
            error!(session_id = %session_id, phase = %phase, error = %e, "Sync failed");
            if !e.is_remote_problem() {
                if let Err(report) = self.peer.mark_session_errored(&session_id, &e.to_string()).await {
                    warn!(session_id = %session_id, error = %report, "Could not report failed session");
                }
            }
        }

        let snapshot = SnapshotStore::for_session(&session_id);
        if let Err(e) = self.db.call(move |conn| snapshot.drop(conn)).await {
            warn!(session_id = %session_id, error = %e, "Could not drop session snapshot");
        }

        self.finish(started, summary, false, result.as_ref().err()).await;
        result?;

        info!(
            session_id = %session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            pushed = summary.pushed,
            pulled = summary.pulled,
            saved = summary.saved.total(),
            "Sync complete"
        );
        Ok(TriggerResult::ran())
    }

    async fn run_session(
        &self,
        session_id: &SessionId,
        started_at_tick: SyncTick,
        since: SyncTick,
        summary: &mut SessionSummary,
    ) -> Result<()> {
        let stale = self.db.call(|conn| SnapshotStore::drop_all(conn)).await?;
        if stale > 0 {
            info!(session_id = %session_id, stale, "Dropped stale snapshot tables");
        }

        self.enter(SyncPhase::Pushing).await;
        let push = self
            .pusher
            .push(self.peer.as_ref(), session_id, started_at_tick)
            .await?;
        summary.pushed = push.pushed;

        self.enter(SyncPhase::Pulling).await;
        let pull = self.puller.pull(self.peer.as_ref(), session_id, since).await?;
        summary.pulled = pull.total_pulled;

        self.enter(SyncPhase::Committing).await;
        summary.saved = self.commit(session_id, pull.pull_until).await?;

        self.peer.end_session(session_id).await?;
        Ok(())
    }

    /// Apply the staged pull, advancing the pull cursor in the transaction
    /// of the last batch.
    async fn commit(&self, session_id: &SessionId, pull_until: SyncTick) -> Result<SaveStats> {
        let models = self.registry.models_for_pull();
        let options = PersistOptions::facility(self.config.persist.clone());
        let store = self.db.facts();

        let (stats, cursor) = self
            .persister
            .save_incoming_changes(&self.db, session_id, &models, &options, move |conn| {
                store.set_value(conn, facts::TABLES_FOR_FULL_RESYNC, None)?;
                let cursor = store
                    .get(conn, facts::LAST_SUCCESSFUL_SYNC_PULL)?
                    .map_or(pull_until, |current| current.max(pull_until));
                store.set(conn, facts::LAST_SUCCESSFUL_SYNC_PULL, cursor)?;
                Ok(cursor)
            })
            .await?;

        debug!(session_id = %session_id, saved = stats.total(), cursor = %cursor, "Pull committed");
        Ok(stats)
    }
}

/// Recover an owned error from one shared between coalesced callers.
fn unshare(err: Arc<Error>) -> Error {
    Arc::try_unwrap(err).unwrap_or_else(|shared| match shared.as_ref() {
        Error::Problem { status, message } => Error::problem(*status, message.clone()),
        Error::Network(message) => Error::Network(message.clone()),
        Error::Protocol(message) => Error::Protocol(message.clone()),
        Error::Validation(details) => Error::Validation(details.clone()),
        Error::Conflict(message) => Error::Conflict(message.clone()),
        other => Error::Internal(other.to_string()),
    })
}
