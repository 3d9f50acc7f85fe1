//! An in-process central node.
//!
//! [`LocalCentral`] runs the central side of the protocol against its own
//! database. It backs loopback syncs between two database files and the
//! integration tests, and documents what an HTTP central is expected to do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use edgesync_common::{Error, Result, SessionId, SyncChange, SyncTick};
use edgesync_peer::{
    CentralPeer, PullCursor, PullInitiation, PullRequest, PullStream, PulledChange, StartSessionRequest,
    StartSessionResponse, StreamMessage,
};
use edgesync_store::{
    changelog, Database, ModelRegistry, SnapshotDirection, SnapshotRecord, SnapshotStore, StoredRecord,
    SyncModel,
};

use crate::clock::TickClock;
use crate::config::PersistConfig;
use crate::merge::{ConflictResolver, FieldTickResolver};
use crate::persist::{PersistOptions, Persister};
use crate::validation::validate_changes;

const SESSIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    push_status TEXT NOT NULL DEFAULT 'pending',
    started_at_tick INTEGER NOT NULL,
    pull_until INTEGER,
    error TEXT,
    started_at TEXT NOT NULL,
    last_connection_at INTEGER NOT NULL,
    ended_at TEXT
);
"#;

/// Settings of an in-process central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Sessions served at once; further requests are told to queue.
    pub max_concurrent_sessions: usize,
    /// Extra sessions an urgent request may take once the regular ones are used.
    pub urgent_session_allowance: usize,
    /// An active session not heard from for this long is purged.
    pub session_lapse_ms: u64,
    /// Serve pulls as a message stream rather than pages.
    pub streaming: bool,
    /// Changes read from the snapshot per streamed batch.
    pub stream_page_size: usize,
    pub persist: PersistConfig,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            urgent_session_allowance: 1,
            session_lapse_ms: 10 * 60 * 1_000,
            streaming: false,
            stream_page_size: 1_000,
            persist: PersistConfig::default(),
        }
    }
}

impl CentralConfig {
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_urgent_session_allowance(mut self, allowance: usize) -> Self {
        self.urgent_session_allowance = allowance;
        self
    }

    pub fn with_session_lapse(mut self, lapse: Duration) -> Self {
        self.session_lapse_ms = lapse.as_millis() as u64;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Sessions a request may find active and still be admitted.
    fn session_limit(&self, urgent: bool) -> usize {
        if urgent {
            self.max_concurrent_sessions + self.urgent_session_allowance
        } else {
            self.max_concurrent_sessions
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Ended,
    Errored,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushStatus {
    Pending,
    Persisting,
    Complete,
    Failed,
}

impl PushStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Persisting => "persisting",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "persisting" => Ok(Self::Persisting),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown push status '{}'", other))),
        }
    }
}

struct SessionRow {
    status: String,
    push_status: PushStatus,
    error: Option<String>,
}

/// The central side of the sync protocol, backed by a local database.
#[derive(Clone)]
pub struct LocalCentral {
    db: Database,
    registry: ModelRegistry,
    clock: TickClock,
    persister: Persister,
    config: CentralConfig,
    admission: Arc<Mutex<()>>,
}

impl LocalCentral {
    /// Open a central over `db`, creating model and session tables.
    pub async fn open(db: Database, registry: ModelRegistry, config: CentralConfig) -> Result<Self> {
        Self::with_resolver(db, registry, config, Arc::new(FieldTickResolver)).await
    }

    /// Like [`open`](Self::open) with a custom merge policy.
    pub async fn with_resolver(
        db: Database,
        registry: ModelRegistry,
        config: CentralConfig,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<Self> {
        db.ensure_tables(&registry).await?;
        db.call(|conn| Ok(conn.execute_batch(SESSIONS_SCHEMA)?)).await?;

        Ok(Self {
            clock: TickClock::new(db.clone()),
            persister: Persister::new(resolver),
            db,
            registry,
            config,
            admission: Arc::new(Mutex::new(())),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Stage a chunk of pushed changes after validating them.
    ///
    /// # Errors
    /// - The session is unknown, closed or already completed its push
    /// - Any change is malformed; nothing from the chunk is staged then
    pub async fn add_incoming_changes(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()> {
        let row = self.active_session(session_id).await?;
        if row.push_status != PushStatus::Pending {
            return Err(Error::problem(
                Some(409),
                format!("session {} already completed its push", session_id),
            ));
        }
        validate_changes(&changes, &self.registry).map_err(Error::Validation)?;

        let count = changes.len();
        let snapshot = SnapshotStore::for_session(session_id);
        self.db
            .call(move |conn| snapshot.insert(conn, SnapshotDirection::Incoming, &changes))
            .await?;
        debug!(session_id = %session_id, count, "Staged pushed changes");
        Ok(())
    }

    /// Look up a session, recording that the facility is still connected.
    async fn session(&self, session_id: &SessionId) -> Result<Option<SessionRow>> {
        let id = session_id.as_str().to_string();
        let row = self
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_sessions SET last_connection_at = ?1 WHERE id = ?2 AND status = 'active'",
                    params![now_ms(), id],
                )?;
                Ok(conn
                    .query_row(
                        "SELECT status, push_status, error FROM sync_sessions WHERE id = ?1",
                        [id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, Option<String>>(2)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        row.map(|(status, push_status, error)| {
            Ok(SessionRow {
                status,
                push_status: PushStatus::parse(&push_status)?,
                error,
            })
        })
        .transpose()
    }

    async fn active_session(&self, session_id: &SessionId) -> Result<SessionRow> {
        match self.session(session_id).await? {
            None => Err(Error::problem(Some(404), format!("session {} not found", session_id))),
            Some(row) if row.status != SessionStatus::Active.as_str() => Err(Error::problem(
                Some(409),
                format!("session {} is {}", session_id, row.status),
            )),
            Some(row) => Ok(row),
        }
    }

    async fn set_push_status(&self, session_id: &SessionId, status: PushStatus, error: Option<String>) -> Result<()> {
        let id = session_id.as_str().to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_sessions SET push_status = ?1, error = COALESCE(?2, error) WHERE id = ?3",
                    params![status.as_str(), error, id],
                )?;
                Ok(())
            })
            .await
    }

    async fn close_session(&self, session_id: &SessionId, status: SessionStatus, error: Option<String>) -> Result<()> {
        if self.session(session_id).await?.is_none() {
            return Err(Error::problem(Some(404), format!("session {} not found", session_id)));
        }

        let id = session_id.as_str().to_string();
        let snapshot = SnapshotStore::for_session(session_id);
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE sync_sessions SET status = ?1, error = COALESCE(?2, error), ended_at = ?3
                     WHERE id = ?4",
                    params![status.as_str(), error, Utc::now().to_rfc3339(), id],
                )?;
                snapshot.drop(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Error out active sessions whose facility went quiet, freeing their slots.
    async fn purge_lapsed_sessions(&self) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(self.config.session_lapse_ms as i64);
        let purged = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM sync_sessions WHERE status = 'active' AND last_connection_at < ?1",
                    )?;
                    let rows = stmt.query_map([cutoff], |row| row.get(0))?;
                    rows.collect::<std::result::Result<_, _>>()?
                };
                for id in &ids {
                    tx.execute(
                        "UPDATE sync_sessions SET status = ?1, error = ?2, ended_at = ?3 WHERE id = ?4",
                        params![
                            SessionStatus::Errored.as_str(),
                            "session lapsed",
                            Utc::now().to_rfc3339(),
                            id
                        ],
                    )?;
                    SnapshotStore::for_session(&SessionId::new(id.as_str())?).drop(&tx)?;
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        for id in &purged {
            warn!(session_id = %id, "Purged lapsed session");
        }
        Ok(purged.len())
    }

    /// Apply a session's pushed changes. Runs in the background.
    async fn persist_push(&self, session_id: &SessionId, tables: Vec<String>) -> Result<()> {
        let (_, tock) = self.clock.tick_tock().await?;
        let models: Vec<Arc<dyn SyncModel>> = self
            .registry
            .models_for_push()
            .into_iter()
            .filter(|m| tables.iter().any(|t| t == m.table_name()))
            .collect();
        let options = PersistOptions::central(tock, self.config.persist.clone());
        let session = session_id.clone();

        let (stats, logged) = self
            .persister
            .save_incoming_changes(&self.db, session_id, &models, &options, move |conn| {
                store_pushed_changelog(conn, &session)
            })
            .await?;

        info!(
            session_id = %session_id,
            tock = %tock,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            restored = stats.restored,
            changelog = logged,
            "Persisted pushed changes"
        );
        Ok(())
    }

    /// Copy every change the facility should receive into the outgoing snapshot.
    fn snapshot_for_pull(
        conn: &Connection,
        session_id: &SessionId,
        models: &[Arc<dyn SyncModel>],
        request: &PullRequest,
        pull_until: SyncTick,
    ) -> Result<u64> {
        let snapshot = SnapshotStore::for_session(session_id);
        let pushed = snapshot.saved_incoming(conn)?;
        let full_resync: HashSet<&str> = request.tables_for_full_resync.iter().map(String::as_str).collect();
        let mut total = 0u64;

        for model in models {
            let table = model.table_name();
            let since = if full_resync.contains(table) {
                SyncTick::FULL_RESYNC
            } else {
                request.since
            };

            let changes: Vec<SyncChange> = model
                .changed_since(conn, since)?
                .into_iter()
                .filter(|record| !is_echo(&pushed, table, record))
                .map(|record| {
                    let mut change = record.to_change(table);
                    change.data = model.sanitize(change.data);
                    change
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            total += snapshot.insert(conn, SnapshotDirection::Outgoing, &changes)? as u64;
        }

        conn.execute(
            "UPDATE sync_sessions SET pull_until = ?1 WHERE id = ?2",
            params![pull_until, session_id.as_str()],
        )?;
        Ok(total)
    }
}

/// Whether `record` is exactly what this session pushed and nothing changed since.
fn is_echo(pushed: &HashMap<(String, String), SnapshotRecord>, table: &str, record: &StoredRecord) -> bool {
    let Some(staged) = pushed.get(&(table.to_string(), record.id.clone())) else {
        return false;
    };
    if staged.saved_at_sync_tick != Some(record.updated_at_sync_tick) {
        return false;
    }
    // A merge may have kept some of central's values; those must go back.
    match StoredRecord::from_data(&staged.change.data) {
        Ok(sent) => sent.fields == record.fields && staged.change.is_deleted == record.is_deleted(),
        Err(_) => false,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn store_pushed_changelog(conn: &Connection, session_id: &SessionId) -> Result<usize> {
    let snapshot = SnapshotStore::for_session(session_id);
    let mut after = 0;
    let mut stored = 0;
    loop {
        let page = snapshot.find_page(conn, SnapshotDirection::Incoming, after, 1_000)?;
        let Some(last) = page.last() else {
            break;
        };
        after = last.id;
        let entries: Vec<_> = page.into_iter().flat_map(|r| r.change.changelog).collect();
        stored += changelog::insert(conn, &entries)?;
    }
    Ok(stored)
}

#[async_trait]
impl CentralPeer for LocalCentral {
    fn name(&self) -> &str {
        "local-central"
    }

    async fn start_session(&self, request: StartSessionRequest) -> Result<StartSessionResponse> {
        let _admission = self.admission.lock().await;
        self.purge_lapsed_sessions().await?;

        let active: i64 = self
            .db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sync_sessions WHERE status = 'active'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await?;
        if active as usize >= self.config.session_limit(request.urgent) {
            info!(active, urgent = request.urgent, "Session request queued");
            return Ok(StartSessionResponse::queued());
        }

        let (tick, _) = self.clock.tick_tock().await?;
        let session_id = SessionId::generate();
        let snapshot = SnapshotStore::for_session(&session_id);
        let id = session_id.as_str().to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO sync_sessions (id, status, started_at_tick, started_at, last_connection_at)
                     VALUES (?1, 'active', ?2, ?3, ?4)",
                    params![id, tick, Utc::now().to_rfc3339(), now_ms()],
                )?;
                snapshot.create(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(
            session_id = %session_id,
            started_at_tick = %tick,
            urgent = request.urgent,
            last_synced_tick = %request.last_synced_tick,
            "Session started"
        );
        Ok(StartSessionResponse::started(session_id, tick))
    }

    async fn push(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()> {
        self.add_incoming_changes(session_id, changes).await
    }

    async fn complete_push(&self, session_id: &SessionId, tables_to_include: Vec<String>) -> Result<()> {
        let row = self.active_session(session_id).await?;
        if row.push_status != PushStatus::Pending {
            return Ok(());
        }
        self.set_push_status(session_id, PushStatus::Persisting, None).await?;

        let this = self.clone();
        let session = session_id.clone();
        tokio::spawn(async move {
            let (status, message) = match this.persist_push(&session, tables_to_include).await {
                Ok(()) => (PushStatus::Complete, None),
                Err(e) => {
                    error!(session_id = %session, error = %e, "Persisting pushed changes failed");
                    (PushStatus::Failed, Some(e.to_string()))
                }
            };
            if let Err(e) = this.set_push_status(&session, status, message).await {
                warn!(session_id = %session, error = %e, "Failed to record push status");
            }
        });
        Ok(())
    }

    async fn is_push_complete(&self, session_id: &SessionId) -> Result<bool> {
        let row = self
            .session(session_id)
            .await?
            .ok_or_else(|| Error::problem(Some(404), format!("session {} not found", session_id)))?;
        match row.push_status {
            PushStatus::Complete => Ok(true),
            PushStatus::Failed => Err(Error::problem(
                Some(500),
                row.error
                    .unwrap_or_else(|| "persisting pushed changes failed".to_string()),
            )),
            PushStatus::Pending | PushStatus::Persisting => Ok(false),
        }
    }

    async fn initiate_pull(&self, session_id: &SessionId, request: PullRequest) -> Result<PullInitiation> {
        self.active_session(session_id).await?;
        let (pull_until, _) = self.clock.tick_tock().await?;

        let models: Vec<Arc<dyn SyncModel>> = self
            .registry
            .models_for_pull()
            .into_iter()
            .filter(|m| request.tables_to_include.iter().any(|t| t == m.table_name()))
            .collect();
        let session = session_id.clone();
        let total_to_pull = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let total = Self::snapshot_for_pull(&tx, &session, &models, &request, pull_until)?;
                tx.commit()?;
                Ok(total)
            })
            .await?;

        info!(session_id = %session_id, total_to_pull, pull_until = %pull_until, "Pull snapshot ready");
        Ok(PullInitiation {
            total_to_pull,
            pull_until,
        })
    }

    async fn pull_page(&self, session_id: &SessionId, cursor: PullCursor, limit: usize) -> Result<Vec<PulledChange>> {
        self.active_session(session_id).await?;
        let snapshot = SnapshotStore::for_session(session_id);
        let after = cursor.last_seen().unwrap_or(0);
        let page = self
            .db
            .call(move |conn| snapshot.find_page(conn, SnapshotDirection::Outgoing, after, limit))
            .await?;

        Ok(page
            .into_iter()
            .map(|record| PulledChange {
                id: record.id,
                sort_order: self
                    .registry
                    .get(&record.change.record_type)
                    .map_or(0, |m| m.dependency_order()),
                change: record.change,
            })
            .collect())
    }

    fn supports_streaming(&self) -> bool {
        self.config.streaming
    }

    async fn pull_stream(&self, session_id: &SessionId, cursor: PullCursor) -> Result<PullStream> {
        self.active_session(session_id).await?;
        let this = self.clone();
        let session = session_id.clone();
        let page_size = self.config.stream_page_size.max(1);

        let messages = stream::try_unfold(Some(cursor), move |cursor| {
            let this = this.clone();
            let session = session.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok(None);
                };
                let page = this.pull_page(&session, cursor, page_size).await?;
                if page.is_empty() {
                    return Ok(Some((vec![StreamMessage::End], None)));
                }
                let next = page.iter().fold(cursor, |c, p| c.advance_past(p));
                let batch: Vec<StreamMessage> = page.into_iter().map(StreamMessage::PullChange).collect();
                Ok::<_, Error>(Some((batch, Some(next))))
            }
        })
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, Error>)))
        .try_flatten();

        Ok(messages.boxed())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.close_session(session_id, SessionStatus::Ended, None).await?;
        info!(session_id = %session_id, "Session ended");
        Ok(())
    }

    async fn mark_session_errored(&self, session_id: &SessionId, message: &str) -> Result<()> {
        self.close_session(session_id, SessionStatus::Errored, Some(message.to_string()))
            .await?;
        warn!(session_id = %session_id, error = %message, "Session marked errored");
        Ok(())
    }
}
