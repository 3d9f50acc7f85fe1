//! Pull phase: download central's changes into the incoming snapshot.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use edgesync_common::{facts, Error, Result, SessionId, SyncChange, SyncTick, SYNC_TICK_FLAG_FROM_CENTRAL};
use edgesync_peer::{CentralPeer, PullCursor, PullRequest, PulledChange, StreamMessage};
use edgesync_store::{Database, ModelRegistry, SnapshotDirection, SnapshotStore};

use crate::config::{PageLimitConfig, PullConfig};

/// What a pull staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOutcome {
    pub total_pulled: u64,
    /// Tick central guarantees the session is caught up to once applied.
    pub pull_until: SyncTick,
}

/// Next page size given how long the last page of `current` records took.
///
/// Aims for pages that take `optimal_page_time_ms`, within `[min, max]`.
pub fn calculate_page_limit(config: &PageLimitConfig, current: usize, elapsed: Duration) -> usize {
    let max = config.max.max(config.min);
    let elapsed_ms = elapsed.as_millis();
    if elapsed_ms == 0 || current == 0 {
        return max;
    }
    let ms_per_record = elapsed_ms as f64 / current as f64;
    let next = (config.optimal_page_time_ms as f64 / ms_per_record).floor() as usize;
    next.clamp(config.min, max)
}

/// Parse the comma separated `tablesForFullResync` fact.
pub(crate) fn parse_table_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tags a pulled change so it is not pushed back until edited locally.
fn tag_from_central(pulled: PulledChange) -> SyncChange {
    let mut change = pulled.change;
    change.set_data_tick(SYNC_TICK_FLAG_FROM_CENTRAL);
    change
}

/// Downloads central's changes for a session.
#[derive(Clone)]
pub struct Puller {
    db: Database,
    registry: ModelRegistry,
    config: PullConfig,
}

impl Puller {
    pub fn new(db: Database, registry: ModelRegistry, config: PullConfig) -> Self {
        Self { db, registry, config }
    }

    /// Stage everything central has after `since` into the session's
    /// incoming snapshot.
    ///
    /// Nothing is applied and no cursor moves; the caller persists the
    /// staged changes and only then adopts [`PullOutcome::pull_until`].
    pub async fn pull(&self, peer: &dyn CentralPeer, session_id: &SessionId, since: SyncTick) -> Result<PullOutcome> {
        let snapshot = SnapshotStore::for_session(session_id);
        let tables_for_full_resync = {
            let snapshot = snapshot.clone();
            let store = self.db.facts();
            self.db
                .call(move |conn| {
                    snapshot.create(conn)?;
                    let raw = store.get_value(conn, facts::TABLES_FOR_FULL_RESYNC)?;
                    Ok(parse_table_list(raw.as_deref()))
                })
                .await?
        };

        let request = PullRequest {
            since,
            tables_to_include: self
                .registry
                .models_for_pull()
                .iter()
                .map(|m| m.table_name().to_string())
                .collect(),
            tables_for_full_resync,
        };
        let initiation = peer.initiate_pull(session_id, request).await?;
        info!(
            session_id = %session_id,
            since = %since,
            total_to_pull = initiation.total_to_pull,
            pull_until = %initiation.pull_until,
            "Pull initiated"
        );

        let total_pulled = if initiation.total_to_pull == 0 {
            0
        } else if peer.supports_streaming() {
            self.pull_streaming(peer, session_id, &snapshot).await?
        } else {
            self.pull_paged(peer, session_id, &snapshot, initiation.total_to_pull)
                .await?
        };

        if total_pulled < initiation.total_to_pull {
            warn!(
                session_id = %session_id,
                total_pulled,
                total_to_pull = initiation.total_to_pull,
                "Central served fewer changes than announced"
            );
        }

        Ok(PullOutcome {
            total_pulled,
            pull_until: initiation.pull_until,
        })
    }

    async fn pull_paged(
        &self,
        peer: &dyn CentralPeer,
        session_id: &SessionId,
        snapshot: &SnapshotStore,
        total_to_pull: u64,
    ) -> Result<u64> {
        let mut cursor = PullCursor::start();
        let mut limit = self.config.page.initial.max(1);
        let mut total = 0u64;

        while total < total_to_pull {
            let started = Instant::now();
            let page = peer.pull_page(session_id, cursor, limit).await?;
            let elapsed = started.elapsed();

            let mut changes = Vec::with_capacity(page.len());
            for pulled in page {
                if cursor.last_seen().is_some_and(|seen| pulled.id <= seen) {
                    continue;
                }
                cursor = cursor.advance_past(&pulled);
                changes.push(tag_from_central(pulled));
            }
            if changes.is_empty() {
                break;
            }

            total += changes.len() as u64;
            insert_batched(
                &self.db,
                snapshot,
                changes,
                self.config.persisted_cache_batch_size,
                self.config.pause_between_cache_batches(),
            )
            .await?;

            debug!(session_id = %session_id, total, limit, elapsed_ms = elapsed.as_millis() as u64, "Pulled page");
            limit = calculate_page_limit(&self.config.page, limit, elapsed);
        }

        Ok(total)
    }

    /// Read the stream while a separate task writes what was read.
    async fn pull_streaming(&self, peer: &dyn CentralPeer, session_id: &SessionId, snapshot: &SnapshotStore) -> Result<u64> {
        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity.max(1));
        let writer = tokio::spawn(write_batches(
            self.db.clone(),
            snapshot.clone(),
            rx,
            self.config.persisted_cache_batch_size,
            self.config.pause_between_cache_batches(),
        ));

        let read = self.read_stream(peer, session_id, &tx).await;
        drop(tx);
        let written = writer
            .await
            .map_err(|e| Error::Internal(format!("snapshot writer failed: {}", e)))?;

        // A writer failure explains a reader failure, not the other way round.
        let written = written?;
        let pulled = read?;
        debug!(session_id = %session_id, pulled, written, "Stream drained");
        Ok(pulled)
    }

    async fn read_stream(
        &self,
        peer: &dyn CentralPeer,
        session_id: &SessionId,
        tx: &mpsc::Sender<Vec<SyncChange>>,
    ) -> Result<u64> {
        let flush_at = self.config.stream_flush_batch_size.max(1);
        let mut state = StreamState {
            cursor: PullCursor::start(),
            buffer: Vec::with_capacity(flush_at),
            pulled: 0,
        };
        let mut reconnects = 0;

        loop {
            let outcome = state.consume(peer, session_id, tx, flush_at).await;
            let reason = match outcome {
                Ok(true) => break,
                Ok(false) => "stream closed before END".to_string(),
                Err(Error::Network(message)) => message,
                Err(e) => return Err(e),
            };

            if reconnects >= self.config.max_stream_reconnects {
                return Err(Error::Network(format!(
                    "pull stream failed after {} reconnects: {}",
                    reconnects, reason
                )));
            }
            reconnects += 1;
            warn!(
                session_id = %session_id,
                reconnects,
                resume_after = ?state.cursor.last_seen(),
                reason = %reason,
                "Reconnecting pull stream"
            );
        }

        state.flush(tx).await?;
        Ok(state.pulled)
    }
}

struct StreamState {
    cursor: PullCursor,
    buffer: Vec<SyncChange>,
    pulled: u64,
}

impl StreamState {
    /// Read one connection's worth of messages. Returns whether END arrived.
    async fn consume(
        &mut self,
        peer: &dyn CentralPeer,
        session_id: &SessionId,
        tx: &mpsc::Sender<Vec<SyncChange>>,
        flush_at: usize,
    ) -> Result<bool> {
        let mut stream = peer.pull_stream(session_id, self.cursor).await?;

        while let Some(message) = stream.next().await {
            match message? {
                StreamMessage::PullChange(pulled) => {
                    if self.cursor.last_seen().is_some_and(|seen| pulled.id <= seen) {
                        continue;
                    }
                    self.cursor = self.cursor.advance_past(&pulled);
                    self.buffer.push(tag_from_central(pulled));
                    self.pulled += 1;
                    if self.buffer.len() >= flush_at {
                        self.flush(tx).await?;
                    }
                }
                StreamMessage::End => return Ok(true),
            }
        }
        Ok(false)
    }

    async fn flush(&mut self, tx: &mpsc::Sender<Vec<SyncChange>>) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        tx.send(std::mem::take(&mut self.buffer))
            .await
            .map_err(|_| Error::Internal("snapshot writer stopped".to_string()))
    }
}

async fn write_batches(
    db: Database,
    snapshot: SnapshotStore,
    mut rx: mpsc::Receiver<Vec<SyncChange>>,
    batch_size: usize,
    pause: Duration,
) -> Result<usize> {
    let mut written = 0;
    while let Some(changes) = rx.recv().await {
        written += insert_batched(&db, &snapshot, changes, batch_size, pause).await?;
    }
    Ok(written)
}

/// Insert into the incoming snapshot in sub-batches, pausing between them.
async fn insert_batched(
    db: &Database,
    snapshot: &SnapshotStore,
    changes: Vec<SyncChange>,
    batch_size: usize,
    pause: Duration,
) -> Result<usize> {
    let mut written = 0;
    for (i, chunk) in changes.chunks(batch_size.max(1)).enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let chunk = chunk.to_vec();
        let snapshot = snapshot.clone();
        written += db
            .call(move |conn| snapshot.insert(conn, SnapshotDirection::Incoming, &chunk))
            .await?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, fields, node, start, FlakyStream, TestCentral};
    use serde_json::json;

    fn page_config() -> PageLimitConfig {
        PageLimitConfig {
            initial: 100,
            min: 10,
            max: 1000,
            optimal_page_time_ms: 2000,
        }
    }

    #[test]
    fn test_page_limit_scales_to_target_time() {
        let config = page_config();
        // 100 records in 1s: 10ms each, 2s fits 200.
        assert_eq!(calculate_page_limit(&config, 100, Duration::from_secs(1)), 200);
        // 100 records in 4s: 40ms each, 2s fits 50.
        assert_eq!(calculate_page_limit(&config, 100, Duration::from_secs(4)), 50);
    }

    #[test]
    fn test_page_limit_is_clamped() {
        let config = page_config();
        assert_eq!(calculate_page_limit(&config, 100, Duration::from_millis(1)), 1000);
        assert_eq!(calculate_page_limit(&config, 10, Duration::from_secs(60)), 10);
        assert_eq!(calculate_page_limit(&config, 100, Duration::ZERO), 1000);
    }

    #[test]
    fn test_parse_table_list() {
        assert!(parse_table_list(None).is_empty());
        assert_eq!(parse_table_list(Some(" patients, ,encounters")), vec!["patients", "encounters"]);
    }

    async fn staged(db: &Database, session: &SessionId) -> Vec<SyncChange> {
        let snapshot = SnapshotStore::for_session(session);
        db.call(move |conn| snapshot.find_page(conn, SnapshotDirection::Incoming, 0, 10_000))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.change)
            .collect()
    }

    async fn seed(central: &TestCentral, n: usize) {
        for i in 0..n {
            central
                .write("patients", &format!("P{:03}", i), fields(json!({ "n": i })))
                .await;
        }
    }

    #[tokio::test]
    async fn test_paged_pull_stages_tagged_changes() {
        let (db, registry) = node().await;
        let central = TestCentral::new().await;
        seed(&central, 25).await;

        let mut config = fast_config().pull;
        config.page.initial = 7;
        let puller = Puller::new(db.clone(), registry, config);
        let (session, _) = start(&central.peer).await;
        let outcome = puller
            .pull(&central.peer, &session, SyncTick::FULL_RESYNC)
            .await
            .unwrap();

        assert_eq!(outcome.total_pulled, 25);
        let changes = staged(&db, &session).await;
        assert_eq!(changes.len(), 25);
        assert!(changes
            .iter()
            .all(|c| c.data_tick() == Some(SYNC_TICK_FLAG_FROM_CENTRAL)));
    }

    #[tokio::test]
    async fn test_nothing_to_pull() {
        let (db, registry) = node().await;
        let central = TestCentral::new().await;
        let puller = Puller::new(db.clone(), registry, fast_config().pull);

        let (session, _) = start(&central.peer).await;
        let outcome = puller
            .pull(&central.peer, &session, SyncTick::FULL_RESYNC)
            .await
            .unwrap();
        assert_eq!(outcome.total_pulled, 0);
        assert!(outcome.pull_until > SyncTick::FULL_RESYNC);
    }

    #[tokio::test]
    async fn test_streaming_pull_resumes_after_drop() {
        let (db, registry) = node().await;
        let central = TestCentral::streaming().await;
        seed(&central, 30).await;

        // Cut the stream twice, each time after 8 messages.
        let peer = FlakyStream::new(central.peer.clone(), 8, 2);
        let config = fast_config().pull.with_stream_flush_batch_size(5);
        let puller = Puller::new(db.clone(), registry, config);
        let (session, _) = start(&peer).await;
        let outcome = puller.pull(&peer, &session, SyncTick::FULL_RESYNC).await.unwrap();

        assert_eq!(outcome.total_pulled, 30);
        let changes = staged(&db, &session).await;
        assert_eq!(changes.len(), 30);
        let mut ids: Vec<_> = changes.iter().map(|c| c.record_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 30);
    }

    #[tokio::test]
    async fn test_streaming_gives_up_after_reconnect_budget() {
        let (db, registry) = node().await;
        let central = TestCentral::streaming().await;
        seed(&central, 30).await;

        let peer = FlakyStream::new(central.peer.clone(), 2, 10);
        let config = fast_config().pull.with_max_stream_reconnects(1);
        let puller = Puller::new(db, registry, config);
        let (session, _) = start(&peer).await;

        let err = puller
            .pull(&peer, &session, SyncTick::FULL_RESYNC)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_full_resync_tables_are_sent_from_start() {
        let (db, registry) = node().await;
        let central = TestCentral::new().await;
        seed(&central, 3).await;
        let puller = Puller::new(db.clone(), registry, fast_config().pull);

        // Already caught up, except for the table flagged for full resync.
        let (session, tick) = start(&central.peer).await;
        let outcome = puller.pull(&central.peer, &session, tick).await.unwrap();
        assert_eq!(outcome.total_pulled, 0);

        let store = db.facts();
        db.call(move |conn| store.set_value(conn, facts::TABLES_FOR_FULL_RESYNC, Some("patients")))
            .await
            .unwrap();
        let (session, tick) = start(&central.peer).await;
        let outcome = puller.pull(&central.peer, &session, tick).await.unwrap();
        assert_eq!(outcome.total_pulled, 3);
    }
}
