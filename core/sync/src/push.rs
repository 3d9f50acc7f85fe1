//! Push phase: snapshot local changes and upload them to central.

use std::sync::Arc;

use tracing::{debug, info};

use edgesync_common::{facts, Result, SessionId, SyncChange, SyncTick};
use edgesync_peer::{CentralPeer, Poller};
use edgesync_store::{changelog, Database, ModelRegistry, SnapshotDirection, SnapshotStore, SyncModel};

use crate::clock::TickClock;
use crate::config::PushConfig;

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Records uploaded.
    pub pushed: usize,
    /// Exclusive lower bound of the pushed ticks.
    pub push_since: SyncTick,
    /// Inclusive upper bound of the pushed ticks, now the push cursor.
    pub pushed_up_to: SyncTick,
}

/// Sends a facility's local changes to central.
#[derive(Clone)]
pub struct Pusher {
    db: Database,
    registry: ModelRegistry,
    clock: TickClock,
    config: PushConfig,
}

impl Pusher {
    pub fn new(db: Database, registry: ModelRegistry, config: PushConfig) -> Self {
        let clock = TickClock::new(db.clone());
        Self {
            db,
            registry,
            clock,
            config,
        }
    }

    /// Push every local change since the last successful push.
    ///
    /// The current tick is first moved to `started_at_tick`, so writes that
    /// begin afterwards carry a tick outside this push and go with the next
    /// one. Writes still in flight at the old tick are waited for.
    ///
    /// The push cursor only advances once central reports the changes
    /// persisted, so a failed push is repeated in full by the next session.
    pub async fn push(
        &self,
        peer: &dyn CentralPeer,
        session_id: &SessionId,
        started_at_tick: SyncTick,
    ) -> Result<PushOutcome> {
        let pushed_up_to = self.clock.bump_current(started_at_tick).await?;
        self.db.pending_edits().wait_for(pushed_up_to).await;

        let push_since = self
            .clock
            .get(facts::LAST_SUCCESSFUL_SYNC_PUSH)
            .await?
            .unwrap_or(SyncTick::FULL_RESYNC);

        debug!(
            session_id = %session_id,
            push_since = %push_since,
            pushed_up_to = %pushed_up_to,
            "Snapshotting outgoing changes"
        );

        let models = self.registry.models_for_push();
        let snapshot = SnapshotStore::for_session(session_id);
        let pushed = self
            .snapshot_outgoing(&snapshot, models.clone(), push_since, pushed_up_to)
            .await?;
        let total: usize = pushed.iter().map(|(_, ids)| ids.len()).sum();

        if total > 0 {
            self.upload(peer, session_id, &snapshot).await?;

            let tables: Vec<String> = models.iter().map(|m| m.table_name().to_string()).collect();
            peer.complete_push(session_id, tables).await?;

            Poller::new(self.config.completion_poll.clone())
                .until_ready("push completion", || peer.is_push_complete(session_id))
                .await?;

            self.delete_pushed(pushed).await?;
        }

        let cursor = self
            .clock
            .advance_cursor(facts::LAST_SUCCESSFUL_SYNC_PUSH, pushed_up_to)
            .await?;

        info!(session_id = %session_id, pushed = total, cursor = %cursor, "Push complete");
        Ok(PushOutcome {
            pushed: total,
            push_since,
            pushed_up_to,
        })
    }

    /// Copy every change in `(since, up_to]` into the outgoing snapshot.
    ///
    /// Returns the pushed ids of models that are deleted after pushing.
    async fn snapshot_outgoing(
        &self,
        snapshot: &SnapshotStore,
        models: Vec<Arc<dyn SyncModel>>,
        since: SyncTick,
        up_to: SyncTick,
    ) -> Result<Vec<(Arc<dyn SyncModel>, Vec<String>)>> {
        let snapshot = snapshot.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                snapshot.create(&tx)?;
                let mut pushed = Vec::new();

                for model in models {
                    let table = model.table_name().to_string();
                    let records: Vec<_> = model
                        .changed_since(&tx, since)?
                        .into_iter()
                        .filter(|r| r.updated_at_sync_tick <= up_to)
                        .collect();
                    if records.is_empty() {
                        continue;
                    }

                    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
                    let mut history = changelog::entries_since(&tx, &table, &ids, since)?;

                    let changes: Vec<SyncChange> = records
                        .iter()
                        .map(|record| {
                            let mut change = record.to_change(&table);
                            change.data = model.sanitize(change.data);
                            change.changelog = history.remove(&record.id).unwrap_or_default();
                            change
                        })
                        .collect();
                    snapshot.insert(&tx, SnapshotDirection::Outgoing, &changes)?;
                    debug!(model = %table, count = changes.len(), "Snapshotted outgoing");

                    pushed.push((model, ids));
                }

                tx.commit()?;
                Ok(pushed)
            })
            .await
    }

    async fn upload(&self, peer: &dyn CentralPeer, session_id: &SessionId, snapshot: &SnapshotStore) -> Result<()> {
        let chunk_size = self.config.chunk_size.max(1);
        let mut after = 0;
        let mut uploaded = 0;

        loop {
            let page = {
                let snapshot = snapshot.clone();
                self.db
                    .call(move |conn| {
                        snapshot.find_page(conn, SnapshotDirection::Outgoing, after, chunk_size)
                    })
                    .await?
            };
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            uploaded += page.len();

            let changes = page.into_iter().map(|r| r.change).collect();
            peer.push(session_id, changes).await?;
            debug!(session_id = %session_id, uploaded, "Uploaded chunk");
        }

        Ok(())
    }

    async fn delete_pushed(&self, pushed: Vec<(Arc<dyn SyncModel>, Vec<String>)>) -> Result<()> {
        let pushed: Vec<_> = pushed
            .into_iter()
            .filter(|(model, _)| model.push_then_delete())
            .collect();
        if pushed.is_empty() {
            return Ok(());
        }

        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (model, ids) in &pushed {
                    let deleted = model.hard_delete(&tx, ids)?;
                    debug!(model = %model.table_name(), deleted, "Deleted pushed records");
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}
