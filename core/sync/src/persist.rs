//! Applying staged incoming changes to the model tables.

use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, trace};

use edgesync_common::{Error, Result, SessionId, SyncTick, SYNC_TICK_FLAG_FROM_CENTRAL};
use edgesync_store::{Database, SnapshotDirection, SnapshotRecord, SnapshotStore, StoredRecord, SyncModel};

use crate::config::PersistConfig;
use crate::merge::ConflictResolver;

/// How a batch of incoming changes is applied.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Merge updates against existing rows instead of trusting them.
    pub is_central: bool,
    /// Tick written onto every saved record.
    pub stamp_tick: SyncTick,
    pub config: PersistConfig,
}

impl PersistOptions {
    /// Options for a facility applying what it pulled from central.
    pub fn facility(config: PersistConfig) -> Self {
        Self {
            is_central: false,
            stamp_tick: SYNC_TICK_FLAG_FROM_CENTRAL,
            config,
        }
    }

    /// Options for central applying what a facility pushed.
    pub fn central(tock: SyncTick, config: PersistConfig) -> Self {
        Self {
            is_central: true,
            stamp_tick: tock,
            config,
        }
    }
}

/// Counts of what an apply did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub restored: usize,
}

impl SaveStats {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.restored
    }
}

impl AddAssign for SaveStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.restored += other.restored;
    }
}

/// Writes a session's incoming snapshot into the model tables.
#[derive(Clone)]
pub struct Persister {
    resolver: Arc<dyn ConflictResolver>,
}

impl Persister {
    /// Create a persister using `resolver` for central-side merges.
    pub fn new(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self { resolver }
    }

    /// Apply every staged incoming change of the session, model by model.
    ///
    /// `models` must be in dependency order. Each batch of at most
    /// `batch_size` changes of one model is applied in its own transaction,
    /// with the configured pause taken between batches while the database
    /// is free for other work. `finish` runs inside the transaction of the
    /// last batch, so whatever it records (a cursor, an audit trail) commits
    /// together with the final writes. With nothing staged it runs alone.
    ///
    /// # Errors
    /// - A staged record cannot be decoded
    /// - A write fails, e.g. on a foreign key; batches already committed
    ///   stay applied and `finish` does not run
    pub async fn save_incoming_changes<F, T>(
        &self,
        db: &Database,
        session_id: &SessionId,
        models: &[Arc<dyn SyncModel>],
        options: &PersistOptions,
        finish: F,
    ) -> Result<(SaveStats, T)>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pause = options.config.pause_between_batches();
        let mut finish = Some(finish);
        let mut finished = None;
        let mut stats = SaveStats::default();
        let mut batches = 0usize;

        for (index, model) in models.iter().enumerate() {
            let later: Vec<String> = models[index + 1..]
                .iter()
                .map(|m| m.table_name().to_string())
                .collect();
            let mut after = 0;
            let mut model_stats = SaveStats::default();

            loop {
                if batches > 0 && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                batches += 1;

                let batch = Batch {
                    persister: self.clone(),
                    snapshot: SnapshotStore::for_session(session_id),
                    model: model.clone(),
                    after,
                    later: later.clone(),
                    options: options.clone(),
                };
                let pending = finish.take();
                let (outcome, rest) = db.call(move |conn| batch.apply(conn, pending)).await?;
                finish = rest;
                if let Some(value) = outcome.finished {
                    finished = Some(value);
                }
                model_stats += outcome.stats;

                match outcome.last_id {
                    Some(id) if !outcome.model_done => after = id,
                    _ => break,
                }
            }

            if model_stats.total() > 0 {
                debug!(
                    session_id = %session_id,
                    model = %model.table_name(),
                    created = model_stats.created,
                    updated = model_stats.updated,
                    deleted = model_stats.deleted,
                    restored = model_stats.restored,
                    "Saved incoming changes"
                );
            }
            stats += model_stats;
        }

        let finished = match (finished, finish) {
            (Some(value), _) => value,
            (None, Some(finish)) => {
                db.call(move |conn| {
                    let tx = conn.transaction()?;
                    let value = finish(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })
                .await?
            }
            (None, None) => {
                return Err(Error::Internal("apply finished without running its final step".to_string()));
            }
        };

        Ok((stats, finished))
    }

    fn save_changes_for_model(
        &self,
        conn: &Connection,
        model: &dyn SyncModel,
        page: Vec<SnapshotRecord>,
        options: &PersistOptions,
    ) -> Result<SaveStats> {
        // Later copies of the same record supersede earlier ones.
        let mut incoming: BTreeMap<String, StoredRecord> = BTreeMap::new();
        for staged in page {
            let mut record = StoredRecord::from_data(&staged.change.data)?;
            record.updated_at_sync_tick = options.stamp_tick;
            record.deleted_at = match (staged.change.is_deleted, record.deleted_at.take()) {
                (false, _) => None,
                (true, Some(at)) => Some(at),
                (true, None) => Some(Utc::now().to_rfc3339()),
            };
            incoming.insert(record.id.clone(), record);
        }

        let ids: Vec<String> = incoming.keys().cloned().collect();
        let existing: HashMap<String, StoredRecord> = model
            .find_by_ids(conn, &ids)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        let mut restores = Vec::new();

        for (id, record) in incoming {
            let Some(current) = existing.get(&id) else {
                creates.push(record);
                continue;
            };
            let resolved = self.resolve(model, current, record, options);
            match (current.is_deleted(), resolved.is_deleted()) {
                (false, true) => deletes.push(resolved),
                (true, false) => restores.push(resolved),
                _ => updates.push(resolved),
            }
        }

        let workers = options.config.update_workers.max(1);
        let stats = SaveStats {
            created: creates.len(),
            updated: updates.len(),
            deleted: deletes.len(),
            restored: restores.len(),
        };

        if !creates.is_empty() {
            model.create(conn, &creates)?;
            // Inserted first so dependents can reference them, then tombstoned.
            let deleted_creates: Vec<StoredRecord> =
                creates.into_iter().filter(StoredRecord::is_deleted).collect();
            if !deleted_creates.is_empty() {
                model.soft_delete(conn, &deleted_creates)?;
            }
        }

        for chunk in updates.chunks(workers) {
            trace!(model = %model.table_name(), count = chunk.len(), "Updating chunk");
            model.update(conn, chunk)?;
        }

        for chunk in deletes.chunks(workers) {
            model.update(conn, chunk)?;
        }
        if !deletes.is_empty() {
            model.soft_delete(conn, &deletes)?;
        }

        if !restores.is_empty() {
            let restore_ids: Vec<String> = restores.iter().map(|r| r.id.clone()).collect();
            model.restore(conn, &restore_ids)?;
            for chunk in restores.chunks(workers) {
                model.update(conn, chunk)?;
            }
        }

        Ok(stats)
    }

    fn resolve(
        &self,
        model: &dyn SyncModel,
        existing: &StoredRecord,
        incoming: StoredRecord,
        options: &PersistOptions,
    ) -> StoredRecord {
        if !options.is_central {
            // Central already resolved what it serves.
            return keep_local_fields(model, existing, incoming);
        }
        let mut merged = self.resolver.merge(existing, &incoming);
        merged.updated_at_sync_tick = options.stamp_tick;
        merged
    }
}

/// Carry over the fields that never leave this node, which central cannot
/// send back.
fn keep_local_fields(model: &dyn SyncModel, existing: &StoredRecord, mut incoming: StoredRecord) -> StoredRecord {
    for field in &model.spec().excluded_fields {
        if let Some(value) = existing.fields.get(field) {
            incoming.fields.insert(field.clone(), value.clone());
        }
        if let Some(tick) = existing.updated_at_by_field.get(field) {
            incoming.updated_at_by_field.insert(field.clone(), *tick);
        }
    }
    incoming
}

/// One transaction's worth of work for [`Persister::save_incoming_changes`].
struct Batch {
    persister: Persister,
    snapshot: SnapshotStore,
    model: Arc<dyn SyncModel>,
    after: i64,
    /// Models still to be applied after this one.
    later: Vec<String>,
    options: PersistOptions,
}

struct BatchOutcome<T> {
    stats: SaveStats,
    last_id: Option<i64>,
    model_done: bool,
    finished: Option<T>,
}

impl Batch {
    fn apply<F, T>(self, conn: &mut Connection, finish: Option<F>) -> Result<(BatchOutcome<T>, Option<F>)>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let table = self.model.table_name();
        let batch_size = self.options.config.batch_size.max(1);
        let tx = conn.transaction()?;

        let page = self
            .snapshot
            .find_page_for_type(&tx, SnapshotDirection::Incoming, table, self.after, batch_size)?;
        let last_id = page.last().map(|r| r.id);
        let stats = if page.is_empty() {
            SaveStats::default()
        } else {
            self.persister
                .save_changes_for_model(&tx, self.model.as_ref(), page, &self.options)?
        };

        let model_done = match last_id {
            None => true,
            Some(id) => !self.has_incoming(&tx, table, id)?,
        };
        if model_done {
            self.snapshot
                .mark_saved(&tx, SnapshotDirection::Incoming, table, self.options.stamp_tick)?;
        }

        let mut all_done = model_done;
        for later in &self.later {
            if !all_done {
                break;
            }
            all_done = !self.has_incoming(&tx, later, 0)?;
        }

        let (finished, finish) = match finish {
            Some(finish) if all_done => (Some(finish(&*tx)?), None),
            other => (None, other),
        };
        tx.commit()?;

        Ok((
            BatchOutcome {
                stats,
                last_id,
                model_done,
                finished,
            },
            finish,
        ))
    }

    fn has_incoming(&self, conn: &Connection, table: &str, after: i64) -> Result<bool> {
        Ok(!self
            .snapshot
            .find_page_for_type(conn, SnapshotDirection::Incoming, table, after, 1)?
            .is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::FieldTickResolver;
    use edgesync_common::SyncChange;
    use edgesync_store::{Database, ModelRegistry, ModelSpec};
    use serde_json::{json, Value};

    fn change(record_type: &str, data: Value, is_deleted: bool) -> SyncChange {
        let data = data.as_object().cloned().unwrap();
        let id = data["id"].as_str().unwrap().to_string();
        SyncChange::new(record_type, id, data, is_deleted)
    }

    async fn setup() -> (Database, ModelRegistry, SessionId) {
        let db = Database::open_in_memory().unwrap();
        let registry = ModelRegistry::from_specs([
            ModelSpec::new("patients")
                .with_dependency_order(1)
                .with_excluded_field("localNotes"),
            ModelSpec::new("encounters")
                .with_dependency_order(2)
                .with_foreign_key("patientId", "patients"),
        ])
        .unwrap();
        db.ensure_tables(&registry).await.unwrap();
        let session = SessionId::new("persist-test").unwrap();
        let snapshot = SnapshotStore::for_session(&session);
        db.call(move |conn| snapshot.create(conn)).await.unwrap();
        (db, registry, session)
    }

    async fn stage(db: &Database, session: &SessionId, changes: Vec<SyncChange>) {
        let snapshot = SnapshotStore::for_session(session);
        db.call(move |conn| snapshot.insert(conn, SnapshotDirection::Incoming, &changes))
            .await
            .unwrap();
    }

    async fn apply(
        db: &Database,
        registry: &ModelRegistry,
        session: &SessionId,
        options: PersistOptions,
    ) -> Result<SaveStats> {
        let persister = Persister::new(Arc::new(FieldTickResolver));
        let models: Vec<_> = registry.ordered().cloned().collect();
        let (stats, ()) = persister
            .save_incoming_changes(db, session, &models, &options, |_| Ok(()))
            .await?;
        Ok(stats)
    }

    async fn find(db: &Database, registry: &ModelRegistry, table: &str, id: &str) -> Option<StoredRecord> {
        db.find(registry.get(table).unwrap().clone(), id).await.unwrap()
    }

    fn facility() -> PersistOptions {
        PersistOptions::facility(PersistConfig::default())
    }

    #[tokio::test]
    async fn test_create_then_reapply_is_idempotent() {
        let (db, registry, session) = setup().await;
        stage(&db, &session, vec![change("patients", json!({ "id": "P1", "name": "A" }), false)]).await;

        let first = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(first.created, 1);

        let second = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 1);

        let patients = registry.get("patients").unwrap().clone();
        assert_eq!(db.call(move |conn| patients.count(conn)).await.unwrap(), 1);

        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert_eq!(p1.fields["name"], json!("A"));
        assert_eq!(p1.updated_at_sync_tick, SYNC_TICK_FLAG_FROM_CENTRAL);
    }

    #[tokio::test]
    async fn test_children_before_parents_in_input() {
        let (db, registry, session) = setup().await;
        stage(
            &db,
            &session,
            vec![
                change("encounters", json!({ "id": "E1", "patientId": "P1" }), false),
                change("patients", json!({ "id": "P1" }), false),
            ],
        )
        .await;

        let stats = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(stats.created, 2);
        assert!(find(&db, &registry, "encounters", "E1").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_applies_final_fields_then_marks_deleted() {
        let (db, registry, session) = setup().await;
        let patients = registry.get("patients").unwrap().clone();
        db.write_local(patients, "P1", json!({ "name": "old" }).as_object().cloned().unwrap())
            .await
            .unwrap();

        stage(
            &db,
            &session,
            vec![change("patients", json!({ "id": "P1", "name": "final" }), true)],
        )
        .await;
        let stats = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(stats.deleted, 1);

        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert!(p1.is_deleted());
        assert_eq!(p1.fields["name"], json!("final"));
    }

    #[tokio::test]
    async fn test_restore_clears_marker_and_updates() {
        let (db, registry, session) = setup().await;
        let patients = registry.get("patients").unwrap().clone();
        db.write_local(patients.clone(), "P1", json!({ "name": "a" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        db.delete_local(patients, "P1").await.unwrap();

        stage(&db, &session, vec![change("patients", json!({ "id": "P1", "name": "b" }), false)]).await;
        let stats = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(stats.restored, 1);

        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert!(!p1.is_deleted());
        assert_eq!(p1.fields["name"], json!("b"));
    }

    #[tokio::test]
    async fn test_created_and_deleted_keeps_tombstone() {
        let (db, registry, session) = setup().await;
        stage(&db, &session, vec![change("patients", json!({ "id": "P9" }), true)]).await;

        let stats = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(stats.created, 1);
        assert!(find(&db, &registry, "patients", "P9").await.unwrap().is_deleted());

        // Reapplying the tombstone changes nothing.
        let again = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(again.updated, 1);
        assert!(find(&db, &registry, "patients", "P9").await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_one_batch() {
        let (db, registry, session) = setup().await;
        stage(
            &db,
            &session,
            vec![
                change("patients", json!({ "id": "P1", "name": "first" }), false),
                change("patients", json!({ "id": "P1", "name": "second" }), false),
            ],
        )
        .await;

        let stats = apply(&db, &registry, &session, facility()).await.unwrap();
        assert_eq!(stats.created, 1);
        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert_eq!(p1.fields["name"], json!("second"));
    }

    #[tokio::test]
    async fn test_central_merges_updates() {
        let (db, registry, session) = setup().await;
        let patients = registry.get("patients").unwrap().clone();
        db.set_fact(edgesync_common::facts::CURRENT_SYNC_TICK, SyncTick::new(10))
            .await
            .unwrap();
        db.write_local(
            patients,
            "P1",
            json!({ "name": "central", "sex": "f" }).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

        // The facility changed only "sex", at an older tick for "name".
        stage(
            &db,
            &session,
            vec![change(
                "patients",
                json!({
                    "id": "P1",
                    "name": "stale",
                    "sex": "x",
                    "updatedAtByField": { "name": 4, "sex": 12 }
                }),
                false,
            )],
        )
        .await;

        let options = PersistOptions::central(SyncTick::new(14), PersistConfig::default());
        apply(&db, &registry, &session, options).await.unwrap();

        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert_eq!(p1.fields["name"], json!("central"));
        assert_eq!(p1.fields["sex"], json!("x"));
        assert_eq!(p1.updated_at_sync_tick, SyncTick::new(14));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let (db, registry, session) = setup().await;
        stage(
            &db,
            &session,
            vec![
                change("patients", json!({ "id": "P1" }), false),
                change("encounters", json!({ "id": "E1", "patientId": "P1" }), false),
                change("encounters", json!({ "id": "E2", "patientId": "missing" }), false),
            ],
        )
        .await;

        let persister = Persister::new(Arc::new(FieldTickResolver));
        let models: Vec<_> = registry.ordered().cloned().collect();
        let result = persister
            .save_incoming_changes(&db, &session, &models, &facility(), |conn| {
                conn.execute_batch("CREATE TABLE finished (x INTEGER)")?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        // The patients batch committed, the failing encounters batch did not.
        assert!(find(&db, &registry, "patients", "P1").await.is_some());
        assert!(find(&db, &registry, "encounters", "E1").await.is_none());
        let finished: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'finished'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(finished, 0);
    }

    #[tokio::test]
    async fn test_final_step_commits_with_last_batch() {
        let (db, registry, session) = setup().await;
        let changes = (0..5)
            .map(|i| change("patients", json!({ "id": format!("P{}", i) }), false))
            .collect();
        stage(&db, &session, changes).await;

        let persister = Persister::new(Arc::new(FieldTickResolver));
        let models: Vec<_> = registry.ordered().cloned().collect();
        let options = PersistOptions::facility(PersistConfig::default().with_batch_size(2));
        let (stats, seen) = persister
            .save_incoming_changes(&db, &session, &models, &options, |conn| {
                let patients: i64 = conn.query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))?;
                Ok(patients)
            })
            .await
            .unwrap();

        assert_eq!(stats.created, 5);
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn test_final_step_runs_with_nothing_staged() {
        let (db, registry, session) = setup().await;
        let persister = Persister::new(Arc::new(FieldTickResolver));
        let models: Vec<_> = registry.ordered().cloned().collect();

        let (stats, value) = persister
            .save_incoming_changes(&db, &session, &models, &facility(), |_| Ok(7))
            .await
            .unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_database_is_free_between_batches() {
        let (db, registry, session) = setup().await;
        let changes = (0..3)
            .map(|i| change("patients", json!({ "id": format!("P{}", i) }), false))
            .collect();
        stage(&db, &session, changes).await;

        let mut config = PersistConfig::default().with_batch_size(1);
        config.pause_between_batches_ms = 150;
        let options = PersistOptions::facility(config);
        let apply_db = db.clone();
        let apply_registry = registry.clone();
        let apply_session = session.clone();
        let task =
            tokio::spawn(async move { apply(&apply_db, &apply_registry, &apply_session, options).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Readable while the apply is paused, and the first batch is already in.
        assert!(find(&db, &registry, "patients", "P0").await.is_some());
        assert!(!task.is_finished());

        assert_eq!(task.await.unwrap().unwrap().created, 3);
    }

    #[tokio::test]
    async fn test_pulled_record_keeps_local_only_fields() {
        let (db, registry, session) = setup().await;
        let patients = registry.get("patients").unwrap().clone();
        db.write_local(
            patients,
            "P1",
            json!({ "name": "Ada", "localNotes": "private" }).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

        stage(
            &db,
            &session,
            vec![change("patients", json!({ "id": "P1", "name": "Ada L" }), false)],
        )
        .await;
        apply(&db, &registry, &session, facility()).await.unwrap();

        let p1 = find(&db, &registry, "patients", "P1").await.unwrap();
        assert_eq!(p1.fields["name"], json!("Ada L"));
        assert_eq!(p1.fields["localNotes"], json!("private"));
        assert!(p1.updated_at_by_field.contains_key("localNotes"));
    }

    #[tokio::test]
    async fn test_small_batches_cover_everything() {
        let (db, registry, session) = setup().await;
        let changes = (0..25)
            .map(|i| change("patients", json!({ "id": format!("P{:02}", i) }), false))
            .collect();
        stage(&db, &session, changes).await;

        let options = PersistOptions::facility(
            PersistConfig::default().with_batch_size(7).with_update_workers(2),
        );
        let stats = apply(&db, &registry, &session, options).await.unwrap();
        assert_eq!(stats.created, 25);
    }
}
