//! Shared handle on a node's SQLite database.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info};

use edgesync_common::{facts, Error, Result, SyncTick};

use crate::changelog;
use crate::facts::{LocalSystemFacts, TickStore};
use crate::model::{StoredRecord, SyncModel};
use crate::pending::PendingEdits;
use crate::registry::ModelRegistry;

/// Tick used for local writes before the first sync has set one.
pub const INITIAL_SYNC_TICK: SyncTick = SyncTick::new(0);

/// A node's database: one connection, its tick facts and its in-flight edits.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    facts: Arc<dyn TickStore>,
    pending: PendingEdits,
}

impl Database {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let db = Self::from_connection(conn)?;
        info!(path = %path.as_ref().display(), "Database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(crate::facts::SCHEMA)?;
        conn.execute_batch(changelog::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            facts: Arc::new(LocalSystemFacts),
            pending: PendingEdits::new(),
        })
    }

    /// The fact store used for tick cursors.
    pub fn facts(&self) -> Arc<dyn TickStore> {
        Arc::clone(&self.facts)
    }

    /// Edits stamped with a tick but not committed yet.
    pub fn pending_edits(&self) -> &PendingEdits {
        &self.pending
    }

    /// Run a closure against the connection on the blocking thread pool.
    ///
    /// The connection is locked for the whole closure, so anything the closure
    /// does inside a transaction is isolated from other callers.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Internal("database lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("database task failed: {}", e)))?
    }

    /// Create the tables of every registered model.
    pub async fn ensure_tables(&self, registry: &ModelRegistry) -> Result<()> {
        let models: Vec<_> = registry.ordered().cloned().collect();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for model in &models {
                model.ensure_table(&tx)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Read a tick fact.
    pub async fn get_fact(&self, key: &'static str) -> Result<Option<SyncTick>> {
        let facts = self.facts();
        self.call(move |conn| facts.get(conn, key)).await
    }

    /// Write a tick fact.
    pub async fn set_fact(&self, key: &'static str, tick: SyncTick) -> Result<()> {
        let facts = self.facts();
        self.call(move |conn| facts.set(conn, key, tick)).await
    }

    /// Create or overwrite a record as a local edit.
    ///
    /// The record is stamped with the current sync tick, its per-field ticks
    /// are advanced for the fields that changed and a change log entry is
    /// written, all in one transaction.
    pub async fn write_local(
        &self,
        model: Arc<dyn SyncModel>,
        id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Result<StoredRecord> {
        let id = id.into();
        let facts = self.facts();
        let pending = self.pending.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let tick = facts
                .get(&tx, facts::CURRENT_SYNC_TICK)?
                .unwrap_or(INITIAL_SYNC_TICK);
            let _edit = pending.begin(tick);

            let existing = model.find_by_ids(&tx, &[id.clone()])?.pop();
            let record = StoredRecord::local_write(existing.as_ref(), id, fields, tick);
            match existing {
                Some(_) => {
                    model.update(&tx, &[record.clone()])?;
                    model.restore(&tx, &[record.id.clone()])?;
                }
                None => model.create(&tx, &[record.clone()])?,
            }
            changelog::append(&tx, model.table_name(), &record)?;
            tx.commit()?;

            debug!(table = %model.table_name(), id = %record.id, tick = %tick, "Local write");
            Ok(record)
        })
        .await
    }

    /// Soft-delete a record as a local edit.
    ///
    /// # Errors
    /// - The record does not exist
    pub async fn delete_local(&self, model: Arc<dyn SyncModel>, id: impl Into<String>) -> Result<StoredRecord> {
        let id = id.into();
        let facts = self.facts();
        let pending = self.pending.clone();

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let tick = facts
                .get(&tx, facts::CURRENT_SYNC_TICK)?
                .unwrap_or(INITIAL_SYNC_TICK);
            let _edit = pending.begin(tick);

            let mut record = model
                .find_by_ids(&tx, &[id.clone()])?
                .pop()
                .ok_or_else(|| Error::NotFound(format!("{}/{}", model.table_name(), id)))?;
            record.updated_at_sync_tick = tick;
            record.deleted_at = Some(Utc::now().to_rfc3339());
            model.update(&tx, &[record.clone()])?;
            model.soft_delete(&tx, &[record.clone()])?;
            changelog::append(&tx, model.table_name(), &record)?;
            tx.commit()?;

            debug!(table = %model.table_name(), id = %record.id, tick = %tick, "Local delete");
            Ok(record)
        })
        .await
    }

    /// Load one record by id, soft-deleted or not.
    pub async fn find(&self, model: Arc<dyn SyncModel>, id: impl Into<String>) -> Result<Option<StoredRecord>> {
        let id = id.into();
        self.call(move |conn| Ok(model.find_by_ids(conn, &[id])?.pop())).await
    }
}
