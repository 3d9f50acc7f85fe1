//! Session-scoped staging of changes on their way in or out.
//!
//! Each session gets its own table. Records staged for push are copied here
//! in one transaction so the push sees a point-in-time view; pulled records
//! are staged here before being applied in one pass.

use std::collections::HashMap;
use std::fmt;

use rusqlite::{params, Connection};
use tracing::debug;

use edgesync_common::{ChangeLogEntry, Result, SessionId, SyncChange, SyncTick};

use crate::model::quote_ident;

const TABLE_PREFIX: &str = "sync_snapshot_";

/// Which way a staged change is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotDirection {
    Incoming,
    Outgoing,
}

impl SnapshotDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for SnapshotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change as staged in a snapshot table.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    /// Insertion order within the snapshot, used as a paging cursor.
    pub id: i64,
    pub change: SyncChange,
    /// Tick at which the change was written into the model table, if it was.
    pub saved_at_sync_tick: Option<SyncTick>,
}

/// Handle on one session's snapshot table.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    table: String,
}

impl SnapshotStore {
    /// Snapshot table for a session.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            table: quote_ident(&format!("{}{}", TABLE_PREFIX, session_id.to_identifier())),
        }
    }

    /// Create the table if it does not exist.
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                direction TEXT NOT NULL,
                record_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                is_deleted INTEGER NOT NULL,
                data TEXT NOT NULL,
                changelog TEXT,
                saved_at_sync_tick INTEGER
            );
            "#,
            table = self.table
        ))?;
        Ok(())
    }

    /// Drop the table. Missing tables are ignored.
    pub fn drop(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table))?;
        Ok(())
    }

    /// Drop every snapshot table left behind by earlier sessions.
    ///
    /// Returns how many tables were dropped.
    pub fn drop_all(conn: &Connection) -> Result<usize> {
        let names: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB ?1",
            )?;
            let rows = stmt.query_map([format!("{}*", TABLE_PREFIX)], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for name in &names {
            debug!(table = %name, "Dropping stale snapshot table");
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
        }
        Ok(names.len())
    }

    /// Stage changes. Returns how many were written.
    pub fn insert(
        &self,
        conn: &Connection,
        direction: SnapshotDirection,
        changes: &[SyncChange],
    ) -> Result<usize> {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (direction, record_type, record_id, is_deleted, data, changelog)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.table
        ))?;
        for change in changes {
            let changelog = if change.changelog.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&change.changelog)?)
            };
            stmt.execute(params![
                direction.as_str(),
                change.record_type,
                change.record_id,
                change.is_deleted,
                serde_json::to_string(&change.data)?,
                changelog,
            ])?;
        }
        Ok(changes.len())
    }

    /// Up to `limit` changes with an id above `after_id`, in insertion order.
    pub fn find_page(
        &self,
        conn: &Connection,
        direction: SnapshotDirection,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>> {
        self.query(
            conn,
            &format!(
                "WHERE direction = ?1 AND id > ?2 ORDER BY id LIMIT {}",
                limit
            ),
            params![direction.as_str(), after_id],
        )
    }

    /// Like [`find_page`](Self::find_page), restricted to one record type.
    pub fn find_page_for_type(
        &self,
        conn: &Connection,
        direction: SnapshotDirection,
        record_type: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>> {
        self.query(
            conn,
            &format!(
                "WHERE direction = ?1 AND record_type = ?2 AND id > ?3 ORDER BY id LIMIT {}",
                limit
            ),
            params![direction.as_str(), record_type, after_id],
        )
    }

    /// Record the tick at which a record type's changes were written.
    pub fn mark_saved(
        &self,
        conn: &Connection,
        direction: SnapshotDirection,
        record_type: &str,
        tick: SyncTick,
    ) -> Result<usize> {
        Ok(conn.execute(
            &format!(
                "UPDATE {} SET saved_at_sync_tick = ?1 WHERE direction = ?2 AND record_type = ?3",
                self.table
            ),
            params![tick, direction.as_str(), record_type],
        )?)
    }

    /// The saved incoming changes, keyed by `(record_type, record_id)`.
    ///
    /// When a record was staged more than once the latest copy is kept.
    pub fn saved_incoming(&self, conn: &Connection) -> Result<HashMap<(String, String), SnapshotRecord>> {
        let records = self.query(
            conn,
            "WHERE direction = 'incoming' AND saved_at_sync_tick IS NOT NULL ORDER BY id",
            [],
        )?;
        Ok(records
            .into_iter()
            .map(|r| ((r.change.record_type.clone(), r.change.record_id.clone()), r))
            .collect())
    }

    fn query(
        &self,
        conn: &Connection,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, record_type, record_id, is_deleted, data, changelog, saved_at_sync_tick
             FROM {} {}",
            self.table, clause
        ))?;
        let raw = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<SyncTick>>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, record_type, record_id, is_deleted, data, changelog, saved)| {
                let changelog: Vec<ChangeLogEntry> = match changelog {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Vec::new(),
                };
                let mut change =
                    SyncChange::new(record_type, record_id, serde_json::from_str(&data)?, is_deleted);
                change.changelog = changelog;
                Ok(SnapshotRecord {
                    id,
                    change,
                    saved_at_sync_tick: saved,
                })
            })
            .collect()
    }
}
