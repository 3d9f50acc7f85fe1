//! Audit trail of local writes, shipped alongside pushed records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use uuid::Uuid;

use edgesync_common::{ChangeLogEntry, Result, SyncTick};

use crate::model::StoredRecord;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS logs_changes (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    record_data TEXT NOT NULL,
    updated_at_sync_tick INTEGER NOT NULL,
    logged_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_changes_record
    ON logs_changes(table_name, record_id, updated_at_sync_tick);
"#;

/// Append an entry describing `record` as just written.
pub fn append(conn: &Connection, table_name: &str, record: &StoredRecord) -> Result<ChangeLogEntry> {
    let entry = ChangeLogEntry {
        id: Uuid::new_v4().to_string(),
        table_name: table_name.to_string(),
        record_id: record.id.clone(),
        record_data: Value::Object(record.to_data()),
        updated_at_sync_tick: record.updated_at_sync_tick,
        logged_at: Utc::now(),
    };
    insert(conn, &[entry.clone()])?;
    Ok(entry)
}

/// Store entries received from a peer. Entries already present are skipped.
pub fn insert(conn: &Connection, entries: &[ChangeLogEntry]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO logs_changes
         (id, table_name, record_id, record_data, updated_at_sync_tick, logged_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut inserted = 0;
    for entry in entries {
        inserted += stmt.execute(params![
            entry.id,
            entry.table_name,
            entry.record_id,
            serde_json::to_string(&entry.record_data)?,
            entry.updated_at_sync_tick,
            entry.logged_at.to_rfc3339(),
        ])?;
    }
    Ok(inserted)
}

/// Entries for the given records of one table with a tick above `min_tick`,
/// grouped by record id and ordered oldest first.
pub fn entries_since(
    conn: &Connection,
    table_name: &str,
    record_ids: &[String],
    min_tick: SyncTick,
) -> Result<HashMap<String, Vec<ChangeLogEntry>>> {
    let mut grouped: HashMap<String, Vec<ChangeLogEntry>> = HashMap::new();
    if record_ids.is_empty() {
        return Ok(grouped);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT id, table_name, record_id, record_data, updated_at_sync_tick, logged_at
         FROM logs_changes
         WHERE table_name = ?1
           AND record_id IN (SELECT value FROM json_each(?2))
           AND updated_at_sync_tick > ?3
         ORDER BY updated_at_sync_tick, logged_at",
    )?;
    let rows = stmt
        .query_map(
            params![table_name, serde_json::to_string(record_ids)?, min_tick],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, SyncTick>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (id, table_name, record_id, data, tick, logged_at) in rows {
        let logged_at = DateTime::parse_from_rfc3339(&logged_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| edgesync_common::Error::Serialization(e.to_string()))?;
        grouped.entry(record_id.clone()).or_default().push(ChangeLogEntry {
            id,
            table_name,
            record_id,
            record_data: serde_json::from_str(&data)?,
            updated_at_sync_tick: tick,
            logged_at,
        });
    }
    Ok(grouped)
}

/// Total number of entries, for diagnostics and tests.
pub fn count(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM logs_changes", [], |row| row.get(0))?;
    Ok(n as usize)
}
