//! Durable key/value facts, chiefly the sync tick cursors.

use rusqlite::{params, Connection, OptionalExtension};

use edgesync_common::{Error, Result, SyncTick};

/// Schema for the default fact table.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS local_system_facts (
    key TEXT PRIMARY KEY,
    value TEXT
);
"#;

/// Access to the tick facts a node keeps.
///
/// Every method takes the connection to run on, which lets callers fold a
/// fact update into a transaction they already hold (a `Transaction`
/// dereferences to a `Connection`).
pub trait TickStore: Send + Sync {
    /// Read a raw fact value.
    fn get_value(&self, conn: &Connection, key: &str) -> Result<Option<String>>;

    /// Write a raw fact value, replacing any previous one.
    fn set_value(&self, conn: &Connection, key: &str, value: Option<&str>) -> Result<()>;

    /// Read a fact as a tick.
    ///
    /// # Errors
    /// - The stored value is not an integer
    fn get(&self, conn: &Connection, key: &str) -> Result<Option<SyncTick>> {
        match self.get_value(conn, key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(|v| Some(SyncTick::new(v)))
                .map_err(|_| {
                    Error::InvalidInput(format!("Fact '{}' is not a tick: '{}'", key, raw))
                }),
        }
    }

    /// Write a tick fact.
    fn set(&self, conn: &Connection, key: &str, tick: SyncTick) -> Result<()> {
        self.set_value(conn, key, Some(&tick.value().to_string()))
    }

    /// Replace `key` with `new` only if it currently holds `expected`.
    ///
    /// Returns whether the swap happened. Callers must run this inside a
    /// transaction for it to be atomic against other writers.
    fn compare_and_set(
        &self,
        conn: &Connection,
        key: &str,
        expected: Option<SyncTick>,
        new: SyncTick,
    ) -> Result<bool> {
        if self.get(conn, key)? != expected {
            return Ok(false);
        }
        self.set(conn, key, new)?;
        Ok(true)
    }

    /// Add `by` to a tick fact, treating a missing fact as zero.
    ///
    /// Returns the new value.
    fn increment(&self, conn: &Connection, key: &str, by: i64) -> Result<SyncTick> {
        let current = self.get(conn, key)?.unwrap_or(SyncTick::new(0));
        let next = current.advance(by);
        self.set(conn, key, next)?;
        Ok(next)
    }
}

/// The `local_system_facts` table every node carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSystemFacts;

impl TickStore for LocalSystemFacts {
    fn get_value(&self, conn: &Connection, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                "SELECT value FROM local_system_facts WHERE key = ?1",
                [key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn set_value(&self, conn: &Connection, key: &str, value: Option<&str>) -> Result<()> {
        conn.execute(
            "INSERT INTO local_system_facts (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
