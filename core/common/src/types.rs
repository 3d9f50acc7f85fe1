//! Common types used throughout the replication engine.

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of the durable facts kept in each node's fact table.
pub mod facts {
    /// Tick stamped onto new local writes.
    pub const CURRENT_SYNC_TICK: &str = "currentSyncTick";
    /// Tick up to which everything the peer has was durably applied here.
    pub const LAST_SUCCESSFUL_SYNC_PULL: &str = "lastSuccessfulSyncPull";
    /// Tick up to which everything this node owes the peer was delivered.
    pub const LAST_SUCCESSFUL_SYNC_PUSH: &str = "lastSuccessfulSyncPush";
    /// Comma separated table names to pull from the beginning of time.
    pub const TABLES_FOR_FULL_RESYNC: &str = "tablesForFullResync";
}

/// Tick stored on records received from the central node.
///
/// Records carrying it are never selected for push until they change
/// locally again.
pub const SYNC_TICK_FLAG_FROM_CENTRAL: SyncTick = SyncTick(-999);

/// A logical, strictly increasing timestamp used to order changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncTick(i64);

impl SyncTick {
    /// Cursor value meaning "nothing synced yet, start from the beginning".
    pub const FULL_RESYNC: Self = Self(-1);

    /// Create a tick from its raw value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn value(self) -> i64 {
        self.0
    }

    /// The tick `by` steps after this one.
    pub const fn advance(self, by: i64) -> Self {
        Self(self.0 + by)
    }

    /// Whether this tick marks a record as received from central.
    pub fn is_from_central(self) -> bool {
        self == SYNC_TICK_FLAG_FROM_CENTRAL
    }
}

impl Default for SyncTick {
    fn default() -> Self {
        Self::FULL_RESYNC
    }
}

impl fmt::Display for SyncTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SyncTick {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl ToSql for SyncTick {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for SyncTick {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

/// Identifier of a sync session, issued by the central node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a SessionId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "SessionId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A form of the id that is safe to embed in an SQL identifier.
    ///
    /// Every character outside `[A-Za-z0-9]` becomes `_`, so two ids that
    /// differ only in punctuation share a table name.
    pub fn to_identifier(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
