//! Wire shape of a record crossing the node boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::SyncTick;

/// Well-known keys inside a change's `data` object.
pub mod fields {
    /// Primary key of the record.
    pub const ID: &str = "id";
    /// Tick at which the record last changed on the sending node.
    pub const UPDATED_AT_SYNC_TICK: &str = "updatedAtSyncTick";
    /// Per-field ticks used when merging concurrent edits.
    pub const UPDATED_AT_BY_FIELD: &str = "updatedAtByField";
    /// Soft-deletion marker, RFC 3339 or null.
    pub const DELETED_AT: &str = "deletedAt";

    /// Keys maintained by the engine rather than by the model.
    pub const SYSTEM: [&str; 4] = [ID, UPDATED_AT_SYNC_TICK, UPDATED_AT_BY_FIELD, DELETED_AT];
}

/// A full copy of one record, as pushed or pulled.
///
/// `data` always carries the complete field set, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    /// Table name of the model the record belongs to.
    pub record_type: String,
    /// Primary key of the record.
    pub record_id: String,
    /// Full record.
    pub data: Map<String, Value>,
    /// Whether the record is soft-deleted on the sending node.
    pub is_deleted: bool,
    /// Audit entries describing how the record got to this state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changelog: Vec<ChangeLogEntry>,
}

impl SyncChange {
    /// Create a change for a record.
    pub fn new(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        data: Map<String, Value>,
        is_deleted: bool,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            data,
            is_deleted,
            changelog: Vec::new(),
        }
    }

    /// Tick recorded inside `data`, if present and numeric.
    pub fn data_tick(&self) -> Option<SyncTick> {
        self.data
            .get(fields::UPDATED_AT_SYNC_TICK)
            .and_then(Value::as_i64)
            .map(SyncTick::new)
    }

    /// Overwrite the tick recorded inside `data`.
    pub fn set_data_tick(&mut self, tick: SyncTick) {
        self.data
            .insert(fields::UPDATED_AT_SYNC_TICK.to_string(), Value::from(tick.value()));
    }

    /// Identity of the record across nodes.
    pub fn key(&self) -> (&str, &str) {
        (&self.record_type, &self.record_id)
    }
}

/// One audit entry for a local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// Unique id of the entry.
    pub id: String,
    /// Table of the changed record.
    pub table_name: String,
    /// Id of the changed record.
    pub record_id: String,
    /// Full record data after the write.
    pub record_data: Value,
    /// Tick the write was stamped with.
    pub updated_at_sync_tick: SyncTick,
    /// Wall-clock time of the write.
    pub logged_at: DateTime<Utc>,
}
