//! Resolution of concurrent edits to the same record.

use std::collections::BTreeSet;

use edgesync_common::SyncTick;
use edgesync_store::StoredRecord;

/// Produces the version of a record to persist when an incoming copy meets
/// an existing one.
///
/// Implementations must be total and idempotent: merging the same incoming
/// record twice gives the same result as merging it once.
pub trait ConflictResolver: Send + Sync {
    fn merge(&self, existing: &StoredRecord, incoming: &StoredRecord) -> StoredRecord;
}

/// Field-by-field merge on per-field ticks.
///
/// For each field the side that changed it at the higher tick wins, with ties
/// going to the incoming record. A field only one side knows about is kept.
/// A field one side removed stays removed when that side wins. Fields without
/// a per-field tick fall back to the record's tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldTickResolver;

fn field_tick(record: &StoredRecord, field: &str) -> Option<SyncTick> {
    match record.updated_at_by_field.get(field) {
        Some(tick) => Some(*tick),
        None if record.fields.contains_key(field) => Some(record.updated_at_sync_tick),
        None => None,
    }
}

impl ConflictResolver for FieldTickResolver {
    fn merge(&self, existing: &StoredRecord, incoming: &StoredRecord) -> StoredRecord {
        let keys: BTreeSet<&String> = existing
            .fields
            .keys()
            .chain(existing.updated_at_by_field.keys())
            .chain(incoming.fields.keys())
            .chain(incoming.updated_at_by_field.keys())
            .collect();

        let mut merged = StoredRecord {
            id: incoming.id.clone(),
            fields: Default::default(),
            updated_at_sync_tick: existing.updated_at_sync_tick.max(incoming.updated_at_sync_tick),
            updated_at_by_field: Default::default(),
            deleted_at: incoming.deleted_at.clone(),
        };

        for key in keys {
            let (winner, tick) = match (field_tick(existing, key), field_tick(incoming, key)) {
                (Some(e), Some(i)) if e > i => (existing, e),
                (Some(e), Some(i)) => (incoming, e.max(i)),
                (Some(e), None) => (existing, e),
                (None, Some(i)) => (incoming, i),
                (None, None) => continue,
            };
            if let Some(value) = winner.fields.get(key.as_str()) {
                merged.fields.insert(key.clone(), value.clone());
            }
            merged.updated_at_by_field.insert(key.clone(), tick);
        }

        merged
    }
}
