//! Structural checks on changes before they are staged.

use serde_json::Value;

use edgesync_common::{fields, ErrorDetail, SyncChange};
use edgesync_store::ModelRegistry;

/// Check every change and report all problems found, not just the first.
///
/// A change is well formed when its record type is registered, it has a
/// record id, its data carries the same id, and any tick or per-field tick
/// it carries is an integer.
pub fn validate_changes(changes: &[SyncChange], registry: &ModelRegistry) -> Result<(), Vec<ErrorDetail>> {
    let mut errors = Vec::new();

    for change in changes {
        let detail = |message: String| {
            ErrorDetail::for_record(change.record_type.clone(), change.record_id.clone(), message)
        };

        if !registry.contains(&change.record_type) {
            errors.push(ErrorDetail::general(format!(
                "unknown record type '{}'",
                change.record_type
            )));
            continue;
        }

        if change.record_id.trim().is_empty() {
            errors.push(detail("record id is empty".to_string()));
            continue;
        }

        match change.data.get(fields::ID) {
            Some(Value::String(id)) if *id == change.record_id => {}
            Some(Value::String(id)) => {
                errors.push(detail(format!("data id '{}' does not match record id", id)))
            }
            _ => errors.push(detail("data has no string id".to_string())),
        }

        match change.data.get(fields::UPDATED_AT_SYNC_TICK) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_i64().is_some() => {}
            Some(other) => errors.push(detail(format!("tick {} is not an integer", other))),
        }

        match change.data.get(fields::UPDATED_AT_BY_FIELD) {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) if map.values().all(|v| v.as_i64().is_some()) => {}
            Some(_) => errors.push(detail("per-field ticks must map fields to integers".to_string())),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_store::ModelSpec;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        ModelRegistry::from_specs([ModelSpec::new("patients")]).unwrap()
    }

    fn change(record_type: &str, id: &str, data: Value) -> SyncChange {
        SyncChange::new(record_type, id, data.as_object().cloned().unwrap(), false)
    }

    #[test]
    fn test_well_formed_changes_pass() {
        let changes = vec![change(
            "patients",
            "P1",
            json!({ "id": "P1", "updatedAtSyncTick": 3, "updatedAtByField": { "name": 3 } }),
        )];
        assert!(validate_changes(&changes, &registry()).is_ok());
    }

    #[test]
    fn test_every_problem_is_reported() {
        let changes = vec![
            change("widgets", "W1", json!({ "id": "W1" })),
            change("patients", "P1", json!({ "id": "P2" })),
            change("patients", "P3", json!({ "name": "x" })),
            change("patients", "P4", json!({ "id": "P4", "updatedAtSyncTick": "soon" })),
            change("patients", "", json!({ "id": "" })),
        ];

        let errors = validate_changes(&changes, &registry()).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors[0].message.contains("widgets"));
        assert_eq!(errors[1].record_id.as_deref(), Some("P1"));
    }
}
