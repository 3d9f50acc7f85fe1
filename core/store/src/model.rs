//! Syncable record models and their SQLite tables.
//!
//! The engine only ever touches record tables through [`SyncModel`]. The
//! stock implementation, [`RecordTable`], keeps user fields as a JSON
//! document next to the columns the engine needs: the row tick, the per-field
//! ticks, the soft-delete marker and one column per declared foreign key so
//! the database itself enforces parent-before-child ordering.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use edgesync_common::{fields, Error, Result, SyncChange, SyncTick};

/// Which way a model's records travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Pushed and pulled.
    #[default]
    Bidirectional,
    /// Only ever pushed from the facility, e.g. audit logs.
    PushToCentral,
    /// Only ever pulled from central, e.g. reference data.
    PullFromCentral,
}

impl SyncDirection {
    /// Whether a facility includes the model in its push.
    pub fn pushes(self) -> bool {
        matches!(self, Self::Bidirectional | Self::PushToCentral)
    }

    /// Whether a facility includes the model in its pull.
    pub fn pulls(self) -> bool {
        matches!(self, Self::Bidirectional | Self::PullFromCentral)
    }
}

/// A field holding the id of a row in another model's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Field name in this model.
    pub field: String,
    /// Table the field points into.
    pub references: String,
}

/// Declarative description of a syncable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Table name, also used as the record type on the wire.
    pub table: String,
    /// Lower orders are saved first; parents must come before children.
    #[serde(default)]
    pub dependency_order: u32,
    #[serde(default)]
    pub direction: SyncDirection,
    /// Delete local rows once central has accepted them.
    #[serde(default)]
    pub push_then_delete: bool,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Fields kept on this node only; stripped from outgoing records and
    /// preserved when a pulled record overwrites the local one.
    #[serde(default)]
    pub excluded_fields: Vec<String>,
}

impl ModelSpec {
    /// Create a bidirectional model with no dependencies.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            dependency_order: 0,
            direction: SyncDirection::Bidirectional,
            push_then_delete: false,
            foreign_keys: Vec::new(),
            excluded_fields: Vec::new(),
        }
    }

    pub fn with_dependency_order(mut self, order: u32) -> Self {
        self.dependency_order = order;
        self
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_push_then_delete(mut self, enabled: bool) -> Self {
        self.push_then_delete = enabled;
        self
    }

    pub fn with_foreign_key(mut self, field: impl Into<String>, references: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.into(),
            references: references.into(),
        });
        self
    }

    pub fn with_excluded_field(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.push(field.into());
        self
    }

    /// Check that every name in the spec can be used as an SQL identifier.
    ///
    /// # Errors
    /// - Table or field names contain characters outside `[A-Za-z0-9_]`
    /// - A foreign key reuses a system field name
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.table)?;
        if self.table.starts_with("sync_snapshot_") || self.table == "local_system_facts" {
            return Err(Error::InvalidInput(format!(
                "Table name '{}' is reserved",
                self.table
            )));
        }
        for fk in &self.foreign_keys {
            check_identifier(&fk.field)?;
            check_identifier(&fk.references)?;
            if fields::SYSTEM.contains(&fk.field.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Foreign key '{}' on '{}' shadows a system field",
                    fk.field, self.table
                )));
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a valid identifier",
            name
        )));
    }
    Ok(())
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A record as stored in a model table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    /// User fields, without any system field.
    pub fields: Map<String, Value>,
    pub updated_at_sync_tick: SyncTick,
    /// Tick at which each user field last changed.
    pub updated_at_by_field: BTreeMap<String, SyncTick>,
    /// RFC 3339 timestamp of the soft delete, if any.
    pub deleted_at: Option<String>,
}

impl StoredRecord {
    /// Whether the record is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Build a record from wire data.
    ///
    /// A missing tick reads as [`SyncTick::FULL_RESYNC`].
    ///
    /// # Errors
    /// - `id` is missing or not a string
    /// - `updatedAtByField` is present but not a map of integers
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let id = data
            .get(fields::ID)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidInput("record data has no string id".to_string()))?
            .to_string();

        let updated_at_sync_tick = data
            .get(fields::UPDATED_AT_SYNC_TICK)
            .and_then(Value::as_i64)
            .map(SyncTick::new)
            .unwrap_or(SyncTick::FULL_RESYNC);

        let updated_at_by_field = match data.get(fields::UPDATED_AT_BY_FIELD) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(v) => serde_json::from_value(v.clone())?,
        };

        let deleted_at = data
            .get(fields::DELETED_AT)
            .and_then(Value::as_str)
            .map(str::to_string);

        let fields = data
            .iter()
            .filter(|(k, _)| !fields::SYSTEM.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            fields,
            updated_at_sync_tick,
            updated_at_by_field,
            deleted_at,
        })
    }

    /// Render the record as wire data, system fields included.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = self.fields.clone();
        data.insert(fields::ID.to_string(), Value::String(self.id.clone()));
        data.insert(
            fields::UPDATED_AT_SYNC_TICK.to_string(),
            Value::from(self.updated_at_sync_tick.value()),
        );
        let by_field: Map<String, Value> = self
            .updated_at_by_field
            .iter()
            .map(|(k, t)| (k.clone(), Value::from(t.value())))
            .collect();
        data.insert(fields::UPDATED_AT_BY_FIELD.to_string(), Value::Object(by_field));
        data.insert(
            fields::DELETED_AT.to_string(),
            self.deleted_at.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data
    }

    /// Wrap the record as a change of the given type.
    pub fn to_change(&self, record_type: &str) -> SyncChange {
        SyncChange::new(record_type, self.id.clone(), self.to_data(), self.is_deleted())
    }

    /// The record that results from a local write of `fields` at `tick`.
    ///
    /// Fields whose value differs from `existing`, including removed ones,
    /// get `tick` as their field tick. Unchanged fields keep theirs.
    pub fn local_write(
        existing: Option<&StoredRecord>,
        id: impl Into<String>,
        fields: Map<String, Value>,
        tick: SyncTick,
    ) -> Self {
        let mut updated_at_by_field = existing
            .map(|r| r.updated_at_by_field.clone())
            .unwrap_or_default();

        match existing {
            None => {
                for key in fields.keys() {
                    updated_at_by_field.insert(key.clone(), tick);
                }
            }
            Some(prev) => {
                for (key, value) in &fields {
                    if prev.fields.get(key) != Some(value) {
                        updated_at_by_field.insert(key.clone(), tick);
                    }
                }
                for key in prev.fields.keys() {
                    if !fields.contains_key(key) {
                        updated_at_by_field.insert(key.clone(), tick);
                    }
                }
            }
        }

        Self {
            id: id.into(),
            fields,
            updated_at_sync_tick: tick,
            updated_at_by_field,
            deleted_at: None,
        }
    }
}

/// A table the replication engine can read from and write into.
///
/// Writes issued through these methods never touch the change log, so
/// changes applied by the sync process are not echoed as local edits.
pub trait SyncModel: Send + Sync {
    /// The declarative description of the model.
    fn spec(&self) -> &ModelSpec;

    fn table_name(&self) -> &str {
        &self.spec().table
    }

    fn dependency_order(&self) -> u32 {
        self.spec().dependency_order
    }

    fn direction(&self) -> SyncDirection {
        self.spec().direction
    }

    fn push_then_delete(&self) -> bool {
        self.spec().push_then_delete
    }

    /// Strip fields that must not leave this node from outgoing data.
    fn sanitize(&self, mut data: Map<String, Value>) -> Map<String, Value> {
        for field in &self.spec().excluded_fields {
            data.remove(field);
        }
        data
    }

    /// Create the backing table if it does not exist.
    fn ensure_table(&self, conn: &Connection) -> Result<()>;

    /// Load the records with the given ids, soft-deleted ones included.
    fn find_by_ids(&self, conn: &Connection, ids: &[String]) -> Result<Vec<StoredRecord>>;

    /// Every record whose row tick is strictly greater than `since`.
    fn changed_since(&self, conn: &Connection, since: SyncTick) -> Result<Vec<StoredRecord>>;

    fn create(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()>;

    /// Overwrite field data and ticks. The soft-delete marker is left alone.
    fn update(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()>;

    /// Mark records deleted, using each record's own timestamp when it has one.
    fn soft_delete(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()>;

    /// Clear the soft-delete marker.
    fn restore(&self, conn: &Connection, ids: &[String]) -> Result<()>;

    /// Remove rows outright. Returns how many went.
    fn hard_delete(&self, conn: &Connection, ids: &[String]) -> Result<usize>;

    /// Number of rows, soft-deleted ones included.
    fn count(&self, conn: &Connection) -> Result<usize>;
}

/// Generic JSON-document table implementing [`SyncModel`].
#[derive(Debug, Clone)]
pub struct RecordTable {
    spec: ModelSpec,
    table: String,
    fk_columns: Vec<String>,
}

impl RecordTable {
    /// Create a table handle for a model.
    ///
    /// # Errors
    /// - The spec fails [`ModelSpec::validate`]
    pub fn new(spec: ModelSpec) -> Result<Self> {
        spec.validate()?;
        let table = quote_ident(&spec.table);
        let fk_columns = spec.foreign_keys.iter().map(|fk| quote_ident(&fk.field)).collect();
        Ok(Self {
            spec,
            table,
            fk_columns,
        })
    }

    fn fk_values(&self, record: &StoredRecord) -> Vec<SqlValue> {
        self.spec
            .foreign_keys
            .iter()
            .map(|fk| match record.fields.get(&fk.field) {
                None | Some(Value::Null) => SqlValue::Null,
                Some(Value::String(s)) => SqlValue::Text(s.clone()),
                Some(other) => SqlValue::Text(other.to_string()),
            })
            .collect()
    }

    fn select_rows(&self, conn: &Connection, clause: &str, arg: SqlValue) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT id, data, updated_at_sync_tick, updated_at_by_field, deleted_at
             FROM {} WHERE {} ORDER BY id",
            self.table, clause
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let raw = stmt
            .query_map([arg], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, SyncTick>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, data, tick, by_field, deleted_at)| {
                Ok(StoredRecord {
                    id,
                    fields: serde_json::from_str(&data)?,
                    updated_at_sync_tick: tick,
                    updated_at_by_field: serde_json::from_str(&by_field)?,
                    deleted_at,
                })
            })
            .collect()
    }
}

fn ids_json(ids: &[String]) -> Result<SqlValue> {
    Ok(SqlValue::Text(serde_json::to_string(ids)?))
}

impl SyncModel for RecordTable {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn ensure_table(&self, conn: &Connection) -> Result<()> {
        let fk_defs: String = self
            .spec
            .foreign_keys
            .iter()
            .zip(&self.fk_columns)
            .map(|(fk, col)| format!("{} TEXT REFERENCES {}(id),\n", col, quote_ident(&fk.references)))
            .collect();

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                {fk_defs}
                data TEXT NOT NULL,
                updated_at_sync_tick INTEGER NOT NULL,
                updated_at_by_field TEXT NOT NULL DEFAULT '{{}}',
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table}(updated_at_sync_tick);
            "#,
            table = self.table,
            fk_defs = fk_defs,
            index = quote_ident(&format!("idx_{}_tick", self.spec.table)),
        ))?;
        Ok(())
    }

    fn find_by_ids(&self, conn: &Connection, ids: &[String]) -> Result<Vec<StoredRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select_rows(conn, "id IN (SELECT value FROM json_each(?1))", ids_json(ids)?)
    }

    fn changed_since(&self, conn: &Connection, since: SyncTick) -> Result<Vec<StoredRecord>> {
        self.select_rows(conn, "updated_at_sync_tick > ?1", SqlValue::Integer(since.value()))
    }

    fn create(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()> {
        let columns: String = self.fk_columns.iter().map(|c| format!("{}, ", c)).collect();
        let placeholders = vec!["?"; self.fk_columns.len() + 5].join(", ");
        let sql = format!(
            "INSERT INTO {} (id, {}data, updated_at_sync_tick, updated_at_by_field, deleted_at)
             VALUES ({})",
            self.table, columns, placeholders
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        for record in records {
            let mut values = vec![SqlValue::Text(record.id.clone())];
            values.extend(self.fk_values(record));
            values.push(SqlValue::Text(serde_json::to_string(&record.fields)?));
            values.push(SqlValue::Integer(record.updated_at_sync_tick.value()));
            values.push(SqlValue::Text(serde_json::to_string(&record.updated_at_by_field)?));
            values.push(SqlValue::Null);
            stmt.execute(params_from_iter(values))?;
        }
        Ok(())
    }

    fn update(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()> {
        let assignments: String = self.fk_columns.iter().map(|c| format!("{} = ?, ", c)).collect();
        let sql = format!(
            "UPDATE {} SET {}data = ?, updated_at_sync_tick = ?, updated_at_by_field = ?
             WHERE id = ?",
            self.table, assignments
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        for record in records {
            let mut values = self.fk_values(record);
            values.push(SqlValue::Text(serde_json::to_string(&record.fields)?));
            values.push(SqlValue::Integer(record.updated_at_sync_tick.value()));
            values.push(SqlValue::Text(serde_json::to_string(&record.updated_at_by_field)?));
            values.push(SqlValue::Text(record.id.clone()));
            stmt.execute(params_from_iter(values))?;
        }
        Ok(())
    }

    fn soft_delete(&self, conn: &Connection, records: &[StoredRecord]) -> Result<()> {
        let sql = format!("UPDATE {} SET deleted_at = ?1 WHERE id = ?2", self.table);
        let mut stmt = conn.prepare_cached(&sql)?;
        let now = Utc::now().to_rfc3339();

        for record in records {
            let at = record.deleted_at.as_deref().unwrap_or(&now);
            stmt.execute([at, record.id.as_str()])?;
        }
        Ok(())
    }

    fn restore(&self, conn: &Connection, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET deleted_at = NULL WHERE id IN (SELECT value FROM json_each(?1))",
            self.table
        );
        conn.execute(&sql, [ids_json(ids)?])?;
        Ok(())
    }

    fn hard_delete(&self, conn: &Connection, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE id IN (SELECT value FROM json_each(?1))",
            self.table
        );
        Ok(conn.execute(&sql, [ids_json(ids)?])?)
    }

    fn count(&self, conn: &Connection) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn setup() -> (Connection, RecordTable, RecordTable) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let patients = RecordTable::new(ModelSpec::new("patients")).unwrap();
        let encounters = RecordTable::new(
            ModelSpec::new("encounters")
                .with_dependency_order(1)
                .with_foreign_key("patientId", "patients"),
        )
        .unwrap();
        patients.ensure_table(&conn).unwrap();
        encounters.ensure_table(&conn).unwrap();
        (conn, patients, encounters)
    }

    fn record(id: &str, fields: Value, tick: i64) -> StoredRecord {
        StoredRecord::local_write(None, id, obj(fields), SyncTick::new(tick))
    }

    #[test]
    fn test_spec_rejects_bad_identifiers() {
        assert!(ModelSpec::new("patients; DROP").validate().is_err());
        assert!(ModelSpec::new("1patients").validate().is_err());
        assert!(ModelSpec::new("sync_snapshot_x").validate().is_err());
        assert!(ModelSpec::new("patients")
            .with_foreign_key("id", "other")
            .validate()
            .is_err());
        assert!(ModelSpec::new("patient_notes").validate().is_ok());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: ModelSpec = serde_json::from_value(json!({
            "table": "lab_requests",
            "direction": "push_to_central"
        }))
        .unwrap();
        assert_eq!(spec.direction, SyncDirection::PushToCentral);
        assert!(spec.direction.pushes());
        assert!(!spec.direction.pulls());
        assert_eq!(spec.dependency_order, 0);
    }

    #[test]
    fn test_data_round_trip_keeps_system_fields() {
        let data = obj(json!({
            "id": "P1",
            "name": "Ada",
            "updatedAtSyncTick": 7,
            "updatedAtByField": { "name": 7 },
            "deletedAt": null
        }));
        let record = StoredRecord::from_data(&data).unwrap();
        assert_eq!(record.id, "P1");
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.updated_at_by_field.get("name"), Some(&SyncTick::new(7)));
        assert_eq!(record.to_data(), data);
    }

    #[test]
    fn test_from_data_requires_id() {
        assert!(StoredRecord::from_data(&obj(json!({ "name": "x" }))).is_err());
    }

    #[test]
    fn test_local_write_stamps_only_changed_fields() {
        let first = record("P1", json!({ "name": "Ada", "sex": "f" }), 4);
        let second = StoredRecord::local_write(
            Some(&first),
            "P1",
            obj(json!({ "name": "Ada L", "sex": "f" })),
            SyncTick::new(9),
        );
        assert_eq!(second.updated_at_by_field["name"], SyncTick::new(9));
        assert_eq!(second.updated_at_by_field["sex"], SyncTick::new(4));
        assert_eq!(second.updated_at_sync_tick, SyncTick::new(9));
    }

    #[test]
    fn test_create_find_update() {
        let (conn, patients, _) = setup();
        patients.create(&conn, &[record("P1", json!({ "name": "Ada" }), 3)]).unwrap();

        let mut found = patients.find_by_ids(&conn, &["P1".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        let mut p1 = found.remove(0);
        assert_eq!(p1.fields["name"], json!("Ada"));

        p1.fields.insert("name".into(), json!("Grace"));
        p1.updated_at_sync_tick = SyncTick::new(5);
        patients.update(&conn, &[p1]).unwrap();

        let found = patients.find_by_ids(&conn, &["P1".to_string()]).unwrap();
        assert_eq!(found[0].fields["name"], json!("Grace"));
        assert_eq!(found[0].updated_at_sync_tick, SyncTick::new(5));
    }

    #[test]
    fn test_changed_since_skips_central_sentinel() {
        let (conn, patients, _) = setup();
        patients
            .create(
                &conn,
                &[
                    record("P1", json!({}), 2),
                    record("P2", json!({}), 5),
                    record("P3", json!({}), -999),
                ],
            )
            .unwrap();

        let ids: Vec<_> = patients
            .changed_since(&conn, SyncTick::FULL_RESYNC)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["P1", "P2"]);

        let ids: Vec<_> = patients
            .changed_since(&conn, SyncTick::new(2))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["P2"]);
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let (conn, patients, _) = setup();
        let p1 = record("P1", json!({}), 1);
        patients.create(&conn, &[p1.clone()]).unwrap();

        patients.soft_delete(&conn, &[p1]).unwrap();
        let found = patients.find_by_ids(&conn, &["P1".to_string()]).unwrap();
        assert!(found[0].is_deleted());

        patients.restore(&conn, &["P1".to_string()]).unwrap();
        let found = patients.find_by_ids(&conn, &["P1".to_string()]).unwrap();
        assert!(!found[0].is_deleted());
    }

    #[test]
    fn test_foreign_key_enforced() {
        let (conn, patients, encounters) = setup();
        let orphan = record("E1", json!({ "patientId": "P1" }), 1);
        assert!(encounters.create(&conn, &[orphan.clone()]).is_err());

        patients.create(&conn, &[record("P1", json!({}), 1)]).unwrap();
        encounters.create(&conn, &[orphan]).unwrap();
        assert_eq!(encounters.count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_hard_delete() {
        let (conn, patients, _) = setup();
        patients
            .create(&conn, &[record("P1", json!({}), 1), record("P2", json!({}), 1)])
            .unwrap();
        assert_eq!(patients.hard_delete(&conn, &["P1".to_string()]).unwrap(), 1);
        assert_eq!(patients.count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_sanitize_drops_excluded_fields() {
        let table = RecordTable::new(ModelSpec::new("users").with_excluded_field("password")).unwrap();
        let clean = table.sanitize(obj(json!({ "id": "U1", "password": "x", "name": "n" })));
        assert!(!clean.contains_key("password"));
        assert!(clean.contains_key("name"));
    }
}
