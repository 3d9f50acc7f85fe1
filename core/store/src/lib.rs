//! SQLite datastore for the replication engine.
//!
//! This crate owns everything the engine persists locally: the fact table
//! holding the sync cursors, the per-model record tables, the session-scoped
//! snapshot tables and the change log. The engine never inspects record
//! semantics; each table is reached through the [`SyncModel`] trait and the
//! static [`ModelRegistry`] enumerated at startup.
//!
//! # Design Principles
//! - One connection per node, guarded by a mutex and driven from blocking tasks
//! - Every multi-statement operation runs inside a single transaction
//! - Cursor facts are written through the same connection as the data they
//!   describe, so they can share a transaction with it

pub mod changelog;
pub mod db;
pub mod facts;
pub mod model;
pub mod pending;
pub mod registry;
pub mod snapshot;

pub use db::Database;
pub use facts::{LocalSystemFacts, TickStore};
pub use model::{ModelSpec, RecordTable, StoredRecord, SyncDirection, SyncModel};
pub use pending::{PendingEditGuard, PendingEdits};
pub use registry::ModelRegistry;
pub use snapshot::{SnapshotDirection, SnapshotRecord, SnapshotStore};
