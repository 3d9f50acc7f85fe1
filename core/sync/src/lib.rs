//! EdgeSync replication engine
//!
//! Bidirectional sync between facility nodes and a central server:
//! - Tick-based change tracking with a tick-tock clock on central
//! - Per-session snapshot tables staging outgoing and incoming changes
//! - Dependency-ordered, batched apply with field-level conflict merge
//! - Paged or streamed pulls with reconnect and adaptive page sizing
//! - Coalesced sync runs, manual or periodic
//!
//! [`LocalCentral`] implements the central side in-process, for tests and
//! single-machine deployments.

pub mod central;
pub mod clock;
pub mod config;
pub mod manager;
pub mod merge;
pub mod persist;
pub mod pull;
pub mod push;
pub mod scheduler;
pub mod state;
pub mod validation;

#[cfg(test)]
mod testing;

pub use central::{CentralConfig, LocalCentral};
pub use clock::TickClock;
pub use config::{PageLimitConfig, PersistConfig, PullConfig, PushConfig, SyncConfig};
pub use manager::{SyncManager, SyncReason, TriggerResult};
pub use merge::{ConflictResolver, FieldTickResolver};
pub use persist::{PersistOptions, Persister, SaveStats};
pub use pull::{calculate_page_limit, PullOutcome, Puller};
pub use push::{PushOutcome, Pusher};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle};
pub use state::{LastRun, SyncPhase, SyncState};
pub use validation::validate_changes;
