//! Common utilities and types shared across the edgesync crates.
//!
//! This module provides the foundational types every layer of the replication
//! engine agrees on: the error taxonomy, tick and session identifiers, the
//! names of the durable cursor facts, and the wire shape of a record change.

pub mod change;
pub mod error;
pub mod types;

pub use change::{fields, ChangeLogEntry, SyncChange};
pub use error::{Error, ErrorDetail, Result};
pub use types::{facts, SessionId, SyncTick, SYNC_TICK_FLAG_FROM_CENTRAL};
