//! Common error types for the replication engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for edgesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote peer could not be reached or the connection dropped.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote peer answered with a typed problem response.
    ///
    /// The peer already knows about these, so the session is not reported
    /// back to it as errored.
    #[error("Remote problem: {message}")]
    Problem {
        status: Option<u16>,
        message: String,
    },

    /// The peer sent something that does not follow the sync protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// One or more incoming changes failed validation.
    #[error("Validation failed: {}", format_details(.0))]
    Validation(Vec<ErrorDetail>),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A background task or lock failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a problem error as reported by the remote peer.
    pub fn problem(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Problem {
            status,
            message: message.into(),
        }
    }

    /// Whether the error originated on the remote peer.
    ///
    /// Local errors must be reported to the peer with `markSessionErrored`;
    /// remote ones must not.
    pub fn is_remote_problem(&self) -> bool {
        matches!(self, Error::Problem { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// A single structured error produced by a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Record type the error applies to, if any.
    pub record_type: Option<String>,
    /// Record id the error applies to, if any.
    pub record_id: Option<String>,
    /// Human readable description.
    pub message: String,
}

impl ErrorDetail {
    /// Create an error detail for a specific record.
    pub fn for_record(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            record_type: Some(record_type.into()),
            record_id: Some(record_id.into()),
            message: message.into(),
        }
    }

    /// Create an error detail that is not tied to a record.
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            record_type: None,
            record_id: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.record_type, &self.record_id) {
            (Some(t), Some(id)) => write!(f, "{}/{}: {}", t, id, self.message),
            (Some(t), None) => write!(f, "{}: {}", t, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

fn format_details(details: &[ErrorDetail]) -> String {
    details
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
