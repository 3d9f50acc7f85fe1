//! Remote peer protocol for the replication engine.
//!
//! A facility talks to central through [`CentralPeer`]. The trait mirrors the
//! sync session protocol one call per step; [`HttpCentral`] carries it over
//! HTTP, and an in-process implementation lives with the engine for tests and
//! single-binary deployments.

pub mod http;
pub mod poll;
pub mod protocol;

pub use http::{HttpCentral, HttpCentralConfig};
pub use poll::{PollConfig, Poller};
pub use protocol::{
    CentralPeer, PullCursor, PullInitiation, PullRequest, PullStream, PulledChange,
    StartSessionRequest, StartSessionResponse, StreamMessage,
};
