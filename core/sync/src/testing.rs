//! Fixtures shared by the unit tests of this crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};

use edgesync_common::{Error, Result, SessionId, SyncChange, SyncTick};
use edgesync_peer::{
    CentralPeer, PollConfig, PullCursor, PullInitiation, PullRequest, PullStream, PulledChange,
    StartSessionRequest, StartSessionResponse,
};
use edgesync_store::{Database, ModelRegistry, ModelSpec, StoredRecord, SyncDirection};

use crate::central::{CentralConfig, LocalCentral};
use crate::config::{PushConfig, SyncConfig};

pub fn specs() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("reference_data").with_direction(SyncDirection::PullFromCentral),
        ModelSpec::new("patients")
            .with_dependency_order(1)
            .with_excluded_field("localNotes"),
        ModelSpec::new("encounters")
            .with_dependency_order(2)
            .with_foreign_key("patientId", "patients"),
        ModelSpec::new("audit_events")
            .with_dependency_order(3)
            .with_direction(SyncDirection::PushToCentral)
            .with_push_then_delete(true),
    ]
}

pub fn registry() -> ModelRegistry {
    ModelRegistry::from_specs(specs()).unwrap()
}

/// A facility database with every test model.
pub async fn node() -> (Database, ModelRegistry) {
    let db = Database::open_in_memory().unwrap();
    let registry = registry();
    db.ensure_tables(&registry).await.unwrap();
    (db, registry)
}

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

pub fn fast_poll() -> PollConfig {
    PollConfig::new(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(10))
        .with_jitter(false)
        .with_max_wait(Duration::from_secs(10))
}

pub fn fast_config() -> SyncConfig {
    SyncConfig::default().with_push(PushConfig::default().with_completion_poll(fast_poll()))
}

/// Open a session and return its id and start tick.
pub async fn start(peer: &dyn CentralPeer) -> (SessionId, SyncTick) {
    let request = StartSessionRequest {
        urgent: false,
        last_synced_tick: SyncTick::FULL_RESYNC,
    };
    peer.start_session(request)
        .await
        .unwrap()
        .granted()
        .unwrap()
        .unwrap()
}

/// A [`LocalCentral`] on an in-memory database.
pub struct TestCentral {
    pub peer: LocalCentral,
}

impl TestCentral {
    pub async fn new() -> Self {
        Self::with_config(CentralConfig::default()).await
    }

    pub async fn streaming() -> Self {
        Self::with_config(CentralConfig::default().with_streaming(true)).await
    }

    pub async fn with_config(config: CentralConfig) -> Self {
        let db = Database::open_in_memory().unwrap();
        let peer = LocalCentral::open(db, registry(), config).await.unwrap();
        Self { peer }
    }

    /// A write made directly on central.
    pub async fn write(&self, table: &str, id: &str, fields: Map<String, Value>) {
        let model = self.peer.registry().get(table).unwrap().clone();
        self.peer.database().write_local(model, id, fields).await.unwrap();
    }

    pub async fn find(&self, table: &str, id: &str) -> Option<StoredRecord> {
        let model = self.peer.registry().get(table).unwrap().clone();
        self.peer.database().find(model, id).await.unwrap()
    }

    pub async fn count(&self, table: &str) -> usize {
        let model = self.peer.registry().get(table).unwrap().clone();
        self.peer
            .database()
            .call(move |conn| model.count(conn))
            .await
            .unwrap()
    }
}

/// Delegates to a [`LocalCentral`], cutting the first `cuts` pull streams
/// short after `cut_after` messages.
#[derive(Clone)]
pub struct FlakyStream {
    inner: LocalCentral,
    cut_after: usize,
    cuts_left: Arc<AtomicU32>,
}

impl FlakyStream {
    pub fn new(inner: LocalCentral, cut_after: usize, cuts: u32) -> Self {
        Self {
            inner,
            cut_after,
            cuts_left: Arc::new(AtomicU32::new(cuts)),
        }
    }
}

#[async_trait]
impl CentralPeer for FlakyStream {
    fn name(&self) -> &str {
        "flaky-stream"
    }

    async fn start_session(&self, request: StartSessionRequest) -> Result<StartSessionResponse> {
        self.inner.start_session(request).await
    }

    async fn push(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()> {
        self.inner.push(session_id, changes).await
    }

    async fn complete_push(&self, session_id: &SessionId, tables: Vec<String>) -> Result<()> {
        self.inner.complete_push(session_id, tables).await
    }

    async fn is_push_complete(&self, session_id: &SessionId) -> Result<bool> {
        self.inner.is_push_complete(session_id).await
    }

    async fn initiate_pull(&self, session_id: &SessionId, request: PullRequest) -> Result<PullInitiation> {
        self.inner.initiate_pull(session_id, request).await
    }

    async fn pull_page(&self, session_id: &SessionId, cursor: PullCursor, limit: usize) -> Result<Vec<PulledChange>> {
        self.inner.pull_page(session_id, cursor, limit).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn pull_stream(&self, session_id: &SessionId, cursor: PullCursor) -> Result<PullStream> {
        let stream = self.inner.pull_stream(session_id, cursor).await?;
        let cut = self
            .cuts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if cut {
            Ok(stream.take(self.cut_after).boxed())
        } else {
            Ok(stream)
        }
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.inner.end_session(session_id).await
    }

    async fn mark_session_errored(&self, session_id: &SessionId, message: &str) -> Result<()> {
        self.inner.mark_session_errored(session_id, message).await
    }
}

/// Delegates to a [`LocalCentral`] but fails every pull initiation, either
/// as a dropped connection or as a problem reported by central.
#[derive(Clone)]
pub struct FailingPull {
    pub inner: LocalCentral,
    pub remote: bool,
}

#[async_trait]
impl CentralPeer for FailingPull {
    fn name(&self) -> &str {
        "failing-pull"
    }

    async fn start_session(&self, request: StartSessionRequest) -> Result<StartSessionResponse> {
        self.inner.start_session(request).await
    }

    async fn push(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()> {
        self.inner.push(session_id, changes).await
    }

    async fn complete_push(&self, session_id: &SessionId, tables: Vec<String>) -> Result<()> {
        self.inner.complete_push(session_id, tables).await
    }

    async fn is_push_complete(&self, session_id: &SessionId) -> Result<bool> {
        self.inner.is_push_complete(session_id).await
    }

    async fn initiate_pull(&self, _session_id: &SessionId, _request: PullRequest) -> Result<PullInitiation> {
        if self.remote {
            Err(Error::problem(Some(503), "pull snapshot unavailable"))
        } else {
            Err(Error::Network("connection reset".to_string()))
        }
    }

    async fn pull_page(&self, session_id: &SessionId, cursor: PullCursor, limit: usize) -> Result<Vec<PulledChange>> {
        self.inner.pull_page(session_id, cursor, limit).await
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.inner.end_session(session_id).await
    }

    async fn mark_session_errored(&self, session_id: &SessionId, message: &str) -> Result<()> {
        self.inner.mark_session_errored(session_id, message).await
    }
}
