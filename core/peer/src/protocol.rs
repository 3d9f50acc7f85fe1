//! The sync session protocol between a facility and central.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use edgesync_common::{Error, Result, SessionId, SyncChange, SyncTick};

/// Body of a session start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Ask central to skip its queue.
    pub urgent: bool,
    /// The facility's `lastSuccessfulSyncPull`, used by central to rank the queue.
    pub last_synced_tick: SyncTick,
}

/// Central's answer to a session start request.
///
/// A missing `session_id` means the facility was queued and should try again
/// later.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_tick: Option<SyncTick>,
}

impl StartSessionResponse {
    /// A granted session.
    pub fn started(session_id: SessionId, started_at_tick: SyncTick) -> Self {
        Self {
            status: None,
            session_id: Some(session_id),
            started_at_tick: Some(started_at_tick),
        }
    }

    /// A queued request.
    pub fn queued() -> Self {
        Self {
            status: Some("waitingInQueue".to_string()),
            session_id: None,
            started_at_tick: None,
        }
    }

    /// The session id and start tick, or `None` when queued.
    ///
    /// # Errors
    /// - A session id was granted without a start tick
    pub fn granted(&self) -> Result<Option<(SessionId, SyncTick)>> {
        match (&self.session_id, self.started_at_tick) {
            (None, _) => Ok(None),
            (Some(id), Some(tick)) => Ok(Some((id.clone(), tick))),
            (Some(id), None) => Err(Error::Protocol(format!(
                "session {} was started without a tick",
                id
            ))),
        }
    }
}

/// What a facility asks central to prepare for pulling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// The facility's `lastSuccessfulSyncPull`.
    pub since: SyncTick,
    /// Tables the facility wants at all.
    pub tables_to_include: Vec<String>,
    /// Tables to send from the beginning regardless of `since`.
    #[serde(default)]
    pub tables_for_full_resync: Vec<String>,
}

/// Size and end tick of a prepared pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullInitiation {
    pub total_to_pull: u64,
    /// Tick the facility is caught up to once everything is applied.
    pub pull_until: SyncTick,
}

/// A change as served by central, with its position in the pull snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledChange {
    /// Position within the session's pull snapshot.
    pub id: i64,
    /// Dependency order of the change's model.
    pub sort_order: u32,
    #[serde(flatten)]
    pub change: SyncChange,
}

/// Where a paged or streamed pull resumes.
///
/// Central serves the snapshot ordered by position, so the last position
/// seen is enough to resume after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PullCursor {
    after: Option<i64>,
}

impl PullCursor {
    /// A cursor at the start of the snapshot.
    pub fn start() -> Self {
        Self::default()
    }

    /// A cursor resuming after the given position.
    pub fn after(id: i64) -> Self {
        Self { after: Some(id) }
    }

    /// The cursor that resumes after `change`.
    pub fn advance_past(self, change: &PulledChange) -> Self {
        match self.after {
            Some(current) if current >= change.id => self,
            _ => Self::after(change.id),
        }
    }

    /// Last position already received, if any.
    pub fn last_seen(&self) -> Option<i64> {
        self.after
    }

    /// The `fromId` query value.
    pub fn from_id(&self) -> Option<String> {
        self.after.map(|id| id.to_string())
    }

    /// Parse a `fromId` query value. Empty means the start.
    ///
    /// # Errors
    /// - The value is not an integer
    pub fn parse(from_id: Option<&str>) -> Result<Self> {
        match from_id.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Self::start()),
            Some(raw) => raw
                .parse::<i64>()
                .map(Self::after)
                .map_err(|_| Error::InvalidInput(format!("invalid fromId '{}'", raw))),
        }
    }
}

/// One message of a streamed pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMessage {
    PullChange(PulledChange),
    End,
}

/// A streamed pull.
pub type PullStream = BoxStream<'static, Result<StreamMessage>>;

/// The central node as seen from a facility.
///
/// Each method is one step of a sync session. Errors the central reports
/// itself come back as [`Error::Problem`]; everything else is a local or
/// transport failure.
#[async_trait]
pub trait CentralPeer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Ask for a session. A response without a session id means queued.
    async fn start_session(&self, request: StartSessionRequest) -> Result<StartSessionResponse>;

    /// Upload one chunk of outgoing changes. Safe to repeat.
    async fn push(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()>;

    /// Announce that every chunk has been uploaded.
    async fn complete_push(&self, session_id: &SessionId, tables_to_include: Vec<String>) -> Result<()>;

    /// Whether central has finished persisting the pushed changes.
    async fn is_push_complete(&self, session_id: &SessionId) -> Result<bool>;

    /// Prepare the pull snapshot and report its size.
    async fn initiate_pull(&self, session_id: &SessionId, request: PullRequest) -> Result<PullInitiation>;

    /// Fetch up to `limit` changes after `cursor`.
    async fn pull_page(
        &self,
        session_id: &SessionId,
        cursor: PullCursor,
        limit: usize,
    ) -> Result<Vec<PulledChange>>;

    /// Whether [`pull_stream`](Self::pull_stream) is available.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream every change after `cursor`, followed by [`StreamMessage::End`].
    async fn pull_stream(&self, session_id: &SessionId, cursor: PullCursor) -> Result<PullStream> {
        let _ = (session_id, cursor);
        Err(Error::Protocol(format!("{} does not support streaming pulls", self.name())))
    }

    /// Close a session that completed.
    async fn end_session(&self, session_id: &SessionId) -> Result<()>;

    /// Report that the facility gave up on a session.
    async fn mark_session_errored(&self, session_id: &SessionId, message: &str) -> Result<()>;
}
