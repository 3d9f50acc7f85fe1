//! HTTP transport for the sync session protocol.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use edgesync_common::{Error, Result, SessionId, SyncChange, SyncTick};

use crate::poll::{PollConfig, Poller};
use crate::protocol::{
    CentralPeer, PullCursor, PullInitiation, PullRequest, PullStream, PulledChange,
    StartSessionRequest, StartSessionResponse, StreamMessage,
};

/// Configuration for [`HttpCentral`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCentralConfig {
    /// Root of the central's API, e.g. `https://central.example/api/`.
    pub base_url: Url,
    /// Timeout for establishing a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout for everything except the pull stream.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Longest gap allowed between two chunks of the pull stream.
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    /// Use the streaming pull endpoint instead of paging.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub poll: PollConfig,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    60_000
}

impl HttpCentralConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_ms: default_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            streaming: false,
            poll: PollConfig::default(),
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionMetadata {
    started_at_tick: SyncTick,
}

/// Central reached over HTTP.
pub struct HttpCentral {
    http: Client,
    base_url: Url,
    poller: Poller,
    streaming: bool,
    timeout: Duration,
    stream_idle_timeout: Duration,
}

impl HttpCentral {
    /// Create a new client.
    ///
    /// # Errors
    /// - The base URL cannot carry a path
    /// - The HTTP client cannot be built
    pub fn new(config: HttpCentralConfig) -> Result<Self> {
        if config.base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "'{}' cannot be used as a base URL",
                config.base_url
            )));
        }
        let http = Client::builder()
            .user_agent(concat!("edgesync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url,
            poller: Poller::new(config.poll),
            streaming: config.streaming,
            timeout: Duration::from_millis(config.timeout_ms),
            stream_idle_timeout: Duration::from_millis(config.stream_idle_timeout_ms),
        })
    }

    /// URL for `sync/{session}/{rest...}`.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput(format!("'{}' cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push("sync")
            .extend(segments);
        Ok(url)
    }

    fn session_url(&self, session_id: &SessionId, rest: &[&str]) -> Result<Url> {
        let mut segments = vec![session_id.as_str()];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).timeout(self.timeout)
    }

    /// A request with no overall deadline; the body is guarded by
    /// [`idle_timeout`] instead.
    fn stream_request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to {}: {}", what, e)))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(problem_from(response).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse {} response: {}", what, e)))
    }

    async fn get_bool(&self, url: Url, what: &str) -> Result<bool> {
        self.send_json(self.request(Method::GET, url), what).await
    }
}

/// Turn a failed response into a problem error.
///
/// Central reports failures as `{"error": {"message": ...}}`; anything else
/// is kept verbatim.
async fn problem_from(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::problem(Some(status.as_u16()), problem_message(status.as_u16(), &body))
}

fn problem_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("{} - {}", status, body.trim()))
}

/// Fail a byte stream that goes quiet for longer than `idle`.
///
/// The timer restarts on every chunk, so a long but steady download is never
/// cut off. A stall yields one network error and ends the stream.
pub(crate) fn idle_timeout<S>(bytes: S, idle: Duration) -> BoxStream<'static, Result<Bytes>>
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let bytes: BoxStream<'static, Result<Bytes>> = bytes.boxed();
    stream::unfold(Some(bytes), move |state| async move {
        let mut bytes = state?;
        match tokio::time::timeout(idle, bytes.next()).await {
            Ok(Some(item)) => Some((item, Some(bytes))),
            Ok(None) => None,
            Err(_) => Some((
                Err(Error::Network(format!(
                    "Pull stream idle for more than {}ms",
                    idle.as_millis()
                ))),
                None,
            )),
        }
    })
    .boxed()
}

/// Split a newline-delimited JSON byte stream into pull messages.
///
/// A transport error ends the stream after being yielded once.
pub(crate) fn decode_messages<S>(bytes: S) -> PullStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let bytes: BoxStream<'static, Result<Bytes>> = bytes.boxed();
    stream::unfold((bytes, Vec::<u8>::new(), false), |(mut bytes, mut buf, mut eof)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                let message = serde_json::from_slice::<StreamMessage>(line).map_err(Error::from);
                return Some((message, (bytes, buf, eof)));
            }
            if eof {
                if buf.trim_ascii().is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut buf);
                let message = serde_json::from_slice::<StreamMessage>(rest.trim_ascii()).map_err(Error::from);
                return Some((message, (bytes, buf, eof)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), (bytes, Vec::new(), true))),
                None => eof = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl CentralPeer for HttpCentral {
    fn name(&self) -> &str {
        "http"
    }

    async fn start_session(&self, request: StartSessionRequest) -> Result<StartSessionResponse> {
        let url = self.url(&[])?;
        let response: StartSessionResponse = self
            .send_json(self.request(Method::POST, url).json(&request), "start session")
            .await?;

        let Some(session_id) = response.session_id.clone() else {
            return Ok(response);
        };

        let ready_url = self.session_url(&session_id, &["ready"])?;
        self.poller
            .until_ready("session", || self.get_bool(ready_url.clone(), "check session"))
            .await?;

        let metadata: SessionMetadata = self
            .send_json(
                self.request(Method::GET, self.session_url(&session_id, &["metadata"])?),
                "fetch session metadata",
            )
            .await?;
        debug!(session_id = %session_id, started_at_tick = %metadata.started_at_tick, "Session ready");

        Ok(StartSessionResponse::started(session_id, metadata.started_at_tick))
    }

    async fn push(&self, session_id: &SessionId, changes: Vec<SyncChange>) -> Result<()> {
        let url = self.session_url(session_id, &["push"])?;
        self.send(
            self.request(Method::POST, url).json(&json!({ "changes": changes })),
            "push changes",
        )
        .await?;
        Ok(())
    }

    async fn complete_push(&self, session_id: &SessionId, tables_to_include: Vec<String>) -> Result<()> {
        let url = self.session_url(session_id, &["push", "complete"])?;
        self.send(
            self.request(Method::POST, url)
                .json(&json!({ "tablesToInclude": tables_to_include })),
            "complete push",
        )
        .await?;
        Ok(())
    }

    async fn is_push_complete(&self, session_id: &SessionId) -> Result<bool> {
        let url = self.session_url(session_id, &["push", "complete"])?;
        self.get_bool(url, "check push").await
    }

    async fn initiate_pull(&self, session_id: &SessionId, request: PullRequest) -> Result<PullInitiation> {
        let url = self.session_url(session_id, &["pull", "initiate"])?;
        self.send(self.request(Method::POST, url).json(&request), "initiate pull")
            .await?;

        let ready_url = self.session_url(session_id, &["pull", "ready"])?;
        self.poller
            .until_ready("pull snapshot", || self.get_bool(ready_url.clone(), "check pull"))
            .await?;

        self.send_json(
            self.request(Method::GET, self.session_url(session_id, &["pull", "metadata"])?),
            "fetch pull metadata",
        )
        .await
    }

    async fn pull_page(
        &self,
        session_id: &SessionId,
        cursor: PullCursor,
        limit: usize,
    ) -> Result<Vec<PulledChange>> {
        let url = self.session_url(session_id, &["pull"])?;
        let mut request = self
            .request(Method::GET, url)
            .query(&[("limit", limit.to_string())]);
        if let Some(from_id) = cursor.from_id() {
            request = request.query(&[("fromId", from_id)]);
        }
        self.send_json(request, "pull page").await
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn pull_stream(&self, session_id: &SessionId, cursor: PullCursor) -> Result<PullStream> {
        let url = self.session_url(session_id, &["pull", "stream"])?;
        let mut request = self.stream_request(Method::GET, url);
        if let Some(from_id) = cursor.from_id() {
            request = request.query(&[("fromId", from_id)]);
        }
        let response = tokio::time::timeout(self.timeout, self.send(request, "open pull stream"))
            .await
            .map_err(|_| Error::Network("Timed out opening pull stream".to_string()))??;

        let bytes = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));
        Ok(decode_messages(idle_timeout(bytes, self.stream_idle_timeout)))
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        let url = self.session_url(session_id, &[])?;
        self.send(self.request(Method::DELETE, url), "end session").await?;
        Ok(())
    }

    async fn mark_session_errored(&self, session_id: &SessionId, message: &str) -> Result<()> {
        let url = self.session_url(session_id, &["errored"])?;
        self.send(
            self.request(Method::POST, url).json(&json!({ "error": message })),
            "mark session errored",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn central(base: &str) -> HttpCentral {
        HttpCentral::new(HttpCentralConfig::new(Url::parse(base).unwrap())).unwrap()
    }

    #[test]
    fn test_session_urls() {
        let central = central("https://central.example/api/");
        let id = SessionId::new("abc-123").unwrap();

        assert_eq!(
            central.url(&[]).unwrap().as_str(),
            "https://central.example/api/sync"
        );
        assert_eq!(
            central.session_url(&id, &["pull", "ready"]).unwrap().as_str(),
            "https://central.example/api/sync/abc-123/pull/ready"
        );
    }

    #[test]
    fn test_session_id_is_escaped_in_path() {
        let central = central("https://central.example");
        let id = SessionId::new("a/b").unwrap();
        let url = central.session_url(&id, &["push"]).unwrap();
        assert_eq!(url.path(), "/sync/a%2Fb/push");
    }

    #[test]
    fn test_problem_message_prefers_structured_error() {
        assert_eq!(
            problem_message(409, r#"{"error":{"message":"session is busy"}}"#),
            "session is busy"
        );
        assert_eq!(problem_message(502, "bad gateway"), "502 - bad gateway");
    }

    #[tokio::test]
    async fn test_decode_messages_across_chunk_boundaries() {
        let chunks = vec![
            Ok(Bytes::from_static(
                b"{\"kind\":\"PULL_CHANGE\",\"message\":{\"id\":1,\"sortOrder\":0,",
            )),
            Ok(Bytes::from_static(
                b"\"recordType\":\"patients\",\"recordId\":\"P1\",\"data\":{\"id\":\"P1\"},\"isDeleted\":false}}\n\n",
            )),
            Ok(Bytes::from_static(b"{\"kind\":\"END\"}")),
        ];

        let messages: Vec<_> = decode_messages(stream::iter(chunks)).collect().await;
        assert_eq!(messages.len(), 2);
        match messages[0].as_ref().unwrap() {
            StreamMessage::PullChange(change) => assert_eq!(change.change.record_id, "P1"),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(messages[1].as_ref().unwrap(), &StreamMessage::End);
    }

    fn slow_chunks(count: usize, gap: Duration) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        stream::iter(0..count).then(move |i| async move {
            tokio::time::sleep(gap).await;
            Ok(Bytes::from(format!("chunk {}\n", i)))
        })
    }

    #[tokio::test]
    async fn test_steady_slow_stream_is_not_cut_off() {
        // Each gap is inside the idle window; the total is well past it.
        let idle = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let chunks: Vec<_> = idle_timeout(slow_chunks(6, Duration::from_millis(60)), idle)
            .collect()
            .await;

        assert!(started.elapsed() > idle);
        assert_eq!(chunks.len(), 6);
        assert!(chunks.iter().all(|chunk| chunk.is_ok()));
    }

    #[tokio::test]
    async fn test_stalled_stream_fails() {
        let first = stream::iter(vec![Ok(Bytes::from_static(b"{\"kind\":\"END\"}\n"))]);
        let stalled = first.chain(stream::pending());
        let chunks: Vec<_> = idle_timeout(stalled, Duration::from_millis(50)).collect().await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(chunks[1], Err(Error::Network(_))));
    }

    #[test]
    fn test_config_from_json() {
        let config: HttpCentralConfig =
            serde_json::from_str(r#"{ "base_url": "https://central.example/api/", "streaming": true }"#).unwrap();
        assert_eq!(config.base_url.as_str(), "https://central.example/api/");
        assert!(config.streaming);
        assert_eq!(config.timeout_ms, 60_000);
        assert_eq!(config.stream_idle_timeout_ms, 60_000);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["base_url"], "https://central.example/api/");
    }

    #[test]
    fn test_timeouts_from_config() {
        let config = HttpCentralConfig::new(Url::parse("https://central.example").unwrap())
            .with_timeout(Duration::from_secs(5))
            .with_stream_idle_timeout(Duration::from_secs(30));
        let central = HttpCentral::new(config).unwrap();
        assert_eq!(central.timeout, Duration::from_secs(5));
        assert_eq!(central.stream_idle_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_decode_messages_stops_after_transport_error() {
        let chunks = vec![
            Err(Error::Network("reset".to_string())),
            Ok(Bytes::from_static(b"{\"kind\":\"END\"}\n")),
        ];
        let messages: Vec<_> = decode_messages(stream::iter(chunks)).collect().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_err());
    }
}
