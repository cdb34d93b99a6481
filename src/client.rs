//! Dify chat-messages client.
//!
//! Blocking calls return the whole answer; streaming calls hand back a
//! `StreamSession` fed by a background drainer task that owns the response
//! body for its whole lifetime.

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use reqwest::header;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::credentials::Credentials;
use crate::sse::{EventParser, StreamError};
use crate::upstream::{BlockingResponse, ChatRequest, ResponseMode, UpstreamEvent};

const CHAT_MESSAGES_PATH: &str = "/v1/chat-messages";

/// Header carrying the end-user identity to the backend.
pub const USER_HEADER: &str = "AIGC-USER";

/// Buffered events between the drainer and the encoder.
pub const SESSION_CAPACITY: usize = 16;

/// Failure talking to the backend before a stream is established, or during a
/// blocking call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("dify {status}: {body}")]
    Status { status: u16, body: String },
    #[error("dify request: {0}")]
    Transport(String),
    #[error("dify request: deadline exceeded")]
    Timeout,
    #[error("decode response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// True when the failure is (or reads like) a deadline or timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self, UpstreamError::Timeout) {
            return true;
        }
        let text = self.to_string().to_ascii_lowercase();
        text.contains("deadline") || text.contains("timeout") || text.contains("timed out")
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

/// Connection settings for the backend.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Base host or the full `/v1/chat-messages` endpoint.
    pub base_url: String,
    /// Explicit forward proxy; the environment proxy is used when absent.
    pub proxy_url: Option<String>,
}

/// Resolve the chat-messages endpoint from a base host or full URL.
pub fn chat_messages_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with(CHAT_MESSAGES_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{CHAT_MESSAGES_PATH}")
    }
}

/// Client for one Dify chat application. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct DifyClient {
    chat_url: String,
    http: reqwest::Client,
}

impl DifyClient {
    /// Build the client. Fails when the proxy URL cannot be parsed.
    pub fn new(config: &ClientConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder();

        // reqwest picks up HTTP(S)_PROXY on its own unless told otherwise.
        if let Some(proxy) = config.proxy_url.as_deref().map(str::trim) {
            if !proxy.is_empty() {
                let p = reqwest::Proxy::all(proxy)
                    .map_err(|e| UpstreamError::Transport(format!("invalid proxy url: {e}")))?;
                builder = builder.proxy(p);
            }
        }

        builder = builder.user_agent(format!("dify-relay/{}", env!("CARGO_PKG_VERSION")));
        let http = builder
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(Self {
            chat_url: chat_messages_url(&config.base_url),
            http,
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    fn request(&self, creds: &Credentials, body: &ChatRequest) -> reqwest::RequestBuilder {
        let mut rb = self
            .http
            .post(&self.chat_url)
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(creds.api_key())
            .json(body);
        if !body.user.is_empty() {
            rb = rb.header(USER_HEADER, body.user.as_str());
        }
        rb
    }

    /// Send a blocking request. The deadline covers connect, send and reading
    /// the whole body.
    pub async fn send_blocking(
        &self,
        creds: &Credentials,
        mut request: ChatRequest,
        deadline: Instant,
    ) -> Result<BlockingResponse, UpstreamError> {
        request.response_mode = ResponseMode::Blocking;
        debug!(url = %self.chat_url, user = %request.user, "dify blocking request");

        let call = async {
            let resp = self
                .request(creds, &request)
                .send()
                .await
                .map_err(UpstreamError::from_reqwest)?;

            let status = resp.status();
            let bytes = resp.bytes().await.map_err(UpstreamError::from_reqwest)?;
            if !status.is_success() {
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            serde_json::from_slice::<BlockingResponse>(&bytes)
                .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
        };

        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        }
    }

    /// Send a streaming request.
    ///
    /// A non-2xx status fails here, after the body has been read and released;
    /// no session is created. Once a session is returned, failures arrive as
    /// its terminal event.
    pub async fn send_streaming(
        &self,
        creds: &Credentials,
        mut request: ChatRequest,
        deadline: Instant,
    ) -> Result<StreamSession, UpstreamError> {
        request.response_mode = ResponseMode::Streaming;
        debug!(url = %self.chat_url, user = %request.user, "dify streaming request");

        let send = self
            .request(creds, &request)
            .header(header::ACCEPT, "text/event-stream")
            .send();
        let resp = match tokio::time::timeout_at(deadline, send).await {
            Ok(result) => result.map_err(UpstreamError::from_reqwest)?,
            Err(_) => return Err(UpstreamError::Timeout),
        };

        let status = resp.status();
        if !status.is_success() {
            let body = match tokio::time::timeout_at(deadline, resp.bytes()).await {
                Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            };
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(StreamSession::spawn(resp.bytes_stream(), deadline))
    }
}

/// Live stream of upstream events, in arrival order.
///
/// Dropping the session tells the drainer to stop; the drainer then drops the
/// parser and with it the upstream body. A session the drainer had to abandon
/// past the deadline ends with `Transport(DeadlineExceeded)` after the
/// buffered events, never with a bare end of stream.
pub struct StreamSession {
    rx: mpsc::Receiver<UpstreamEvent>,
    cut_short: Arc<AtomicBool>,
    reported: bool,
}

impl StreamSession {
    /// Start a drainer over `body` and return the consuming end.
    pub fn spawn<S, E>(body: S, deadline: Instant) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);
        let cut_short = Arc::new(AtomicBool::new(false));
        tokio::spawn(drain(EventParser::new(body), tx, deadline, cut_short.clone()));
        Self {
            rx,
            cut_short,
            reported: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(rx: mpsc::Receiver<UpstreamEvent>) -> Self {
        Self {
            rx,
            cut_short: Arc::new(AtomicBool::new(false)),
            reported: false,
        }
    }
}

impl Stream for StreamSession {
    type Item = UpstreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(None) if !this.reported && this.cut_short.load(Ordering::Acquire) => {
                this.reported = true;
                Poll::Ready(Some(UpstreamEvent::Transport(StreamError::DeadlineExceeded)))
            }
            other => other,
        }
    }
}

/// Forward parsed events into the session channel until the parser ends, a
/// terminal event is sent, the deadline passes, or the consumer goes away.
///
/// `cut_short` is raised before `tx` is dropped whenever an event could not be
/// handed over in time.
async fn drain<S, E>(
    mut events: EventParser<S>,
    tx: mpsc::Sender<UpstreamEvent>,
    deadline: Instant,
    cut_short: Arc<AtomicBool>,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("stream consumer went away; closing upstream body");
                break;
            }
            _ = &mut expired => Some(UpstreamEvent::Transport(StreamError::DeadlineExceeded)),
            next = events.next() => next,
        };

        let Some(event) = next else { break };
        let terminal = event.is_terminal();
        if terminal {
            warn!(event = ?event, "dify stream ended with error");
        }

        // Give a stalled consumer a moment past the deadline to take the final event.
        let limit = deadline.max(Instant::now()) + Duration::from_millis(50);
        match tokio::time::timeout_at(limit, tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("stream consumer too slow past the deadline; ending session");
                cut_short.store(true, Ordering::Release);
                break;
            }
        }
        if terminal {
            break;
        }
    }
    // `events` owns the body; it is released here on every path.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{encode_stream, EncodeError, OpenAiAdapter, ProtocolAdapter};
    use futures_util::stream;

    #[test]
    fn chat_url_accepts_host_or_full_endpoint() {
        assert_eq!(
            chat_messages_url("http://localhost"),
            "http://localhost/v1/chat-messages"
        );
        assert_eq!(
            chat_messages_url("https://aigc.example.com/dify/server/"),
            "https://aigc.example.com/dify/server/v1/chat-messages"
        );
        assert_eq!(
            chat_messages_url("https://h/v1/chat-messages/"),
            "https://h/v1/chat-messages"
        );
    }

    #[test]
    fn timeout_classification() {
        assert!(UpstreamError::Timeout.is_timeout());
        assert!(UpstreamError::Status {
            status: 504,
            body: "gateway timeout".into()
        }
        .is_timeout());
        assert!(!UpstreamError::Status {
            status: 500,
            body: "boom".into()
        }
        .is_timeout());
        assert!(!UpstreamError::Transport("connection refused".into()).is_timeout());
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        let config = ClientConfig {
            base_url: "http://localhost".into(),
            proxy_url: Some("::not a url::".into()),
        };
        assert!(DifyClient::new(&config).is_err());
    }

    /// Body stream that flags when it is dropped.
    struct TrackedBody<S> {
        inner: S,
        dropped: Arc<AtomicBool>,
    }

    impl<S> Drop for TrackedBody<S> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl<S: Stream + Unpin> Stream for TrackedBody<S> {
        type Item = S::Item;
        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
            Pin::new(&mut self.get_mut().inner).poll_next(cx)
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    async fn wait_for(flag: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("body was not released");
    }

    #[tokio::test]
    async fn session_delivers_in_order_and_releases_body() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = TrackedBody {
            inner: stream::iter(vec![
                Ok::<_, std::io::Error>(Bytes::from_static(
                    b"data: {\"event\":\"message\",\"answer\":\"1\"}\n\n",
                )),
                Ok(Bytes::from_static(
                    b"data: {\"event\":\"message\",\"answer\":\"2\"}\n\n",
                )),
            ]),
            dropped: dropped.clone(),
        };
        let mut session = StreamSession::spawn(body, far_deadline());
        let mut answers = Vec::new();
        while let Some(event) = session.next().await {
            if let UpstreamEvent::Token(t) = event {
                answers.push(t.answer);
            }
        }
        assert_eq!(answers, vec!["1", "2"]);
        wait_for(&dropped).await;
    }

    #[tokio::test]
    async fn abandoning_session_releases_idle_body() {
        let dropped = Arc::new(AtomicBool::new(false));
        let first = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"event\":\"message\",\"answer\":\"x\"}\n\n",
        ))]);
        let body = TrackedBody {
            inner: first.chain(stream::pending()),
            dropped: dropped.clone(),
        };
        let mut session = StreamSession::spawn(body, far_deadline());
        assert!(session.next().await.is_some());
        drop(session);
        wait_for(&dropped).await;
    }

    #[tokio::test]
    async fn deadline_ends_session_with_transport_error() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = TrackedBody {
            inner: stream::pending::<Result<Bytes, std::io::Error>>(),
            dropped: dropped.clone(),
        };
        let mut session =
            StreamSession::spawn(body, Instant::now() + Duration::from_millis(20));
        match session.next().await {
            Some(UpstreamEvent::Transport(StreamError::DeadlineExceeded)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.next().await.is_none());
        wait_for(&dropped).await;
    }

    fn token_block(answer: usize) -> Result<Bytes, std::io::Error> {
        Ok(Bytes::from(format!(
            "data: {{\"event\":\"message\",\"answer\":\"{answer}\"}}\n\n"
        )))
    }

    #[tokio::test]
    async fn slow_consumer_past_deadline_sees_deadline_error() {
        let blocks: Vec<_> = (0..40).map(token_block).collect();
        let body = stream::iter(blocks).chain(stream::pending());
        let mut session =
            StreamSession::spawn(body, Instant::now() + Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut tokens = 0;
        let mut last = None;
        while let Some(event) = session.next().await {
            match event {
                UpstreamEvent::Token(_) => tokens += 1,
                other => last = Some(other),
            }
        }
        assert!(tokens < 40, "all {tokens} tokens arrived");
        assert!(matches!(
            last,
            Some(UpstreamEvent::Transport(StreamError::DeadlineExceeded))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_not_closed_as_complete() {
        let blocks: Vec<_> = (0..40).map(token_block).collect();
        let body = stream::iter(blocks).chain(stream::pending());
        let session = StreamSession::spawn(body, Instant::now() + Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let frames = encode_stream(session, OpenAiAdapter.stream_encoder("gpt-4o"));
        futures_util::pin_mut!(frames);
        let mut sent = Vec::new();
        let mut failure = None;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => sent.push(frame),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(
            failure,
            Some(EncodeError::Transport(StreamError::DeadlineExceeded))
        ));
        assert!(sent.iter().all(|f| &f[..] != b"data: [DONE]\n\n"));
    }
}
