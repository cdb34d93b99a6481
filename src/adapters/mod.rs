//! Caller protocol adapters.
//!
//! Each adapter decodes one vendor request shape into a `ChatRequest` and
//! encodes Dify results back into that vendor's blocking or streaming shape.
//! The streaming half is split into a per-protocol `StreamEncoder` (frame
//! layout) and the shared `encode_stream` driver (event filtering, ordering,
//! termination).

pub mod anthropic;
pub mod gemini;
pub mod openai;

use actix_web::http::StatusCode;
use async_stream::try_stream;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;

use crate::client::StreamSession;
use crate::sse::StreamError;
use crate::upstream::{BlockingResponse, ChatRequest, TokenEvent, UpstreamEvent, UpstreamFailure};

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Model name echoed back when the caller did not name one.
pub const DEFAULT_MODEL: &str = "dify";

/// The caller-facing wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
            Protocol::Gemini => "gemini",
        }
    }

    /// Error body in the protocol's own envelope.
    pub fn error_body(&self, status: StatusCode, message: &str) -> serde_json::Value {
        match self {
            Protocol::OpenAi => openai::error_body(status, message),
            Protocol::Anthropic => anthropic::error_body(status, message),
            Protocol::Gemini => gemini::error_body(status, message),
        }
    }
}

/// Request facts that do not come from the body.
#[derive(Debug, Clone, Default)]
pub struct RequestHints {
    pub user: String,
    pub conversation_id: Option<String>,
    /// Model named in the URL (Gemini).
    pub model: Option<String>,
    /// Streaming chosen by the URL (Gemini).
    pub stream: Option<bool>,
}

/// Result of decoding one caller request.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub request: ChatRequest,
    pub stream: bool,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decode body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Failure while encoding a live stream. The response is already underway, so
/// the connection is closed rather than answered.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("upstream aborted stream: {0}")]
    Upstream(UpstreamFailure),
    #[error(transparent)]
    Transport(#[from] StreamError),
    #[error("encode frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Frame layout of one protocol's streaming reply.
pub trait StreamEncoder {
    /// Frames sent before any upstream event.
    fn open(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        Ok(Vec::new())
    }

    /// Frame for one answer fragment.
    fn token(&mut self, event: &TokenEvent) -> Result<Bytes, serde_json::Error>;

    /// Frames sent after the upstream stream ended cleanly.
    fn close(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        Ok(Vec::new())
    }
}

/// One caller wire format.
pub trait ProtocolAdapter: Send + Sync + 'static {
    type Blocking: Serialize;
    type Encoder: StreamEncoder + Send + 'static;

    fn protocol(&self) -> Protocol;

    fn decode(&self, body: &[u8], hints: &RequestHints) -> Result<Decoded, DecodeError>;

    fn encode_blocking(&self, result: &BlockingResponse, model: &str) -> Self::Blocking;

    fn stream_encoder(&self, model: &str) -> Self::Encoder;
}

/// Drive `encoder` over a live session.
///
/// Only `message` and `agent_message` events produce frames. A terminal error
/// ends the stream with `Err` and without the closing frames.
pub fn encode_stream<E>(
    mut session: StreamSession,
    mut encoder: E,
) -> impl Stream<Item = Result<Bytes, EncodeError>>
where
    E: StreamEncoder + Send + 'static,
{
    try_stream! {
        for frame in encoder.open()? {
            yield frame;
        }
        while let Some(event) = session.next().await {
            match event {
                UpstreamEvent::Token(token) => {
                    if token.carries_answer() {
                        yield encoder.token(&token)?;
                    }
                }
                UpstreamEvent::Failed(failure) => Err(EncodeError::Upstream(failure))?,
                UpstreamEvent::Transport(err) => Err(EncodeError::Transport(err))?,
            }
        }
        for frame in encoder.close()? {
            yield frame;
        }
    }
}

/// One conversation turn reduced to plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: String,
    pub text: String,
}

impl Turn {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Collapse a conversation into a single query.
///
/// One turn: its text verbatim. Several turns: every turn but the last as a
/// `role: text` line, then the last turn's text unprefixed. A non-empty system
/// instruction becomes a leading `system: ...` line.
pub fn flatten_conversation(system: Option<&str>, turns: &[Turn]) -> String {
    let mut out = String::new();
    if let Some(sys) = system.filter(|s| !s.is_empty()) {
        out.push_str("system: ");
        out.push_str(sys);
        out.push('\n');
    }

    let Some((last, prior)) = turns.split_last() else {
        return out;
    };
    for turn in prior {
        out.push_str(&turn.role);
        out.push_str(": ");
        out.push_str(&turn.text);
        out.push('\n');
    }
    out.push_str(&last.text);
    out
}

/// Serialize one `data:` frame, optionally with a named `event:` line.
pub fn sse_frame<T: Serialize>(event: Option<&str>, payload: &T) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_vec(payload)?;
    let mut out = Vec::with_capacity(data.len() + 32);
    if let Some(name) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&data);
    out.extend_from_slice(b"\n\n");
    Ok(Bytes::from(out))
}

/// Treat blank strings as absent.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
