//! Anthropic Messages surface (`POST /v1/messages`).

use actix_web::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::{
    flatten_conversation, non_blank, sse_frame, Decoded, DecodeError, Protocol, ProtocolAdapter,
    RequestHints, StreamEncoder, Turn, DEFAULT_MODEL,
};
use crate::upstream::{BlockingResponse, ChatRequest, FileKind, FileRef, Inputs, TokenEvent};

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<Content>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub inputs: Inputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Content,
}

/// A plain string or a list of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: BlockSource },
    Document { source: BlockSource },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockSource {
    Url { url: String },
    File { file_id: String },
    #[serde(other)]
    Inline,
}

impl Content {
    /// Concatenated text; attachments are pushed onto `files`.
    fn split(&self, files: &mut Vec<FileRef>) -> String {
        let blocks = match self {
            Content::Text(text) => return text.clone(),
            Content::Blocks(blocks) => blocks,
        };
        let mut text = String::new();
        for block in blocks {
            let (kind, source) = match block {
                ContentBlock::Text { text: t } => {
                    text.push_str(t);
                    continue;
                }
                ContentBlock::Image { source } => (FileKind::Image, source),
                ContentBlock::Document { source } => (FileKind::Document, source),
                ContentBlock::Unsupported => continue,
            };
            match source {
                BlockSource::Url { url } => files.push(FileRef::remote(kind, url.trim())),
                BlockSource::File { file_id } => files.push(FileRef::uploaded(kind, file_id.trim())),
                BlockSource::Inline => debug!("skipping inline {:?} block", kind),
            }
        }
        text
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<TextBlock>,
    pub model: String,
    pub stop_reason: &'static str,
    pub stop_sequence: Option<String>,
    pub usage: MessagesUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextBlock {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub(crate) fn error_body(status: StatusCode, message: &str) -> serde_json::Value {
    let kind = match status {
        StatusCode::BAD_REQUEST => "invalid_request_error",
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::NOT_FOUND => "not_found_error",
        StatusCode::PAYLOAD_TOO_LARGE => "request_too_large",
        StatusCode::GATEWAY_TIMEOUT => "timeout_error",
        _ => "api_error",
    };
    json!({
        "type": "error",
        "error": {
            "type": kind,
            "message": message,
        }
    })
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

impl ProtocolAdapter for AnthropicAdapter {
    type Blocking = MessagesResponse;
    type Encoder = AnthropicEncoder;

    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn decode(&self, body: &[u8], hints: &RequestHints) -> Result<Decoded, DecodeError> {
        let req: MessagesRequest = serde_json::from_slice(body)?;
        if req.messages.is_empty() {
            return Err(DecodeError::Empty("messages"));
        }

        let mut files = Vec::new();
        // Attachments in the system prompt are not forwarded.
        let system = req.system.as_ref().map(|s| s.split(&mut Vec::new()));
        let turns: Vec<Turn> = req
            .messages
            .iter()
            .map(|m| Turn::new(m.role.as_str(), m.content.split(&mut files)))
            .collect();

        let query = flatten_conversation(system.as_deref(), &turns);
        let mut request = ChatRequest::new(query, hints.user.as_str());
        request.inputs = req.inputs;
        request.conversation_id = hints.conversation_id.clone();
        request.files = files;

        Ok(Decoded {
            request,
            stream: req.stream,
            model: non_blank(req.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    fn encode_blocking(&self, result: &BlockingResponse, model: &str) -> MessagesResponse {
        let usage = result.usage();
        MessagesResponse {
            id: result.message_id.clone(),
            kind: "message",
            role: "assistant",
            content: vec![TextBlock {
                kind: "text",
                text: result.answer.clone(),
            }],
            model: model.to_string(),
            stop_reason: "end_turn",
            stop_sequence: None,
            usage: MessagesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        }
    }

    fn stream_encoder(&self, model: &str) -> AnthropicEncoder {
        AnthropicEncoder::new(model)
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Where the encoder is in the message lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent yet.
    Start,
    /// `message_start` and `content_block_start` sent; deltas flow.
    Streaming,
    /// `content_block_stop` sent.
    Stopped,
    /// `message_stop` sent.
    Closed,
}

/// Named-event stream: `message_start`, `content_block_start`, one
/// `content_block_delta` per token, `content_block_stop`, `message_stop`.
pub struct AnthropicEncoder {
    id: String,
    model: String,
    phase: Phase,
}

impl AnthropicEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            phase: Phase::Start,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn start_frames(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        let start = json!({
            "type": "message_start",
            "message": {
                "id": self.id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        });
        let block = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        });
        let frames = vec![
            sse_frame(Some("message_start"), &start)?,
            sse_frame(Some("content_block_start"), &block)?,
        ];
        self.phase = Phase::Streaming;
        Ok(frames)
    }
}

impl StreamEncoder for AnthropicEncoder {
    fn open(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        match self.phase {
            Phase::Start => self.start_frames(),
            _ => Ok(Vec::new()),
        }
    }

    fn token(&mut self, event: &TokenEvent) -> Result<Bytes, serde_json::Error> {
        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": event.answer},
        });
        sse_frame(Some("content_block_delta"), &delta)
    }

    fn close(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        let mut frames = Vec::new();
        if self.phase == Phase::Start {
            frames.extend(self.start_frames()?);
        }
        if self.phase == Phase::Streaming {
            frames.push(sse_frame(
                Some("content_block_stop"),
                &json!({"type": "content_block_stop", "index": 0}),
            )?);
            self.phase = Phase::Stopped;
        }
        if self.phase == Phase::Stopped {
            frames.push(sse_frame(
                Some("message_stop"),
                &json!({"type": "message_stop"}),
            )?);
            self.phase = Phase::Closed;
        }
        Ok(frames)
    }
}
