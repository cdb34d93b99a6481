//! OpenAI Chat Completions surface (`POST /v1/chat/completions`).

use actix_web::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    flatten_conversation, non_blank, sse_frame, Decoded, DecodeError, Protocol, ProtocolAdapter,
    RequestHints, StreamEncoder, Turn, DEFAULT_MODEL,
};
use crate::upstream::{BlockingResponse, ChatRequest, FileKind, FileRef, Inputs, TokenEvent};
use crate::util::unix_now;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Dify app variables, passed through as `inputs`.
    #[serde(default)]
    pub inputs: Inputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FilePart },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePart {
    #[serde(default)]
    pub file_id: Option<String>,
}

impl ChatMessage {
    /// Text of the message plus any attachments it references.
    fn split(&self, files: &mut Vec<FileRef>) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(t),
                        ContentPart::ImageUrl { image_url } => {
                            let url = image_url.url.trim();
                            if url.starts_with("http://") || url.starts_with("https://") {
                                files.push(FileRef::remote(FileKind::Image, url));
                            } else {
                                debug!("skipping inline image data");
                            }
                        }
                        ContentPart::File { file } => {
                            match non_blank(file.file_id.clone()) {
                                Some(id) => files.push(FileRef::uploaded(FileKind::Document, id)),
                                None => debug!("skipping file part without file_id"),
                            }
                        }
                        ContentPart::Unsupported => {}
                    }
                }
                text
            }
        }
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ChatChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    choices: [ChunkChoice<'a>; 1],
}

#[derive(Debug, Clone, Serialize)]
struct ChunkChoice<'a> {
    index: u32,
    delta: Delta<'a>,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
struct Delta<'a> {
    content: &'a str,
}

pub(crate) fn error_body(status: StatusCode, message: &str) -> serde_json::Value {
    let kind = match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => "invalid_request_error",
        StatusCode::UNAUTHORIZED => "authentication_error",
        StatusCode::NOT_FOUND => "not_found_error",
        StatusCode::GATEWAY_TIMEOUT => "timeout_error",
        _ => "api_error",
    };
    json!({
        "error": {
            "message": message,
            "type": kind,
            "code": null,
        }
    })
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl ProtocolAdapter for OpenAiAdapter {
    type Blocking = ChatCompletion;
    type Encoder = OpenAiEncoder;

    fn protocol(&self) -> Protocol {
        Protocol::OpenAi
    }

    fn decode(&self, body: &[u8], hints: &RequestHints) -> Result<Decoded, DecodeError> {
        let req: ChatCompletionRequest = serde_json::from_slice(body)?;
        if req.messages.is_empty() {
            return Err(DecodeError::Empty("messages"));
        }

        let mut files = Vec::new();
        let turns: Vec<Turn> = req
            .messages
            .iter()
            .map(|m| Turn::new(m.role.as_str(), m.split(&mut files)))
            .collect();

        let mut request = ChatRequest::new(flatten_conversation(None, &turns), hints.user.as_str());
        request.inputs = req.inputs;
        request.conversation_id = hints.conversation_id.clone();
        request.files = files;

        Ok(Decoded {
            request,
            stream: req.stream,
            model: non_blank(req.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    fn encode_blocking(&self, result: &BlockingResponse, model: &str) -> ChatCompletion {
        let usage = result.usage();
        ChatCompletion {
            id: result.message_id.clone(),
            object: "chat.completion",
            created: unix_now(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content: result.answer.clone(),
                },
                finish_reason: "stop",
            }],
            usage: ChatUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        }
    }

    fn stream_encoder(&self, model: &str) -> OpenAiEncoder {
        OpenAiEncoder {
            model: model.to_string(),
            created: unix_now(),
        }
    }
}

/// One `chat.completion.chunk` per token, then `[DONE]`.
pub struct OpenAiEncoder {
    model: String,
    created: i64,
}

impl StreamEncoder for OpenAiEncoder {
    fn token(&mut self, event: &TokenEvent) -> Result<Bytes, serde_json::Error> {
        let chunk = ChatChunk {
            id: &event.message_id,
            object: "chat.completion.chunk",
            created: self.created,
            model: &self.model,
            choices: [ChunkChoice {
                index: 0,
                delta: Delta {
                    content: &event.answer,
                },
                finish_reason: None,
            }],
        };
        sse_frame(None, &chunk)
    }

    fn close(&mut self) -> Result<Vec<Bytes>, serde_json::Error> {
        Ok(vec![Bytes::from_static(DONE_FRAME)])
    }
}
