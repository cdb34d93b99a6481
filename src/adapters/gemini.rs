//! Gemini surface (`POST /v1beta/models/{model}:generateContent` and
//! `:streamGenerateContent`). The model and the streaming choice come from the
//! path, not the body.

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

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<GeminiContent>,
    #[serde(default, alias = "system_instruction")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(default)]
    pub inputs: Inputs,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "file_data")]
    pub file_data: Option<FileData>,
    #[serde(default, alias = "inline_data")]
    pub inline_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    #[serde(default, alias = "mime_type")]
    pub mime_type: String,
    #[serde(alias = "file_uri")]
    pub file_uri: String,
}

impl GeminiContent {
    /// Dify knows `user` and `assistant`; Gemini calls the latter `model`.
    fn role(&self) -> &str {
        match self.role.as_deref() {
            Some("model") => "assistant",
            Some(role) if !role.is_empty() => role,
            _ => "user",
        }
    }

    fn split(&self, files: &mut Vec<FileRef>) -> String {
        let mut text = String::new();
        for part in &self.parts {
            if let Some(t) = &part.text {
                text.push_str(t);
            }
            if let Some(data) = &part.file_data {
                files.push(FileRef::remote(
                    FileKind::from_mime(&data.mime_type),
                    data.file_uri.trim(),
                ));
            }
            if part.inline_data.is_some() {
                debug!("skipping inline data part");
            }
        }
        text
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    pub candidates: Vec<Candidate>,
    pub usage_metadata: UsageMetadata,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: CandidateContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateContent {
    pub role: &'static str,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: u64,
    pub candidates_token_count: u64,
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk<'a> {
    candidates: [Candidate; 1],
    model_version: &'a str,
}

fn candidate(text: &str, finish_reason: Option<&'static str>) -> Candidate {
    Candidate {
        content: CandidateContent {
            role: "model",
            parts: vec![TextPart {
                text: text.to_string(),
            }],
        },
        finish_reason,
        index: 0,
    }
}

pub(crate) fn error_body(status: StatusCode, message: &str) -> serde_json::Value {
    let code = match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => "INVALID_ARGUMENT",
        StatusCode::UNAUTHORIZED => "UNAUTHENTICATED",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::BAD_GATEWAY => "UNAVAILABLE",
        StatusCode::GATEWAY_TIMEOUT => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    };
    json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
            "status": code,
        }
    })
}

// ============================================================================
// Adapter
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

impl ProtocolAdapter for GeminiAdapter {
    type Blocking = GenerateContentResponse;
    type Encoder = GeminiEncoder;

    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    fn decode(&self, body: &[u8], hints: &RequestHints) -> Result<Decoded, DecodeError> {
        let req: GenerateContentRequest = serde_json::from_slice(body)?;
        if req.contents.is_empty() {
            return Err(DecodeError::Empty("contents"));
        }

        let mut files = Vec::new();
        let system = req
            .system_instruction
            .as_ref()
            .map(|s| s.split(&mut Vec::new()));
        let turns: Vec<Turn> = req
            .contents
            .iter()
            .map(|c| Turn::new(c.role(), c.split(&mut files)))
            .collect();

        let query = flatten_conversation(system.as_deref(), &turns);
        let mut request = ChatRequest::new(query, hints.user.as_str());
        request.inputs = req.inputs;
        request.conversation_id = hints.conversation_id.clone();
        request.files = files;

        Ok(Decoded {
            request,
            stream: hints.stream.unwrap_or(false),
            model: non_blank(hints.model.clone()).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    fn encode_blocking(&self, result: &BlockingResponse, model: &str) -> GenerateContentResponse {
        let usage = result.usage();
        GenerateContentResponse {
            candidates: vec![candidate(&result.answer, Some("STOP"))],
            usage_metadata: UsageMetadata {
                prompt_token_count: usage.prompt_tokens,
                candidates_token_count: usage.completion_tokens,
                total_token_count: usage.total_tokens,
            },
            model_version: model.to_string(),
        }
    }

    fn stream_encoder(&self, model: &str) -> GeminiEncoder {
        GeminiEncoder {
            model: model.to_string(),
        }
    }
}

/// One candidate frame per token; no start or stop framing.
pub struct GeminiEncoder {
    model: String,
}

impl StreamEncoder for GeminiEncoder {
    fn token(&mut self, event: &TokenEvent) -> Result<Bytes, serde_json::Error> {
        let chunk = StreamChunk {
            candidates: [candidate(&event.answer, None)],
            model_version: &self.model,
        };
        sse_frame(None, &chunk)
    }
}
