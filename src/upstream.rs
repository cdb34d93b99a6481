//! Dify wire types.
//!
//! `ChatRequest` is the normalized request every caller protocol decodes into;
//! `BlockingResponse` and `UpstreamEvent` are what comes back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open value type for Dify `inputs`: strings, numbers, booleans, lists and
/// nested maps. `null` is not accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    /// Kept as parsed so large integers survive unchanged.
    Number(serde_json::Number),
    Text(String),
    List(Vec<InputValue>),
    Map(BTreeMap<String, InputValue>),
}

pub type Inputs = BTreeMap<String, InputValue>;

/// Response mode sent as `response_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Blocking,
    Streaming,
}

/// Kind of an attached file, as Dify names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Document,
    Audio,
    Video,
    Custom,
}

impl FileKind {
    /// Classify a MIME type such as `image/png`.
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or("").trim() {
            "image" => FileKind::Image,
            "audio" => FileKind::Audio,
            "video" => FileKind::Video,
            "text" | "application" => FileKind::Document,
            _ => FileKind::Custom,
        }
    }
}

/// Where the backend fetches the file from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transfer_method", rename_all = "snake_case")]
pub enum FileSource {
    RemoteUrl { url: String },
    LocalFile { upload_file_id: String },
}

/// A file attachment (`files[]` entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(flatten)]
    pub source: FileSource,
}

impl FileRef {
    pub fn remote(kind: FileKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            source: FileSource::RemoteUrl { url: url.into() },
        }
    }

    pub fn uploaded(kind: FileKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            source: FileSource::LocalFile {
                upload_file_id: id.into(),
            },
        }
    }
}

/// Body of `POST /v1/chat-messages`.
///
/// Built once per inbound call by an adapter and moved into the client, which
/// only sets `response_mode` before serializing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub inputs: Inputs,
    pub query: String,
    pub response_mode: ResponseMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub user: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            inputs: Inputs::new(),
            query: query.into(),
            response_mode: ResponseMode::Blocking,
            conversation_id: None,
            user: user.into(),
            files: Vec::new(),
        }
    }
}

/// Full answer for `response_mode = blocking`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BlockingResponse {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub created_at: i64,
}

/// Token counts reported under `metadata.usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl BlockingResponse {
    /// Usage from `metadata.usage`, zeros when absent or unreadable.
    pub fn usage(&self) -> Usage {
        self.metadata
            .get("usage")
            .and_then(|v| serde_json::from_value::<Usage>(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Dify sends `null` for some ids on non-message events; treat it as absent.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One incremental event of a streaming answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TokenEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub event: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub conversation_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub answer: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: i64,
}

impl TokenEvent {
    /// Only `message` and `agent_message` events carry answer text.
    pub fn carries_answer(&self) -> bool {
        matches!(self.event.as_str(), "message" | "agent_message")
    }
}

/// An `error` event sent by Dify in the middle of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct UpstreamFailure {
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dify stream error {} ({}): {}", self.status, self.code, self.message)
    }
}

/// Typed event produced by the parser from one SSE `data:` block.
#[derive(Debug)]
pub enum UpstreamEvent {
    Token(TokenEvent),
    Failed(UpstreamFailure),
    Transport(crate::sse::StreamError),
}

impl UpstreamEvent {
    /// Terminal events end the sequence.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpstreamEvent::Token(_))
    }
}
