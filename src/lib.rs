#![forbid(unsafe_code)]
#![doc = r#"
Dify Relay

Serve the OpenAI, Anthropic and Gemini chat APIs on top of a single Dify chat
application. Each caller request is flattened into one Dify `chat-messages`
call; blocking answers and streamed tokens are translated back into the
caller's own wire format.

Crate highlights
- Library: protocol adapters (`adapters`) that decode caller bodies into a
  `ChatRequest` and encode Dify results back, plus the Dify client (`client`)
  with a channel-backed `StreamSession`.
- HTTP server (in `server`): `/v1/chat/completions`, `/v1/messages`,
  `/v1beta/models/{model}:generateContent`, `:streamGenerateContent`, `/status`.

Modules
- `upstream`: Dify request/response/event types.
- `sse`: incremental parser for Dify's SSE stream.
- `client`: blocking and streaming Dify calls.
- `credentials`: per-protocol API key and user extraction.
- `adapters`: the three caller protocols and the shared streaming driver.
- `server`: routes, handlers, error mapping, middleware.
- `config`: flags with environment fallbacks.
- `util`: tracing init, shared state, CORS and SSE helpers.

Note: caller keys are forwarded to Dify as-is and never logged.
"#]

pub mod adapters;
pub mod client;
pub mod config;
pub mod credentials;
pub mod server;
pub mod sse;
pub mod upstream;
pub mod util;

pub use crate::adapters::{
    encode_stream, flatten_conversation, AnthropicAdapter, GeminiAdapter, OpenAiAdapter, Protocol,
    ProtocolAdapter, StreamEncoder,
};
pub use crate::client::{ClientConfig, DifyClient, StreamSession, UpstreamError};
pub use crate::config::Config;
pub use crate::credentials::{extract_credentials, Credentials};
pub use crate::server::{config_routes, ProxyError};
pub use crate::sse::{EventParser, StreamError};
pub use crate::upstream::{BlockingResponse, ChatRequest, TokenEvent, UpstreamEvent};
pub use crate::util::AppState;
