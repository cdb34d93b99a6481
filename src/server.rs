use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::error::{InternalError, PayloadError};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::adapters::{
    encode_stream, non_blank, AnthropicAdapter, DecodeError, EncodeError, GeminiAdapter,
    OpenAiAdapter, Protocol, ProtocolAdapter, RequestHints,
};
use crate::client::UpstreamError;
use crate::credentials::extract_credentials;
use crate::util::{error_response, sse_response, AppState};

/// Request header carrying an existing Dify conversation.
pub const CONVERSATION_HEADER: &str = "x-dify-conversation-id";

const GENERATE_ACTION: &str = "generateContent";
const STREAM_GENERATE_ACTION: &str = "streamGenerateContent";

/// Optional state hints accepted on every chat route.
#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    /// Continue this Dify conversation.
    pub conversation_id: Option<String>,
}

/// Everything that can stop a proxied call.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing api key")]
    MissingCredential,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Raised after the response head is sent; the connection is dropped.
    #[error("stream aborted: {0}")]
    Stream(#[from] EncodeError),
    #[error("{0}")]
    NotFound(String),
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("read body: {0}")]
    Payload(#[from] PayloadError),
}

impl ProxyError {
    /// Message shown to the caller.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Upstream(err) if err.is_timeout() => "upstream timeout".to_string(),
            ProxyError::Upstream(err) => format!("upstream error: {err}"),
            other => other.to_string(),
        }
    }

    /// Error reply in the caller protocol's envelope.
    pub fn render(&self, protocol: Protocol) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(protocol.error_body(status, &self.public_message()))
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingCredential => StatusCode::UNAUTHORIZED,
            ProxyError::Decode(_) | ProxyError::Payload(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        error_response(self.status_code(), &self.public_message())
    }
}

/// Register the caller-facing routes.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/messages", web::post().to(messages))
            .route("/v1beta/models/{target}", web::post().to(generate_content)),
    );
}

async fn status(state: web::Data<AppState>) -> impl Responder {
    web::Json(serde_json::json!({
        "name": "dify-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": state.client.chat_url(),
        "routes": [
            "/status",
            "/v1/chat/completions",
            "/v1/messages",
            "/v1beta/models/{model}:generateContent",
            "/v1beta/models/{model}:streamGenerateContent",
        ],
    }))
}

async fn chat_completions(state: web::Data<AppState>, req: HttpRequest, body: web::Payload) -> HttpResponse {
    dispatch(OpenAiAdapter, &state, &req, body, RequestHints::default()).await
}

async fn messages(state: web::Data<AppState>, req: HttpRequest, body: web::Payload) -> HttpResponse {
    dispatch(AnthropicAdapter, &state, &req, body, RequestHints::default()).await
}

async fn generate_content(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
) -> HttpResponse {
    let Some((model, stream)) = parse_gemini_target(&path) else {
        let err = ProxyError::NotFound(format!("unknown method '{}'", path.as_str()));
        return err.render(Protocol::Gemini);
    };
    let hints = RequestHints {
        model: Some(model.to_string()),
        stream: Some(stream),
        ..Default::default()
    };
    dispatch(GeminiAdapter, &state, &req, body, hints).await
}

/// Split `gemini-pro:streamGenerateContent` into the model and the streaming flag.
pub fn parse_gemini_target(target: &str) -> Option<(&str, bool)> {
    let (model, action) = target.rsplit_once(':')?;
    match action {
        GENERATE_ACTION => Some((model, false)),
        STREAM_GENERATE_ACTION => Some((model, true)),
        _ => None,
    }
}

/// Conversation id from the query string or the `X-Dify-Conversation-Id` header.
fn conversation_hint(req: &HttpRequest) -> Option<String> {
    let from_query = web::Query::<ChatQuery>::from_query(req.query_string())
        .ok()
        .and_then(|q| non_blank(q.into_inner().conversation_id));
    from_query.or_else(|| {
        let header = req
            .headers()
            .get(CONVERSATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        non_blank(header)
    })
}

async fn dispatch<A: ProtocolAdapter>(
    adapter: A,
    state: &AppState,
    req: &HttpRequest,
    body: web::Payload,
    hints: RequestHints,
) -> HttpResponse {
    let protocol = adapter.protocol();
    match proxy(&adapter, state, req, body, hints).await {
        Ok(resp) => resp,
        Err(err) => {
            if matches!(err, ProxyError::Upstream(_)) {
                warn!(protocol = protocol.as_str(), error = %err, "upstream call failed");
            }
            err.render(protocol)
        }
    }
}

/// Authenticate, decode, call Dify and encode the reply.
async fn proxy<A: ProtocolAdapter>(
    adapter: &A,
    state: &AppState,
    req: &HttpRequest,
    body: web::Payload,
    mut hints: RequestHints,
) -> Result<HttpResponse, ProxyError> {
    let protocol = adapter.protocol();
    let creds = extract_credentials(
        protocol,
        req.headers(),
        req.query_string(),
        &state.default_user,
    );
    if !creds.has_key() {
        return Err(ProxyError::MissingCredential);
    }

    let body = read_body(body, state.max_body_bytes).await?;
    hints.user = creds.user.clone();
    hints.conversation_id = conversation_hint(req);
    let decoded = adapter.decode(&body, &hints)?;
    let deadline = Instant::now() + state.request_timeout;

    if decoded.stream {
        let session = state
            .client
            .send_streaming(&creds, decoded.request, deadline)
            .await?;
        let frames = encode_stream(session, adapter.stream_encoder(&decoded.model)).map_err(
            move |err| {
                warn!(protocol = protocol.as_str(), error = %err, "stream aborted");
                ProxyError::Stream(err)
            },
        );
        return Ok(sse_response().streaming(frames));
    }

    let result = state
        .client
        .send_blocking(&creds, decoded.request, deadline)
        .await?;
    let mut builder = HttpResponse::Ok();
    if !result.conversation_id.is_empty() {
        builder.insert_header((CONVERSATION_HEADER, result.conversation_id.as_str()));
    }
    Ok(builder.json(adapter.encode_blocking(&result, &decoded.model)))
}

/// Collect the request body, failing once it passes `limit` bytes.
async fn read_body(mut payload: web::Payload, limit: usize) -> Result<web::Bytes, ProxyError> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// One log line per request.
pub async fn log_requests(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let method = req.method().to_string();
    let path = req.path().to_string();
    let peer = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let started = StdInstant::now();

    let res = next.call(req).await?;
    info!(
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        peer = %peer,
        "request"
    );
    Ok(res)
}

/// Turn a panicking handler into a 500 instead of a dropped connection.
///
/// The request is not held across the inner call; routing needs sole
/// ownership of it.
pub async fn recover_panics<B: MessageBody + 'static>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<B>, actix_web::Error> {
    let path = req.path().to_string();
    match AssertUnwindSafe(next.call(req)).catch_unwind().await {
        Ok(res) => res,
        Err(_) => {
            error!(path = %path, "handler panicked");
            let resp = error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            Err(InternalError::from_response("handler panicked", resp).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, DifyClient};
    use crate::sse::StreamError;
    use crate::util::cors_config_from_env;
    use actix_web::{middleware, test as actix_test, App};
    use std::time::Duration;

    fn state() -> AppState {
        // Nothing listens here; tests that reach the network would fail.
        let client = DifyClient::new(&ClientConfig {
            base_url: "http://127.0.0.1:9".into(),
            proxy_url: None,
        })
        .unwrap();
        AppState::new(client, "tester", Duration::from_secs(2))
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            ProxyError::MissingCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::Decode(DecodeError::Empty("messages")).status_code(),
            StatusCode::BAD_REQUEST
        );
        let boom = ProxyError::Upstream(UpstreamError::Status {
            status: 500,
            body: "boom".into(),
        });
        assert_eq!(boom.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(boom.public_message(), "upstream error: dify 500: boom");

        let timeout = ProxyError::Upstream(UpstreamError::Timeout);
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.public_message(), "upstream timeout");

        let aborted = ProxyError::Stream(EncodeError::Transport(StreamError::DeadlineExceeded));
        assert_eq!(aborted.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn gemini_targets() {
        assert_eq!(
            parse_gemini_target("gemini-pro:generateContent"),
            Some(("gemini-pro", false))
        );
        assert_eq!(
            parse_gemini_target("models:x:streamGenerateContent"),
            Some(("models:x", true))
        );
        assert_eq!(parse_gemini_target("gemini-pro:countTokens"), None);
        assert_eq!(parse_gemini_target("gemini-pro"), None);
    }

    #[actix_web::test]
    async fn missing_key_is_rejected_in_protocol_envelope() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(config_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/v1/messages")
            .set_json(serde_json::json!({"max_tokens": 1, "messages": [{"role": "user", "content": "hi"}]}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[actix_web::test]
    async fn bad_body_is_400() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(config_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(("authorization", "Bearer k"))
            .set_json(serde_json::json!({"messages": []}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "messages must not be empty");
    }

    #[actix_web::test]
    async fn unknown_gemini_action_is_404() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(config_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/v1beta/models/gemini-pro:countTokens?key=k")
            .set_json(serde_json::json!({"contents": []}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["status"], "NOT_FOUND");
    }

    #[actix_web::test]
    async fn status_lists_routes() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .configure(config_routes),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/status").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["name"], "dify-relay");
        assert_eq!(body["upstream"], "http://127.0.0.1:9/v1/chat-messages");
    }

    #[actix_web::test]
    async fn oversized_body_is_413_in_protocol_envelope() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state().with_max_body_bytes(64)))
                .configure(config_routes),
        )
        .await;

        let long = "x".repeat(200);
        let req = actix_test::TestRequest::post()
            .uri("/v1/messages")
            .insert_header(("x-api-key", "k"))
            .set_json(serde_json::json!({"max_tokens": 1, "messages": [{"role": "user", "content": long}]}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "request_too_large");
        assert_eq!(body["error"]["message"], "request body exceeds 64 bytes");
    }

    #[actix_web::test]
    async fn full_middleware_stack_serves_requests() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .wrap(middleware::from_fn(log_requests))
                .wrap(cors_config_from_env())
                .wrap(middleware::from_fn(recover_panics))
                .configure(config_routes),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/status").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = actix_test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    async fn explode() -> HttpResponse {
        panic!("handler bug")
    }

    async fn fine() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn panics_become_500() {
        let app = actix_test::init_service(
            App::new()
                .wrap(middleware::from_fn(log_requests))
                .wrap(middleware::from_fn(recover_panics))
                .route("/explode", web::get().to(explode))
                .route("/ok", web::get().to(fine)),
        )
        .await;

        // The server renders middleware errors; do the same here.
        let req = actix_test::TestRequest::get().uri("/explode").to_request();
        let err = actix_test::try_call_service(&app, req)
            .await
            .err()
            .expect("panic surfaces as an error");
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "internal server error");

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ok").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
