use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

use crate::client::{DifyClient, UpstreamError};
use crate::config::{Config, DEFAULT_MAX_BODY_BYTES};

/// Load an env file and initialize tracing from `RUST_LOG`.
///
/// Env file lookup order: `ENV_FILE`, `ENVFILE`, `DOTENV_PATH`, then `.env` in
/// the working directory. Existing variables are never overwritten, so the
/// file only fills gaps for the flag fallbacks.
pub fn init_tracing() {
    let mut env_source = String::from("none");
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty() && Path::new(p).is_file() && dotenvy::from_filename(p).is_ok() {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Shared, read-only state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: DifyClient,
    pub default_user: String,
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(client: DifyClient, default_user: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            default_user: default_user.into(),
            request_timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, UpstreamError> {
        let client = DifyClient::new(&config.client_config())?;
        Ok(Self::new(client, config.default_user.clone(), config.request_timeout)
            .with_max_body_bytes(config.max_body_bytes))
    }
}

/// JSON error response for paths outside any caller protocol.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(status).json(body)
}

/// `200 OK` builder with the headers every SSE reply carries.
pub fn sse_response() -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .insert_header(("x-accel-buffering", "no"));
    builder
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Comma-separated env list. `None` when unset or `*`.
fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let s = raw.trim();
    if s == "*" {
        return None;
    }
    Some(
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Build CORS settings from environment variables:
/// - CORS_ALLOWED_ORIGINS: comma-separated origins or `*`
/// - CORS_ALLOWED_METHODS: comma-separated methods or `*`
/// - CORS_ALLOWED_HEADERS: comma-separated headers or `*`
/// - CORS_ALLOW_CREDENTIALS: `true`/`1`/`yes`/`on`
/// - CORS_MAX_AGE: seconds
///
/// Anything unset is permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match env_list("CORS_ALLOWED_ORIGINS") {
        Some(origins) => {
            for origin in &origins {
                cors = cors.allowed_origin(origin);
            }
        }
        None => cors = cors.allow_any_origin(),
    }

    match env_list("CORS_ALLOWED_METHODS") {
        Some(methods) if !methods.is_empty() => {
            cors = cors.allowed_methods(methods.iter().map(String::as_str));
        }
        _ => cors = cors.allow_any_method(),
    }

    match env_list("CORS_ALLOWED_HEADERS") {
        Some(headers) if !headers.is_empty() => {
            for h in &headers {
                cors = cors.allowed_header(h.as_str());
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if let Ok(val) = std::env::var("CORS_ALLOW_CREDENTIALS") {
        let v = val.trim().to_ascii_lowercase();
        if matches!(v.as_str(), "1" | "true" | "yes" | "on") {
            cors = cors.supports_credentials();
        }
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
