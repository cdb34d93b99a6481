//! Command-line and environment configuration.
//!
//! Every flag falls back to an environment variable, so a `.env` file loaded
//! before parsing can drive the whole process.

use clap::Parser;
use std::time::Duration;

use crate::client::ClientConfig;

/// Default cap on inbound request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dify-relay",
    version,
    about = "Serve OpenAI, Anthropic and Gemini chat APIs on top of a Dify chat app"
)]
pub struct Config {
    /// Dify base URL, either the host or the full /v1/chat-messages endpoint.
    #[arg(long, env = "DIFY_BASE_URL", default_value = "http://localhost")]
    pub dify_base_url: String,

    /// Server-side Dify key. Caller routes always forward the caller's key.
    #[arg(long, env = "DIFY_API_KEY", default_value = "", hide_env_values = true)]
    pub dify_api_key: String,

    /// Forward proxy for Dify requests; the environment proxy is used when empty.
    #[arg(long, env = "DIFY_PROXY_URL", default_value = "")]
    pub dify_proxy_url: String,

    /// Listen address, `host:port` or `:port`.
    #[arg(long, env = "LISTEN_ADDR", default_value = ":8080", value_parser = parse_listen_addr)]
    pub listen_addr: String,

    /// User sent to Dify when the caller does not name one.
    #[arg(long, env = "DEFAULT_USER", default_value = "dify-agent")]
    pub default_user: String,

    /// Deadline for each upstream call, e.g. `90s`, `2m`, `500ms`.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "120s", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// Largest accepted request body in bytes.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,
}

impl Config {
    pub fn client_config(&self) -> ClientConfig {
        let proxy = self.dify_proxy_url.trim();
        ClientConfig {
            base_url: self.dify_base_url.clone(),
            proxy_url: (!proxy.is_empty()).then(|| proxy.to_string()),
        }
    }
}

/// Parse `500ms`, `30s`, `2m`, `1h` or a bare number of seconds. Zero is rejected.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
    };
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

/// Accept `:8080` as shorthand for all interfaces.
pub fn parse_listen_addr(raw: &str) -> Result<String, String> {
    let s = raw.trim();
    let addr = match s.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => s.to_string(),
    };
    let port = addr
        .rsplit_once(':')
        .map(|(_, p)| p)
        .ok_or_else(|| format!("listen address '{raw}' has no port"))?;
    port.parse::<u16>()
        .map_err(|_| format!("invalid port in listen address '{raw}'"))?;
    Ok(addr)
}
