//! Caller credential extraction.
//!
//! Precedence for the API key: the protocol's native credential (Anthropic
//! `x-api-key`, Gemini `x-goog-api-key` or `?key=`), then the gateway header
//! `X-Dify-Api-Key`, then `Authorization: Bearer`. The user comes from
//! `X-Dify-User`, falling back to the configured default.

use actix_web::http::header::{HeaderMap, AUTHORIZATION};
use actix_web::web;
use std::collections::HashMap;
use std::fmt;

use crate::adapters::Protocol;

pub const DIFY_API_KEY_HEADER: &str = "x-dify-api-key";
pub const DIFY_USER_HEADER: &str = "x-dify-user";
pub const ANTHROPIC_API_KEY_HEADER: &str = "x-api-key";
pub const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";
pub const GEMINI_API_KEY_PARAM: &str = "key";

/// Per-request backend credentials. Never persisted; the key is redacted from
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    pub user: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            user: user.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.has_key() { "<redacted>" } else { "" })
            .field("user", &self.user)
            .finish()
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(|c: char| c.is_ascii_whitespace())?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|s| !s.is_empty())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    web::Query::<HashMap<String, String>>::from_query(query)
        .ok()
        .and_then(|q| q.get(name).map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}

fn native_key(protocol: Protocol, headers: &HeaderMap, query: &str) -> Option<String> {
    match protocol {
        Protocol::OpenAi => None,
        Protocol::Anthropic => header_value(headers, ANTHROPIC_API_KEY_HEADER),
        Protocol::Gemini => header_value(headers, GEMINI_API_KEY_HEADER)
            .or_else(|| query_param(query, GEMINI_API_KEY_PARAM)),
    }
}

/// Resolve credentials for one inbound request. Returns an empty key when none
/// was supplied; the caller decides how to reject it.
pub fn extract_credentials(
    protocol: Protocol,
    headers: &HeaderMap,
    query: &str,
    default_user: &str,
) -> Credentials {
    let api_key = native_key(protocol, headers, query)
        .or_else(|| header_value(headers, DIFY_API_KEY_HEADER))
        .or_else(|| bearer_token(headers))
        .unwrap_or_default();

    let user = header_value(headers, DIFY_USER_HEADER).unwrap_or_else(|| default_user.to_string());

    Credentials { api_key, user }
}
