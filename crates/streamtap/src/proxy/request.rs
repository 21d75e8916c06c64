//! Inbound chat-completion request shape
//!
//! Only the fields the proxy acts on are typed. Everything else (sampling
//! parameters, tools, provider routing hints) is kept in `params` so that
//! traces can report it, while the upstream always receives the original
//! request bytes untouched.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chat message; `content` may be a string or a list of content parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// OpenAI-style chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Caller identifier, used for trace allowlists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Remaining request parameters
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn from_slice(body: &[u8]) -> Option<Self> {
        match serde_json::from_slice(body) {
            Ok(request) => Some(request),
            Err(e) => {
                tracing::debug!(error = %e, "Body is not a chat completion request");
                None
            }
        }
    }
}

/// Extract the bearer token from the `Authorization` header.
///
/// The token format is validated before requests reach the proxy; this only
/// strips the scheme.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
