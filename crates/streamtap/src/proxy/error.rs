//! Pre-stream failures and their client-facing form
//!
//! Only failures that happen before any response byte is committed reach the
//! client, as a single JSON object carrying the request's correlation id.
//! Everything after that point is logged where it happens.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use super::request_id::{REQUEST_ID_HEADER, RequestId};

/// Longest upstream body excerpt repeated in an error message
const MAX_UPSTREAM_EXCERPT: usize = 512;

/// Errors that can occur before the response is committed
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Upstream answered with a non-success status
    #[error("Upstream returned {status}")]
    Upstream { status: StatusCode, body: String },

    /// Connection, DNS or TLS failure
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream did not send response headers in time
    #[error("Upstream timed out after {0}s")]
    Timeout(u64),

    /// The inbound request could not be forwarded
    #[error("Request error: {0}")]
    Request(String),
}

impl ProxyError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_builder() {
            ProxyError::Request(e.to_string())
        } else {
            ProxyError::Network(e.to_string())
        }
    }

    /// Status returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream { status, .. } if status.is_client_error() => *status,
            ProxyError::Upstream { .. } | ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Request(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::Upstream { .. } => "upstream",
            ProxyError::Network(_) => "network",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Request(_) => "request",
        }
    }

    /// Human-readable message, preferring the upstream's own error text
    fn message(&self) -> String {
        match self {
            ProxyError::Upstream { status, body } => upstream_message(body)
                .map(|message| format!("Upstream returned {status}: {message}"))
                .unwrap_or_else(|| self.to_string()),
            _ => self.to_string(),
        }
    }

    /// JSON error body
    pub fn to_json(&self, request_id: &RequestId) -> Value {
        let mut error = serde_json::json!({
            "type": format!("{}_error", self.category()),
            "message": self.message(),
            "request_id": request_id.as_str(),
        });
        if let ProxyError::Upstream { status, .. } = self {
            error["upstream_status"] = Value::from(status.as_u16());
        }
        serde_json::json!({ "error": error })
    }

    /// Log and convert into the single JSON response sent to the client
    pub fn into_response(self, request_id: &RequestId) -> Response<Body> {
        error!(
            %request_id,
            error_type = self.category(),
            error_message = %self,
            "Upstream request failed before streaming"
        );

        let status = self.status();
        let body = self.to_json(request_id).to_string();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// Pull `error.message` out of an upstream JSON error, or fall back to a
/// bounded excerpt of the raw body
fn upstream_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = json.pointer("/error/message").and_then(Value::as_str) {
            return Some(message.to_string());
        }
    }
    let excerpt: String = trimmed.chars().take(MAX_UPSTREAM_EXCERPT).collect();
    Some(excerpt)
}
