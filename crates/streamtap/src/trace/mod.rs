//! Out-of-band tracing of completed turns
//!
//! After a response has fully reached the client, the reconstructed turn is
//! queued to each enabled observability backend. Every backend has its own
//! queue and worker so a slow or failing backend never affects another one,
//! or the proxy.

pub mod helicone;
pub mod langfuse;
pub mod tracer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::proxy::request::ChatMessage;
use crate::proxy::request_id::RequestId;
use crate::proxy::sse::AccumulatedStreamResponse;

pub use helicone::HeliconeBackend;
pub use langfuse::LangfuseBackend;
pub use tracer::Tracer;

/// Errors returned by trace backends
#[derive(Error, Debug)]
pub enum TraceError {
    /// Backend misconfigured (missing credentials, bad URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request could not be delivered
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend answered with a non-success status
    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Backend accepted the request but rejected some events
    #[error("Backend rejected events: {0}")]
    Rejected(String),
}

/// One completed turn, ready for submission
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub request_id: RequestId,
    /// Caller identifier from the request body
    pub user: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Sampling and other request parameters
    pub params: Map<String, Value>,
    pub streamed: bool,
    pub response: AccumulatedStreamResponse,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TraceRecord {
    /// The request as the caller sent it
    pub fn request_json(&self) -> Value {
        let mut request = self.params.clone();
        request.insert("model".to_string(), Value::from(self.model.clone()));
        request.insert(
            "messages".to_string(),
            serde_json::to_value(&self.messages).unwrap_or(Value::Array(Vec::new())),
        );
        request.insert("stream".to_string(), Value::Bool(self.streamed));
        if let Some(user) = &self.user {
            request.insert("user".to_string(), Value::from(user.clone()));
        }
        Value::Object(request)
    }

    /// Non-streaming completion object built from the accumulated fields
    pub fn completion_json(&self) -> Value {
        let mut completion = self.response.to_completion_json();
        if completion["model"].is_null() {
            completion["model"] = Value::from(self.model.clone());
        }
        completion
    }

    pub fn latency_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// An observability backend that accepts completion-shaped records
#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Callers this backend traces; empty means everyone
    fn allowed_users(&self) -> &[String];

    /// Whether this record should be sent to the backend
    fn accepts(&self, record: &TraceRecord) -> bool {
        let allowed = self.allowed_users();
        allowed.is_empty()
            || record
                .user
                .as_deref()
                .is_some_and(|user| allowed.iter().any(|a| a == user))
    }

    /// Submit one record
    async fn submit(&self, record: &TraceRecord) -> Result<(), TraceError>;
}
