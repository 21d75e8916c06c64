//! SSE parsing and response reconstruction
//!
//! Turns the captured bytes of a streamed chat completion back into a single
//! message. The capture is a best-effort copy of live traffic, so parsing
//! never fails as a whole: events that do not decode are logged and skipped,
//! and later events still contribute.
//!
//! SSE format:
//! ```text
//! data: {"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"Hi"}}]}
//!
//! data: [DONE]
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of the terminal event
pub const DONE_PAYLOAD: &str = "[DONE]";

/// Represents a parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Data event containing the payload
    Data(String),
    /// Terminal [DONE] marker
    Done,
}

/// Token usage as reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` object. Upstream chunks and chunks the proxy
/// synthesizes share this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamingChunk {
    /// Build a content-only chunk in the upstream's shape
    pub fn synthetic(id: &str, model: &str, created: i64, content: String) -> Self {
        Self {
            id: Some(id.to_string()),
            object: Some("chat.completion.chunk".to_string()),
            created: Some(created),
            model: Some(model.to_string()),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Serialize as one complete SSE event
    pub fn to_sse_bytes(&self) -> Bytes {
        // Serializing plain strings and numbers cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        Bytes::from(format!("data: {json}\n\n"))
    }
}

/// A streamed completion folded back into a single message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccumulatedStreamResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub created: Option<i64>,
    pub content: String,
    pub role: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Whether the terminal event was seen
    pub is_complete: bool,
    /// Events that could not be decoded
    pub skipped_events: usize,
}

impl AccumulatedStreamResponse {
    /// Fold one chunk into the running result
    pub fn push(&mut self, chunk: StreamingChunk) {
        if self.id.is_none() {
            self.id = chunk.id;
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }
        if self.created.is_none() {
            self.created = chunk.created;
        }
        if let Some(choice) = chunk.choices.into_iter().next() {
            if self.role.is_none() {
                self.role = choice.delta.role;
            }
            if let Some(content) = choice.delta.content {
                self.content.push_str(&content);
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    pub fn role_or_default(&self) -> &str {
        self.role.as_deref().unwrap_or("assistant")
    }

    pub fn prompt_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.prompt_tokens)
    }

    /// Build the result from a non-streaming `chat.completion` body
    pub fn from_completion(body: &Value) -> Self {
        let message = body.pointer("/choices/0/message");
        Self {
            id: body.get("id").and_then(Value::as_str).map(str::to_string),
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
            created: body.get("created").and_then(Value::as_i64),
            content: message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            role: message
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
                .map(str::to_string),
            finish_reason: body
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: body
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok()),
            is_complete: true,
            skipped_events: 0,
        }
    }

    /// Non-streaming `chat.completion` object carrying the accumulated fields
    pub fn to_completion_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": self.role_or_default(),
                    "content": self.content,
                },
                "finish_reason": self.finish_reason,
            }],
            "usage": self.usage,
        })
    }
}

/// SSE parsing functionality
pub struct SseParser;

impl SseParser {
    /// Split raw SSE text into events.
    ///
    /// Events are separated by blank lines. Comment lines (`:`) and fields
    /// other than `data` are ignored; multiple `data` lines in one event are
    /// joined with newlines.
    pub fn parse_events(raw: &str) -> Vec<SseEvent> {
        let normalized;
        let raw = if raw.contains('\r') {
            normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
            normalized.as_str()
        } else {
            raw
        };

        raw.split("\n\n")
            .filter_map(|block| {
                let data: Vec<&str> = block
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|data| data.strip_prefix(' ').unwrap_or(data))
                    .collect();
                if data.is_empty() {
                    return None;
                }
                let payload = data.join("\n");
                if payload.trim().is_empty() {
                    None
                } else if payload.trim() == DONE_PAYLOAD {
                    Some(SseEvent::Done)
                } else {
                    Some(SseEvent::Data(payload))
                }
            })
            .collect()
    }

    /// Fold parsed events into one response, skipping payloads that are not
    /// valid chunk JSON
    pub fn accumulate(events: &[SseEvent]) -> AccumulatedStreamResponse {
        let mut response = AccumulatedStreamResponse::default();

        for event in events {
            match event {
                SseEvent::Done => response.is_complete = true,
                SseEvent::Data(data) => match serde_json::from_str::<StreamingChunk>(data) {
                    Ok(chunk) => response.push(chunk),
                    Err(e) => {
                        response.skipped_events += 1;
                        tracing::warn!(
                            error = %e,
                            payload_len = data.len(),
                            "Skipping undecodable SSE event"
                        );
                    }
                },
            }
        }

        response
    }

    /// Parse and fold captured stream bytes
    pub fn reconstruct(raw: &[u8]) -> AccumulatedStreamResponse {
        let text = String::from_utf8_lossy(raw);
        Self::accumulate(&Self::parse_events(&text))
    }
}
