//! Langfuse ingestion backend
//!
//! Sends a `trace-create` and a `generation-create` event per turn to the
//! public ingestion API, authenticated with the project key pair.

use std::env;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{TraceBackend, TraceError, TraceRecord};
use crate::config::LangfuseConfig;

const TRACE_NAME: &str = "chat-completion";

#[derive(Debug)]
pub struct LangfuseBackend {
    client: reqwest::Client,
    url: String,
    public_key: String,
    secret_key: String,
    allowed_users: Vec<String>,
}

/// Multi-status ingestion result
#[derive(Debug, Default, Deserialize)]
struct IngestionResponse {
    #[serde(default)]
    errors: Vec<IngestionError>,
}

#[derive(Debug, Deserialize)]
struct IngestionError {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    message: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl LangfuseBackend {
    pub fn new(
        client: reqwest::Client,
        host: &str,
        public_key: String,
        secret_key: String,
        allowed_users: Vec<String>,
    ) -> Self {
        Self {
            client,
            url: format!("{}/api/public/ingestion", host.trim_end_matches('/')),
            public_key,
            secret_key,
            allowed_users,
        }
    }

    /// Reads the key pair from the environment variables named in config
    pub fn from_config(config: &LangfuseConfig, client: reqwest::Client) -> Result<Self, TraceError> {
        let read = |name: &str| {
            env::var(name).map_err(|_| TraceError::Config(format!("Env var '{name}' not set")))
        };
        let public_key = read(&config.public_key_env)?;
        let secret_key = read(&config.secret_key_env)?;

        Ok(Self::new(
            client,
            &config.host,
            public_key,
            secret_key,
            config.allowed_users.clone(),
        ))
    }

    /// Ingestion batch for one record
    fn batch(&self, record: &TraceRecord) -> Value {
        let trace_id = record.request_id.as_str();
        let completion = record.completion_json();
        let output = &completion["choices"][0]["message"];
        let usage = record.response.usage;

        let trace = json!({
            "id": Uuid::new_v4().to_string(),
            "type": "trace-create",
            "timestamp": timestamp(record.started_at),
            "body": {
                "id": trace_id,
                "timestamp": timestamp(record.started_at),
                "name": TRACE_NAME,
                "userId": record.user,
                "input": record.messages,
                "output": output,
                "metadata": {
                    "request_id": trace_id,
                    "stream": record.streamed,
                },
            },
        });

        let generation = json!({
            "id": Uuid::new_v4().to_string(),
            "type": "generation-create",
            "timestamp": timestamp(record.finished_at),
            "body": {
                "id": format!("{trace_id}-generation"),
                "traceId": trace_id,
                "name": TRACE_NAME,
                "model": record.response.model.as_deref().unwrap_or(&record.model),
                "modelParameters": record.params,
                "input": record.messages,
                "output": output,
                "startTime": timestamp(record.started_at),
                "endTime": timestamp(record.finished_at),
                "usage": usage.map(|u| json!({
                    "input": u.prompt_tokens,
                    "output": u.completion_tokens,
                    "total": u.total_tokens,
                    "unit": "TOKENS",
                })),
                "metadata": {
                    "finish_reason": record.response.finish_reason,
                    "complete": record.response.is_complete,
                    "skipped_events": record.response.skipped_events,
                },
            },
        });

        json!({ "batch": [trace, generation] })
    }
}

#[async_trait]
impl TraceBackend for LangfuseBackend {
    fn name(&self) -> &'static str {
        "langfuse"
    }

    fn allowed_users(&self) -> &[String] {
        &self.allowed_users
    }

    async fn submit(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&self.batch(record))
            .send()
            .await
            .map_err(|e| TraceError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        // 207 lists per-event failures
        let result: IngestionResponse = response.json().await.unwrap_or_default();
        if !result.errors.is_empty() {
            let details = result
                .errors
                .iter()
                .map(|e| {
                    format!(
                        "{} ({}): {}",
                        e.id,
                        e.status,
                        e.message.as_deref().unwrap_or("unknown")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TraceError::Rejected(details));
        }

        Ok(())
    }
}
