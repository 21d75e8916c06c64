//! Helicone custom-logging backend

use std::env;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::{TraceBackend, TraceError, TraceRecord};
use crate::config::HeliconeConfig;

#[derive(Debug)]
pub struct HeliconeBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    allowed_users: Vec<String>,
}

fn timing(at: DateTime<Utc>) -> Value {
    json!({
        "seconds": at.timestamp(),
        "milliseconds": at.timestamp_subsec_millis(),
    })
}

impl HeliconeBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: String,
        allowed_users: Vec<String>,
    ) -> Self {
        Self {
            client,
            url: format!("{}/custom/v1/log", base_url.trim_end_matches('/')),
            api_key,
            allowed_users,
        }
    }

    /// Reads the API key from the environment variable named in config
    pub fn from_config(config: &HeliconeConfig, client: reqwest::Client) -> Result<Self, TraceError> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            TraceError::Config(format!("Env var '{}' not set", config.api_key_env))
        })?;

        Ok(Self::new(
            client,
            &config.base_url,
            api_key,
            config.allowed_users.clone(),
        ))
    }

    fn payload(&self, record: &TraceRecord) -> Value {
        json!({
            "providerRequest": {
                "url": "custom-model-nopath",
                "json": record.request_json(),
                "meta": {
                    "Helicone-Request-Id": record.request_id.as_str(),
                    "Helicone-User-Id": record.user,
                },
            },
            "providerResponse": {
                "json": record.completion_json(),
                "status": 200,
                "headers": {},
            },
            "timing": {
                "startTime": timing(record.started_at),
                "endTime": timing(record.finished_at),
            },
        })
    }
}

#[async_trait]
impl TraceBackend for HeliconeBackend {
    fn name(&self) -> &'static str {
        "helicone"
    }

    fn allowed_users(&self) -> &[String] {
        &self.allowed_users
    }

    async fn submit(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(record))
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::test_support::record;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(base_url: &str) -> HeliconeBackend {
        HeliconeBackend::new(reqwest::Client::new(), base_url, "sk-helicone".to_string(), Vec::new())
    }

    #[test]
    fn test_payload_shape() {
        let payload = backend("http://localhost").payload(&record(Some("alice")));
        assert_eq!(payload["providerRequest"]["json"]["model"], "anthropic/claude-sonnet-4");
        assert_eq!(payload["providerRequest"]["meta"]["Helicone-User-Id"], "alice");
        assert_eq!(
            payload["providerResponse"]["json"]["choices"][0]["message"]["content"],
            "Hi there"
        );
        assert_eq!(payload["providerResponse"]["json"]["usage"]["prompt_tokens"], 12);

        let start = payload["timing"]["startTime"]["seconds"].as_i64().unwrap();
        let end = payload["timing"]["endTime"]["seconds"].as_i64().unwrap();
        assert!(end >= start);
    }

    #[tokio::test]
    async fn test_submit_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/custom/v1/log"))
            .and(header("authorization", "Bearer sk-helicone"))
            .and(body_partial_json(json!({
                "providerResponse": {"status": 200}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(backend(&mock_server.uri()).submit(&record(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_server_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let result = backend(&mock_server.uri()).submit(&record(None)).await;
        match result {
            Err(TraceError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("Expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_unreachable() {
        let backend = backend("http://127.0.0.1:1");
        assert!(matches!(backend.submit(&record(None)).await, Err(TraceError::Http(_))));
    }
}
