//! Credit balance lookup
//!
//! Fetches the caller's credit limit and usage from the upstream key-info
//! endpoint. The balance is only an informational extra, so every failure
//! degrades to `None` and is logged here.

use std::time::Duration;

use serde::Deserialize;

use super::request_id::RequestId;
use super::sse::StreamingChunk;

/// Credits on an account
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Credits {
    Unlimited,
    Amount(f64),
}

/// Balance of the calling key
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub total_credits: Credits,
    pub used_credits: f64,
}

impl Balance {
    /// Remaining credits, never negative
    pub fn remaining(&self) -> Credits {
        match self.total_credits {
            Credits::Unlimited => Credits::Unlimited,
            Credits::Amount(limit) => Credits::Amount((limit - self.used_credits).max(0.0)),
        }
    }

    /// Text shown in the leading chunk
    pub fn render(&self) -> String {
        match (self.total_credits, self.remaining()) {
            (Credits::Amount(limit), Credits::Amount(remaining)) => format!(
                "💳 Credits remaining: {remaining:.2} of {limit:.2} (used {:.2})\n\n",
                self.used_credits
            ),
            _ => format!(
                "💳 Credits: unlimited (used {:.2})\n\n",
                self.used_credits
            ),
        }
    }

    /// Leading chunk announcing the balance
    pub fn to_chunk(&self, id: &str, model: &str, created: i64) -> StreamingChunk {
        StreamingChunk::synthetic(id, model, created, self.render())
    }
}

#[derive(Debug, Deserialize)]
struct KeyInfoResponse {
    data: KeyInfo,
}

#[derive(Debug, Deserialize)]
struct KeyInfo {
    limit: Option<f64>,
    usage: f64,
}

/// Client for the upstream key-info endpoint
#[derive(Debug, Clone)]
pub struct BalanceFetcher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl BalanceFetcher {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }

    /// One fresh key-info call; never cached
    pub async fn fetch(&self, token: &str, request_id: &RequestId) -> Option<Balance> {
        let response = match self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .header(super::request_id::REQUEST_ID_HEADER, request_id.as_str())
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%request_id, error = %e, "Balance request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%request_id, status = status.as_u16(), "Balance request rejected");
            return None;
        }

        let info: KeyInfoResponse = match response.json().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(%request_id, error = %e, "Malformed key-info payload");
                return None;
            }
        };

        let balance = Balance {
            total_credits: info
                .data
                .limit
                .map(Credits::Amount)
                .unwrap_or(Credits::Unlimited),
            used_credits: info.data.usage,
        };
        tracing::debug!(%request_id, ?balance, "Balance fetched");
        Some(balance)
    }
}
