//! Client and session classification
//!
//! Decides whether a request comes from the client family that receives
//! stream annotations, and whether it opens a new conversation.
//!
//! Client detection is a best-effort fingerprint. The last rule accepts any
//! desktop browser-engine user agent that sends neither `Origin` nor
//! `Referer`, which is how the desktop build of the client presents itself.
//! Other tools with the same shape are accepted too: a false positive only
//! shows an extra informational chunk, while a false negative hides the
//! feature from the real client. Tighten this only against a known
//! fingerprint of the client.

use std::sync::LazyLock;

use axum::http::{HeaderMap, header};
use regex::Regex;

use crate::config::ClientConfig;

use super::request::ChatMessage;

/// Desktop Chromium/WebKit user agent without a mobile or bot token
static DESKTOP_ENGINE_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Mozilla/5\.0 \((?:Windows NT|Macintosh|X11)[^)]*\) AppleWebKit/[\d.]+ \(KHTML, like Gecko\)",
    )
    .expect("desktop user agent pattern is valid")
});

/// Which rule matched when classifying the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRule {
    /// `User-Agent` contains the client marker
    UserAgentMarker,
    /// `User-Agent` contains the embedding runtime marker
    RuntimeMarker,
    /// `Origin` contains the client marker
    OriginMarker,
    /// No `Origin`/`Referer` and a desktop browser-engine `User-Agent`
    DesktopFingerprint,
    /// Nothing matched
    NoMatch,
}

impl ClientRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRule::UserAgentMarker => "user_agent_marker",
            ClientRule::RuntimeMarker => "runtime_marker",
            ClientRule::OriginMarker => "origin_marker",
            ClientRule::DesktopFingerprint => "desktop_fingerprint",
            ClientRule::NoMatch => "no_match",
        }
    }
}

/// Outcome of classifying one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientClassification {
    pub is_eligible_client: bool,
    pub is_new_session: bool,
    pub rule: ClientRule,
}

/// Compiled client markers
#[derive(Debug, Clone)]
pub struct ClientRules {
    marker: String,
    runtime_marker: String,
}

impl ClientRules {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            marker: config.marker.to_lowercase(),
            runtime_marker: config.runtime_marker.to_lowercase(),
        }
    }

    /// Classify a request from its headers and message list
    pub fn classify(&self, headers: &HeaderMap, messages: &[ChatMessage]) -> ClientClassification {
        let rule = self.match_client(headers);
        ClientClassification {
            is_eligible_client: rule != ClientRule::NoMatch,
            is_new_session: is_new_session(messages),
            rule,
        }
    }

    fn match_client(&self, headers: &HeaderMap) -> ClientRule {
        let user_agent = header_str(headers, header::USER_AGENT).unwrap_or_default();
        let user_agent_lower = user_agent.to_lowercase();
        let origin = header_str(headers, header::ORIGIN);

        if contains_marker(&user_agent_lower, &self.marker) {
            return ClientRule::UserAgentMarker;
        }

        if contains_marker(&user_agent_lower, &self.runtime_marker) {
            return ClientRule::RuntimeMarker;
        }

        if let Some(origin) = origin {
            if contains_marker(&origin.to_lowercase(), &self.marker) {
                return ClientRule::OriginMarker;
            }
        }

        let has_referer = headers.contains_key(header::REFERER);
        if origin.is_none() && !has_referer && DESKTOP_ENGINE_UA.is_match(user_agent) {
            return ClientRule::DesktopFingerprint;
        }

        ClientRule::NoMatch
    }
}

/// A new session is exactly one message, sent by the user
pub fn is_new_session(messages: &[ChatMessage]) -> bool {
    matches!(messages, [only] if only.role == "user")
}

fn contains_marker(haystack: &str, marker: &str) -> bool {
    !marker.is_empty() && haystack.contains(marker)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
