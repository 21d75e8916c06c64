//! Correlation ids for proxied requests
//!
//! A caller-supplied `x-request-id` is reused when it is well formed so that
//! logs, error bodies and traces line up with the caller's own records.
//! Otherwise a fresh id is generated.

use axum::http::HeaderMap;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the correlation id in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Maximum length for request ids
const MAX_REQUEST_ID_LEN: usize = 128;

/// Errors that can occur during request id validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestIdError {
    /// Request id is empty
    #[error("Request ID cannot be empty")]
    Empty,

    /// Request id contains invalid characters
    #[error("Request ID contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars,

    /// Request id exceeds maximum length
    #[error("Request ID exceeds maximum length of {MAX_REQUEST_ID_LEN} characters")]
    TooLong,
}

/// A validated request correlation id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new random id
    pub fn generate() -> Self {
        RequestId(format!("req_{}", Uuid::new_v4().simple()))
    }

    /// Reuse the inbound `x-request-id` when valid, otherwise generate one
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| RequestId::try_from(v.trim()).ok())
            .unwrap_or_else(RequestId::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), RequestIdError> {
        if s.is_empty() {
            return Err(RequestIdError::Empty);
        }

        if s.len() > MAX_REQUEST_ID_LEN {
            return Err(RequestIdError::TooLong);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RequestIdError::InvalidChars);
        }

        Ok(())
    }
}

impl TryFrom<&str> for RequestId {
    type Error = RequestIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(RequestId(value.to_string()))
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_valid_request_ids() {
        assert!(RequestId::try_from("req-abc").is_ok());
        assert!(RequestId::try_from("REQ_123").is_ok());
        assert!(RequestId::try_from("a").is_ok());
        assert!(RequestId::try_from(&*"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_invalid_request_ids() {
        assert!(matches!(RequestId::try_from(""), Err(RequestIdError::Empty)));
        assert!(matches!(
            RequestId::try_from("has spaces"),
            Err(RequestIdError::InvalidChars)
        ));
        assert!(matches!(
            RequestId::try_from("inject\nheader"),
            Err(RequestIdError::InvalidChars)
        ));
        assert!(matches!(
            RequestId::try_from(&*"a".repeat(129)),
            Err(RequestIdError::TooLong)
        ));
    }

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req_"));
        assert!(RequestId::try_from(a.as_str()).is_ok());
    }

    #[test]
    fn test_from_headers_reuses_valid_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("caller-42"));
        assert_eq!(RequestId::from_headers(&headers).as_str(), "caller-42");
    }

    #[test]
    fn test_from_headers_replaces_invalid_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("bad id!"));
        let id = RequestId::from_headers(&headers);
        assert!(id.as_str().starts_with("req_"));

        let id = RequestId::from_headers(&HeaderMap::new());
        assert!(id.as_str().starts_with("req_"));
    }

    #[test]
    fn test_display() {
        let id = RequestId::try_from("test-id").unwrap();
        assert_eq!(format!("{id}"), "test-id");
    }
}
