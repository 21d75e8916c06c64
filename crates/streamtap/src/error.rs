//! Error types for Streamtap

use thiserror::Error;

/// Main error type for Streamtap operations
#[derive(Error, Debug)]
pub enum StreamtapError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Model catalog fetch or decode errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Observability backend errors
    #[error("Trace error: {0}")]
    Trace(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Streamtap operations
pub type Result<T> = std::result::Result<T, StreamtapError>;
