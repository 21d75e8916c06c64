use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamtapError};

/// Main configuration structure for Streamtap
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Client fingerprinting configuration
    #[serde(default)]
    pub client: ClientConfig,
    /// Credit balance announcement configuration
    #[serde(default)]
    pub balance: BalanceConfig,
    /// Context-budget warning configuration
    #[serde(default)]
    pub context: ContextConfig,
    /// Trace backend configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| StreamtapError::Config(format!("Failed to parse config: {e}")))
    }

    /// Candidate config locations, in lookup order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".streamtap").join("config.toml")),
            dirs::config_dir().map(|c| c.join("streamtap").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// HTTP proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL of the upstream chat API; chat, key-info and model catalog
    /// endpoints are resolved relative to it
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// TCP/TLS connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Time allowed for upstream response headers to arrive, in seconds.
    /// The body itself streams without a deadline.
    #[serde(default = "default_header_timeout_secs")]
    pub header_timeout_secs: u64,
    /// Chunks queued toward a slow client before the relay stops reading upstream
    #[serde(default = "default_relay_buffer_chunks")]
    pub relay_buffer_chunks: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            header_timeout_secs: default_header_timeout_secs(),
            relay_buffer_chunks: default_relay_buffer_chunks(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_upstream_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_header_timeout_secs() -> u64 {
    120
}

fn default_relay_buffer_chunks() -> usize {
    32
}

/// Markers used to recognise the client family that receives stream annotations
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Substring identifying the client in `User-Agent` or `Origin` (case-insensitive)
    #[serde(default = "default_client_marker")]
    pub marker: String,
    /// Substring identifying the embedding desktop runtime in `User-Agent`
    #[serde(default = "default_runtime_marker")]
    pub runtime_marker: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            marker: default_client_marker(),
            runtime_marker: default_runtime_marker(),
        }
    }
}

fn default_client_marker() -> String {
    "chatbox".to_string()
}

fn default_runtime_marker() -> String {
    "electron".to_string()
}

/// Credit balance announcement configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    /// Prepend a balance chunk to new conversations from eligible clients
    #[serde(default = "default_balance_enabled")]
    pub enabled: bool,
    /// Key-info request timeout in seconds
    #[serde(default = "default_balance_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: default_balance_enabled(),
            timeout_secs: default_balance_timeout_secs(),
        }
    }
}

fn default_balance_enabled() -> bool {
    true
}

fn default_balance_timeout_secs() -> u64 {
    5
}

/// Context-budget warning and model catalog configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Append a warning chunk when prompt usage crosses a threshold
    #[serde(default = "default_warnings_enabled")]
    pub warnings_enabled: bool,
    /// Fetch the upstream model catalog for per-model limits
    #[serde(default = "default_catalog_enabled")]
    pub catalog_enabled: bool,
    /// Minimum seconds between catalog fetch attempts after a failure
    #[serde(default = "default_catalog_retry_secs")]
    pub catalog_retry_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            warnings_enabled: default_warnings_enabled(),
            catalog_enabled: default_catalog_enabled(),
            catalog_retry_secs: default_catalog_retry_secs(),
        }
    }
}

fn default_warnings_enabled() -> bool {
    true
}

fn default_catalog_enabled() -> bool {
    true
}

fn default_catalog_retry_secs() -> u64 {
    300
}

/// What happens to queued traces when the server stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Submit everything already queued, bounded by the shutdown timeout
    Drain,
    /// Abandon queued traces immediately
    Drop,
}

/// Trace backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Per-backend queue capacity; records beyond it are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Shutdown behaviour for pending traces
    #[serde(default = "default_shutdown_policy")]
    pub shutdown: ShutdownPolicy,
    /// Upper bound on draining at shutdown, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Timeout for each backend submission, in seconds
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    /// Langfuse ingestion backend
    #[serde(default)]
    pub langfuse: LangfuseConfig,
    /// Helicone custom-logging backend
    #[serde(default)]
    pub helicone: HeliconeConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shutdown: default_shutdown_policy(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            langfuse: LangfuseConfig::default(),
            helicone: HeliconeConfig::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_shutdown_policy() -> ShutdownPolicy {
    ShutdownPolicy::Drain
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_submit_timeout_secs() -> u64 {
    15
}

/// Langfuse backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LangfuseConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Langfuse host
    #[serde(default = "default_langfuse_host")]
    pub host: String,
    /// Environment variable holding the public key
    #[serde(default = "default_langfuse_public_key_env")]
    pub public_key_env: String,
    /// Environment variable holding the secret key
    #[serde(default = "default_langfuse_secret_key_env")]
    pub secret_key_env: String,
    /// Callers (request `user` field) to trace; empty traces everyone
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl Default for LangfuseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_langfuse_host(),
            public_key_env: default_langfuse_public_key_env(),
            secret_key_env: default_langfuse_secret_key_env(),
            allowed_users: Vec::new(),
        }
    }
}

fn default_langfuse_host() -> String {
    "https://cloud.langfuse.com".to_string()
}

fn default_langfuse_public_key_env() -> String {
    "LANGFUSE_PUBLIC_KEY".to_string()
}

fn default_langfuse_secret_key_env() -> String {
    "LANGFUSE_SECRET_KEY".to_string()
}

/// Helicone backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeliconeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Helicone logging API base URL
    #[serde(default = "default_helicone_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_helicone_api_key_env")]
    pub api_key_env: String,
    /// Callers (request `user` field) to trace; empty traces everyone
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl Default for HeliconeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_helicone_base_url(),
            api_key_env: default_helicone_api_key_env(),
            allowed_users: Vec::new(),
        }
    }
}

fn default_helicone_base_url() -> String {
    "https://api.worker.helicone.ai".to_string()
}

fn default_helicone_api_key_env() -> String {
    "HELICONE_API_KEY".to_string()
}
