//! Model context limits
//!
//! Resolves a model id to its prompt-token budget. The upstream model catalog
//! is the primary source; it is fetched in the background and published as
//! an immutable snapshot that readers load without blocking. When the catalog
//! is missing or does not know the model, a static table keyed by provider
//! prefix is used. Resolution itself never fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, StreamtapError};

/// Budget for models nothing else knows about
pub const DEFAULT_CONTEXT_TOKENS: u64 = 32_000;

/// Upper bound on one catalog fetch
const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider prefixes stripped before static lookup
const PROVIDER_PREFIXES: &[&str] = &["anthropic/", "openai/", "google/", "x-ai/"];

static PROVIDER_PATTERNS: LazyLock<Vec<(Provider, Regex)>> = LazyLock::new(|| {
    [
        (Provider::Anthropic, r"^(?:anthropic/)?claude"),
        (Provider::OpenAi, r"^(?:openai/)?(?:gpt-|chatgpt|o[1-9])"),
        (Provider::Gemini, r"^(?:google/)?gemini"),
        (Provider::Grok, r"^(?:x-ai/)?grok"),
    ]
    .into_iter()
    .map(|(provider, pattern)| {
        (
            provider,
            Regex::new(pattern).expect("provider pattern is valid"),
        )
    })
    .collect()
});

/// Per-family limits that differ from their provider default. A family
/// matches when `pattern` matches and `exclude` (newer variants) does not.
static FAMILY_OVERRIDES: LazyLock<Vec<FamilyOverride>> = LazyLock::new(|| {
    vec![
        FamilyOverride::new(r"^claude-3", Some(r"^claude-3[.-][57]"), 200_000),
        FamilyOverride::new(r"^gpt-4", Some(r"^gpt-4(?:o|\.\d|-turbo)"), 8_192),
    ]
});

struct FamilyOverride {
    pattern: Regex,
    exclude: Option<Regex>,
    max_context_tokens: u64,
}

impl FamilyOverride {
    fn new(pattern: &str, exclude: Option<&str>, max_context_tokens: u64) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("override pattern is valid"),
            exclude: exclude.map(|e| Regex::new(e).expect("override exclude pattern is valid")),
            max_context_tokens,
        }
    }

    fn matches(&self, model: &str) -> bool {
        self.pattern.is_match(model) && !self.exclude.as_ref().is_some_and(|e| e.is_match(model))
    }
}

/// Model vendor, derived from the model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    Grok,
    Unknown,
}

impl Provider {
    /// Match a model id (with or without provider prefix) to its vendor
    pub fn detect(model: &str) -> Self {
        let model = model.trim().to_lowercase();
        PROVIDER_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(&model))
            .map(|(provider, _)| *provider)
            .unwrap_or(Provider::Unknown)
    }

    /// Static budget when nothing more specific is known
    pub fn default_context_tokens(&self) -> u64 {
        match self {
            Provider::Anthropic => 400_000,
            Provider::OpenAi => 128_000,
            Provider::Gemini => 1_000_000,
            Provider::Grok => 256_000,
            Provider::Unknown => DEFAULT_CONTEXT_TOKENS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Grok => "grok",
            Provider::Unknown => "unknown",
        }
    }
}

/// Resolved budget for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub provider: Provider,
    pub max_context_tokens: u64,
}

/// Strip a known provider prefix and lowercase the id
pub fn normalize_model_id(model: &str) -> String {
    let lower = model.trim().to_lowercase();
    PROVIDER_PREFIXES
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .map(str::to_string)
        .unwrap_or(lower)
}

/// Resolve limits from the static table only
pub fn static_limits(model: &str) -> ModelLimits {
    let normalized = normalize_model_id(model);
    let provider = Provider::detect(&normalized);

    let max_context_tokens = FAMILY_OVERRIDES
        .iter()
        .find(|o| o.matches(&normalized))
        .map(|o| o.max_context_tokens)
        .unwrap_or_else(|| provider.default_context_tokens());

    ModelLimits {
        provider,
        max_context_tokens,
    }
}

/// One catalog entry as published by the upstream
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub per_request_limits: Option<PerRequestLimits>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerRequestLimits {
    /// Published either as a number or as a numeric string
    #[serde(default)]
    pub prompt_tokens: Option<Value>,
}

impl CatalogEntry {
    /// Per-request prompt limit, else the model's context length
    fn prompt_limit(&self) -> Option<u64> {
        self.per_request_limits
            .as_ref()
            .and_then(|l| l.prompt_tokens.as_ref())
            .and_then(token_count)
            .or(self.context_length)
            .filter(|limit| *limit > 0)
    }
}

fn token_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as u64),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogResponse {
    Wrapped { data: Vec<CatalogEntry> },
    Bare(Vec<CatalogEntry>),
}

impl CatalogResponse {
    fn into_entries(self) -> Vec<CatalogEntry> {
        match self {
            CatalogResponse::Wrapped { data } => data,
            CatalogResponse::Bare(entries) => entries,
        }
    }
}

/// Immutable view of the catalog at one point in time
#[derive(Debug)]
pub struct CatalogSnapshot {
    limits: HashMap<String, u64>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let limits = entries
            .into_iter()
            .filter_map(|entry| entry.prompt_limit().map(|limit| (entry.id, limit)))
            .collect();
        Self {
            limits,
            fetched_at: Utc::now(),
        }
    }

    pub fn get(&self, model: &str) -> Option<u64> {
        self.limits.get(model).copied()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Process-wide model limit resolver backed by the upstream catalog
#[derive(Debug)]
pub struct ModelCatalog {
    snapshot: ArcSwapOption<CatalogSnapshot>,
    refreshing: AtomicBool,
    last_attempt: AtomicI64,
    retry_after: Duration,
}

impl ModelCatalog {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            refreshing: AtomicBool::new(false),
            last_attempt: AtomicI64::new(i64::MIN),
            retry_after,
        }
    }

    /// Resolve a model id; never fails
    pub fn resolve(&self, model: &str) -> ModelLimits {
        if let Some(snapshot) = self.snapshot.load().as_deref() {
            if let Some(max_context_tokens) = snapshot.get(model) {
                return ModelLimits {
                    provider: Provider::detect(model),
                    max_context_tokens,
                };
            }
        }
        static_limits(model)
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.load().is_some()
    }

    /// Publish a new snapshot, replacing the previous one
    pub fn install(&self, snapshot: CatalogSnapshot) {
        self.snapshot.store(Some(Arc::new(snapshot)));
    }

    /// Fetch the catalog once and publish it
    pub async fn refresh(&self, client: &reqwest::Client, url: &str) -> Result<usize> {
        let response = client
            .get(url)
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await
            .map_err(|e| StreamtapError::Catalog(format!("Catalog request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamtapError::Catalog(format!(
                "Catalog returned {status}"
            )));
        }

        let catalog: CatalogResponse = response
            .json()
            .await
            .map_err(|e| StreamtapError::Catalog(format!("Invalid catalog payload: {e}")))?;

        let snapshot = CatalogSnapshot::from_entries(catalog.into_entries());
        let count = snapshot.len();
        self.install(snapshot);
        Ok(count)
    }

    /// Start a background refresh unless one is running or the last attempt
    /// was too recent. Returns whether a refresh was started.
    pub fn spawn_refresh(self: &Arc<Self>, client: reqwest::Client, url: String) -> bool {
        let now = Utc::now().timestamp();
        let last = self.last_attempt.load(Ordering::Relaxed);
        if last != i64::MIN && now.saturating_sub(last) < self.retry_after.as_secs() as i64 {
            return false;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.last_attempt.store(now, Ordering::Relaxed);

        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            match catalog.refresh(&client, &url).await {
                Ok(count) => tracing::info!(models = count, "Model catalog loaded"),
                Err(e) => tracing::warn!(
                    error = %e,
                    "Model catalog unavailable, using static context limits"
                ),
            }
            catalog.refreshing.store(false, Ordering::Release);
        });
        true
    }

    /// Re-trigger population when no snapshot has been published yet
    pub fn ensure_loaded(self: &Arc<Self>, client: &reqwest::Client, url: &str) {
        if !self.is_loaded() {
            self.spawn_refresh(client.clone(), url.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_provider_detect() {
        assert_eq!(Provider::detect("anthropic/claude-sonnet-4"), Provider::Anthropic);
        assert_eq!(Provider::detect("claude-3-opus"), Provider::Anthropic);
        assert_eq!(Provider::detect("openai/gpt-4o"), Provider::OpenAi);
        assert_eq!(Provider::detect("o3-mini"), Provider::OpenAi);
        assert_eq!(Provider::detect("google/gemini-2.5-pro"), Provider::Gemini);
        assert_eq!(Provider::detect("x-ai/grok-4"), Provider::Grok);
        assert_eq!(Provider::detect("meta-llama/llama-3-70b"), Provider::Unknown);
        assert_eq!(Provider::detect("openai/omni-moderation"), Provider::Unknown);
    }

    #[test]
    fn test_normalize_model_id() {
        assert_eq!(normalize_model_id("Anthropic/Claude-Sonnet-4"), "claude-sonnet-4");
        assert_eq!(normalize_model_id("gpt-4o"), "gpt-4o");
        assert_eq!(normalize_model_id("x-ai/grok-3"), "grok-3");
        assert_eq!(normalize_model_id("mistral/mixtral"), "mistral/mixtral");
    }

    #[test]
    fn test_static_provider_defaults() {
        let limits = static_limits("anthropic/claude-sonnet-4");
        assert_eq!(limits.provider, Provider::Anthropic);
        assert_eq!(limits.max_context_tokens, 400_000);

        assert_eq!(static_limits("openai/gpt-4o").max_context_tokens, 128_000);
        assert_eq!(static_limits("google/gemini-2.0-flash").max_context_tokens, 1_000_000);
        assert_eq!(static_limits("x-ai/grok-4").max_context_tokens, 256_000);
    }

    #[test]
    fn test_static_family_overrides() {
        assert_eq!(static_limits("anthropic/claude-3-opus").max_context_tokens, 200_000);
        assert_eq!(static_limits("claude-3-haiku").max_context_tokens, 200_000);
        // Newer variants fall through to the provider default
        assert_eq!(static_limits("claude-3.5-sonnet").max_context_tokens, 400_000);
        assert_eq!(static_limits("claude-3-7-sonnet").max_context_tokens, 400_000);

        assert_eq!(static_limits("openai/gpt-4").max_context_tokens, 8_192);
        assert_eq!(static_limits("gpt-4-0613").max_context_tokens, 8_192);
        assert_eq!(static_limits("gpt-4o-mini").max_context_tokens, 128_000);
        assert_eq!(static_limits("gpt-4.1").max_context_tokens, 128_000);
        assert_eq!(static_limits("gpt-4-turbo").max_context_tokens, 128_000);
    }

    #[test]
    fn test_static_unknown_is_conservative() {
        let limits = static_limits("some-lab/new-model");
        assert_eq!(limits.provider, Provider::Unknown);
        assert_eq!(limits.max_context_tokens, DEFAULT_CONTEXT_TOKENS);

        assert_eq!(static_limits("").max_context_tokens, DEFAULT_CONTEXT_TOKENS);
    }

    #[test]
    fn test_catalog_entry_prompt_limit() {
        let entries: Vec<CatalogEntry> = serde_json::from_value(serde_json::json!([
            {"id": "a", "context_length": 100000, "per_request_limits": {"prompt_tokens": "90000"}},
            {"id": "b", "context_length": 100000, "per_request_limits": {"prompt_tokens": 50000}},
            {"id": "c", "context_length": 64000, "per_request_limits": null},
            {"id": "d"}
        ]))
        .unwrap();

        let snapshot = CatalogSnapshot::from_entries(entries);
        assert_eq!(snapshot.get("a"), Some(90_000));
        assert_eq!(snapshot.get("b"), Some(50_000));
        assert_eq!(snapshot.get("c"), Some(64_000));
        assert_eq!(snapshot.get("d"), None);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_resolve_prefers_catalog() {
        let catalog = ModelCatalog::new(Duration::from_secs(60));
        assert!(!catalog.is_loaded());
        assert_eq!(
            catalog.resolve("anthropic/claude-sonnet-4").max_context_tokens,
            400_000
        );

        let entries = vec![CatalogEntry {
            id: "anthropic/claude-sonnet-4".to_string(),
            context_length: Some(1_000_000),
            per_request_limits: None,
        }];
        catalog.install(CatalogSnapshot::from_entries(entries));

        assert!(catalog.is_loaded());
        let limits = catalog.resolve("anthropic/claude-sonnet-4");
        assert_eq!(limits.provider, Provider::Anthropic);
        assert_eq!(limits.max_context_tokens, 1_000_000);

        // Models missing from the catalog still use the static table
        assert_eq!(catalog.resolve("openai/gpt-4o").max_context_tokens, 128_000);
    }

    #[tokio::test]
    async fn test_refresh_from_wrapped_catalog() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "openai/gpt-4o", "context_length": 128000,
                     "per_request_limits": {"prompt_tokens": "100000", "completion_tokens": "16384"}}
                ]
            })))
            .mount(&mock_server)
            .await;

        let catalog = ModelCatalog::new(Duration::from_secs(60));
        let count = catalog
            .refresh(&reqwest::Client::new(), &format!("{}/models", mock_server.uri()))
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(catalog.resolve("openai/gpt-4o").max_context_tokens, 100_000);
    }

    #[tokio::test]
    async fn test_refresh_from_bare_catalog() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "x-ai/grok-4", "context_length": 256000}
            ])))
            .mount(&mock_server)
            .await;

        let catalog = ModelCatalog::new(Duration::from_secs(60));
        catalog
            .refresh(&reqwest::Client::new(), &format!("{}/models", mock_server.uri()))
            .await
            .unwrap();
        assert_eq!(catalog.resolve("x-ai/grok-4").max_context_tokens, 256_000);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_static_table() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let catalog = ModelCatalog::new(Duration::from_secs(60));
        let result = catalog
            .refresh(&reqwest::Client::new(), &format!("{}/models", mock_server.uri()))
            .await;

        assert!(matches!(result, Err(StreamtapError::Catalog(_))));
        assert!(!catalog.is_loaded());
        assert_eq!(catalog.resolve("openai/gpt-4o").max_context_tokens, 128_000);
    }

    #[tokio::test]
    async fn test_spawn_refresh_is_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let catalog = Arc::new(ModelCatalog::new(Duration::from_secs(3600)));
        let url = format!("{}/models", mock_server.uri());

        assert!(catalog.spawn_refresh(reqwest::Client::new(), url.clone()));
        assert!(!catalog.spawn_refresh(reqwest::Client::new(), url));
    }
}
