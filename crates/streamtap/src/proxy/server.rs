//! HTTP front of the proxy
//!
//! Accepts chat-completion requests, forwards them to the configured
//! upstream and either relays the event stream through [`relay`] or returns
//! the upstream's JSON body unchanged. Completed turns are handed to the
//! tracer once the client has everything.

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span};
use url::Url;

use crate::config::Config;
use crate::error::{Result, StreamtapError};
use crate::trace::{TraceRecord, Tracer};

use super::balance::BalanceFetcher;
use super::classifier::ClientRules;
use super::error::ProxyError;
use super::models::ModelCatalog;
use super::relay::{RelayOutcome, RelayPlan, relay};
use super::request::{ChatCompletionRequest, bearer_token};
use super::request_id::{REQUEST_ID_HEADER, RequestId};
use super::sse::AccumulatedStreamResponse;

/// Hop-by-hop headers that should not be forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Request headers recomputed by the HTTP client, plus `accept-encoding` so
/// the upstream answers with identity-encoded events
const RECOMPUTED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "accept-encoding"];

/// Shared application state for all handlers
pub struct AppState {
    pub config: Arc<Config>,
    /// Upstream client; bounded connect time, unbounded body time
    pub client: reqwest::Client,
    pub rules: ClientRules,
    pub catalog: Arc<ModelCatalog>,
    /// `None` when balance announcements are disabled
    pub balance: Option<BalanceFetcher>,
    pub tracer: Arc<Tracer>,
}

impl AppState {
    pub fn new(config: Config, tracer: Arc<Tracer>) -> Result<Self> {
        let upstream = Url::parse(&config.proxy.upstream_url)
            .map_err(|e| StreamtapError::Config(format!("Invalid upstream URL: {e}")))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(StreamtapError::Config(format!(
                "Unsupported upstream scheme: {}",
                upstream.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.proxy.connect_timeout_secs))
            .build()
            .map_err(|e| StreamtapError::Proxy(format!("Failed to create HTTP client: {e}")))?;

        let balance = config.balance.enabled.then(|| {
            BalanceFetcher::new(
                client.clone(),
                upstream_endpoint(&config, "key"),
                Duration::from_secs(config.balance.timeout_secs),
            )
        });

        Ok(Self {
            rules: ClientRules::new(&config.client),
            catalog: Arc::new(ModelCatalog::new(Duration::from_secs(
                config.context.catalog_retry_secs,
            ))),
            config: Arc::new(config),
            client,
            balance,
            tracer,
        })
    }

    pub fn chat_url(&self) -> String {
        upstream_endpoint(&self.config, "chat/completions")
    }

    pub fn catalog_url(&self) -> String {
        upstream_endpoint(&self.config, "models")
    }
}

fn upstream_endpoint(config: &Config, path: &str) -> String {
    format!("{}/{path}", config.proxy.upstream_url.trim_end_matches('/'))
}

/// The main proxy server
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the proxy server and listen for requests
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .proxy
            .listen_addr
            .parse()
            .map_err(|e| StreamtapError::Config(format!("Invalid listen address: {e}")))?;

        let trace_client = reqwest::Client::builder()
            .build()
            .map_err(|e| StreamtapError::Trace(format!("Failed to create HTTP client: {e}")))?;
        let tracer = Arc::new(Tracer::from_config(&self.config.observability, trace_client));
        let state = Arc::new(AppState::new(self.config, Arc::clone(&tracer))?);

        if state.config.context.catalog_enabled {
            state
                .catalog
                .spawn_refresh(state.client.clone(), state.catalog_url());
        }

        tracing::info!("Starting proxy server on {addr}");
        tracing::info!("Upstream: {}", state.config.proxy.upstream_url);
        tracing::info!(
            balance = state.balance.is_some(),
            warnings = state.config.context.warnings_enabled,
            "Stream annotations configured"
        );

        let app = create_router(state);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamtapError::Proxy(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| StreamtapError::Proxy(format!("Server error: {e}")))?;

        tracer.shutdown().await;
        tracing::info!("Proxy server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "catalog_loaded": state.catalog.is_loaded(),
        "trace_backends": state.tracer.backend_names(),
    }))
}

async fn not_found_handler() -> Response<Body> {
    create_error_response(StatusCode::NOT_FOUND, "not_found", "Route not found")
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Response<Body> {
    let request_id = RequestId::from_headers(&headers);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::Request(format!("Failed to read request body: {e}"))
                .into_response(&request_id);
        }
    };

    // Unparseable bodies are forwarded untouched with every annotation off
    let parsed = ChatCompletionRequest::from_slice(&body);
    let model = parsed.as_ref().map(|r| r.model.as_str()).unwrap_or("unknown");
    let span = tracing::info_span!("chat_completion", request_id = %request_id, model = %model);

    let mut response = proxy_chat(state, request_id.clone(), headers, body, parsed)
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn proxy_chat(
    state: Arc<AppState>,
    request_id: RequestId,
    headers: HeaderMap,
    body: Bytes,
    parsed: Option<ChatCompletionRequest>,
) -> Response<Body> {
    let started_at = Utc::now();
    let config = &state.config;

    let classification = parsed
        .as_ref()
        .map(|request| state.rules.classify(&headers, &request.messages));
    if let Some(c) = &classification {
        tracing::debug!(
            eligible = c.is_eligible_client,
            new_session = c.is_new_session,
            rule = c.rule.as_str(),
            "Client classified"
        );
    }
    let eligible = classification.is_some_and(|c| c.is_eligible_client);
    let streaming = parsed.as_ref().is_some_and(|r| r.stream);

    // Balance runs alongside the upstream request
    let balance_task = match (&state.balance, classification) {
        (Some(fetcher), Some(c)) if streaming && c.is_eligible_client && c.is_new_session => {
            bearer_token(&headers).map(|token| {
                let fetcher = fetcher.clone();
                let token = token.to_string();
                let request_id = request_id.clone();
                tokio::spawn(
                    async move { fetcher.fetch(&token, &request_id).await }
                        .instrument(Span::current()),
                )
            })
        }
        _ => None,
    };

    let limits = match &parsed {
        Some(request) if eligible && config.context.warnings_enabled => {
            if config.context.catalog_enabled {
                state.catalog.ensure_loaded(&state.client, &state.catalog_url());
            }
            Some(state.catalog.resolve(&request.model))
        }
        _ => None,
    };

    let upstream = match open_upstream(&state, &request_id, &headers, body).await {
        Ok(upstream) => upstream,
        Err(e) => {
            if let Some(task) = balance_task {
                task.abort();
            }
            return e.into_response(&request_id);
        }
    };

    let status = upstream.status();
    let response_headers = filter_headers(upstream.headers(), &["content-length"]);
    let is_event_stream = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"));

    if !is_event_stream {
        if let Some(task) = balance_task {
            task.abort();
        }
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ProxyError::Network(format!("Failed to read upstream response: {e}"))
                    .into_response(&request_id);
            }
        };

        let record = match parsed {
            Some(request) if state.tracer.is_enabled() => {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(json) => Some(trace_record(
                        request,
                        request_id,
                        AccumulatedStreamResponse::from_completion(&json),
                        started_at,
                    )),
                    Err(e) => {
                        tracing::debug!(error = %e, "Completion body is not JSON, skipping trace");
                        None
                    }
                }
            }
            _ => None,
        };

        let Some(record) = record else {
            return build_response(status, response_headers, Body::from(bytes));
        };

        // The record is dispatched once the body has been written out
        let mut response_headers = response_headers;
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        let tracer = Arc::clone(&state.tracer);
        let body = stream::once(future::ready(Ok::<_, io::Error>(bytes))).chain(
            stream::once(async move { tracer.dispatch(record) })
                .filter_map(|()| future::ready(None::<io::Result<Bytes>>)),
        );
        return build_response(status, response_headers, Body::from_stream(body));
    }

    let (tx, rx) = mpsc::channel(config.proxy.relay_buffer_chunks.max(1));
    let plan = RelayPlan {
        request_id: request_id.clone(),
        model: parsed
            .as_ref()
            .map(|r| r.model.clone())
            .unwrap_or_default(),
        balance: balance_task,
        limits,
    };
    let tracer = Arc::clone(&state.tracer);

    tokio::spawn(
        async move {
            let report = relay(Box::pin(upstream.bytes_stream()), tx, plan).await;
            match (report.outcome, report.response, parsed) {
                (RelayOutcome::Completed, Some(response), Some(request)) => {
                    tracing::info!(
                        bytes = report.captured.len(),
                        balance = report.balance_injected,
                        warning = report.warning.as_str(),
                        prompt_tokens = ?response.prompt_tokens(),
                        "Stream completed"
                    );
                    tracer.dispatch(trace_record(request, request_id, response, started_at));
                }
                (RelayOutcome::Completed, _, _) => {
                    tracing::info!(bytes = report.captured.len(), "Stream completed");
                }
                (RelayOutcome::ClientDisconnected, _, _) => {
                    tracing::info!(state = ?report.state, "Stream abandoned by client, trace skipped");
                }
                (RelayOutcome::UpstreamFailed, _, _) => {
                    tracing::warn!("Stream terminated early, trace skipped");
                }
            }
        }
        .instrument(Span::current()),
    );

    build_response(status, response_headers, Body::from_stream(ReceiverStream::new(rx)))
}

/// Send the request upstream and wait for a successful response head
async fn open_upstream(
    state: &AppState,
    request_id: &RequestId,
    headers: &HeaderMap,
    body: Bytes,
) -> std::result::Result<reqwest::Response, ProxyError> {
    let mut forwarded = filter_headers(headers, RECOMPUTED_REQUEST_HEADERS);
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        forwarded.insert(REQUEST_ID_HEADER, value);
    }

    // One deadline covers the response head and, on failure, its error body
    let header_timeout = state.config.proxy.header_timeout_secs;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(header_timeout);
    let send = state
        .client
        .post(state.chat_url())
        .headers(forwarded)
        .body(body)
        .send();

    let response = tokio::time::timeout_at(deadline, send)
        .await
        .map_err(|_| ProxyError::Timeout(header_timeout))?
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(state.config.proxy.connect_timeout_secs)
            } else {
                ProxyError::from_reqwest(&e)
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = match tokio::time::timeout_at(deadline, response.text()).await {
            Ok(body) => body.unwrap_or_default(),
            Err(_) => {
                tracing::warn!(status = status.as_u16(), "Upstream error body stalled, dropping it");
                String::new()
            }
        };
        return Err(ProxyError::Upstream { status, body });
    }

    tracing::debug!(status = status.as_u16(), "Upstream response opened");
    Ok(response)
}

/// Copy headers, leaving out hop-by-hop headers and `extra`
fn filter_headers(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if !HOP_BY_HOP_HEADERS.contains(&name_str) && !extra.contains(&name_str) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn trace_record(
    request: ChatCompletionRequest,
    request_id: RequestId,
    response: AccumulatedStreamResponse,
    started_at: DateTime<Utc>,
) -> TraceRecord {
    TraceRecord {
        request_id,
        user: request.user,
        model: request.model,
        messages: request.messages,
        params: request.params,
        streamed: request.stream,
        response,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Create a JSON error response
fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut response = build_response(status, HeaderMap::new(), Body::from(body.to_string()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
