//! Chat-completion proxy
//!
//! Request classification, model limits, balance lookup, SSE handling and
//! the live relay, plus the HTTP server that ties them together.

pub mod balance;
pub mod classifier;
pub mod error;
pub mod models;
pub mod relay;
pub mod request;
pub mod request_id;
pub mod server;
pub mod sse;
pub mod warning;

pub use balance::{Balance, BalanceFetcher, Credits};
pub use classifier::{ClientClassification, ClientRule, ClientRules};
pub use error::ProxyError;
pub use models::{ModelCatalog, ModelLimits, Provider};
pub use relay::{RelayOutcome, RelayPlan, RelayReport, RelayState, SentinelScanner, relay};
pub use request::{ChatCompletionRequest, ChatMessage};
pub use request_id::RequestId;
pub use server::{AppState, ProxyServer, create_router};
pub use sse::{AccumulatedStreamResponse, SseEvent, SseParser, StreamingChunk, Usage};
pub use warning::WarningLevel;
