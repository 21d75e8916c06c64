//! Streamtap - streaming chat-completion proxy
//!
//! This crate relays OpenAI-style streamed chat completions from a single
//! upstream, annotates the stream for a known client family (credit balance
//! on new conversations, context-budget warnings at the end), and hands the
//! reconstructed turn to observability backends off the request path.

pub mod config;
pub mod error;
pub mod proxy;
pub mod trace;

pub use error::StreamtapError;
