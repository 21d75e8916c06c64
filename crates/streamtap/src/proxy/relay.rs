//! Live SSE relay with capture and injection
//!
//! Forwards upstream bytes to the client as they arrive while keeping a copy
//! for reconstruction. Two synthetic chunks may be woven in: a balance chunk
//! before the first upstream byte, and a context warning right before the
//! upstream's `data: [DONE]` event. The sentinel is detected on the raw bytes
//! and forwarded exactly as received.
//!
//! The client side is a bounded channel feeding the response body, so a slow
//! client stalls upstream reads instead of growing memory, and a dropped
//! client closes the channel and ends the relay.

use std::fmt::Display;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::balance::Balance;
use super::models::ModelLimits;
use super::request_id::RequestId;
use super::sse::{AccumulatedStreamResponse, SseParser};
use super::warning::{WarningLevel, warning_chunk};

/// Start of the terminal event
const SENTINEL: &[u8] = b"data: [DONE]";

/// Items written to the client body
pub type ClientSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Relay lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Opening,
    Relaying,
    Finalizing,
    Done,
    Failed,
}

/// How the relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream finished and everything reached the client channel
    Completed,
    /// The client went away; upstream reading stopped
    ClientDisconnected,
    /// Upstream broke after the response was committed
    UpstreamFailed,
}

/// What the relay should add around the upstream bytes
pub struct RelayPlan {
    pub request_id: RequestId,
    /// Model named in the request, used for synthetic chunks
    pub model: String,
    /// Pending balance lookup; its chunk leads the stream when it yields one
    pub balance: Option<JoinHandle<Option<Balance>>>,
    /// Budget to check final usage against; `None` disables warnings
    pub limits: Option<ModelLimits>,
}

/// Result of a finished relay
#[derive(Debug)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub state: RelayState,
    /// Reconstructed response, present only when the relay completed
    pub response: Option<AccumulatedStreamResponse>,
    /// Upstream bytes seen, excluding synthetic chunks
    pub captured: Bytes,
    pub balance_injected: bool,
    pub warning: WarningLevel,
}

impl RelayReport {
    fn ended(outcome: RelayOutcome, state: RelayState, captured: BytesMut) -> Self {
        Self {
            outcome,
            state,
            response: None,
            captured: captured.freeze(),
            balance_injected: false,
            warning: WarningLevel::None,
        }
    }
}

/// Holds back bytes that are, or may become, the terminal event so that a
/// warning can still be placed in front of it.
///
/// Everything else passes through immediately. At most `SENTINEL.len() - 1`
/// bytes are held while a line start is ambiguous.
#[derive(Debug)]
pub struct SentinelScanner {
    pending: BytesMut,
    terminal: Option<BytesMut>,
    /// Whether the byte before `pending[0]` ended a line
    at_line_start: bool,
}

impl Default for SentinelScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelScanner {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
            terminal: None,
            at_line_start: true,
        }
    }

    /// Feed upstream bytes; returns the bytes safe to forward now
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        if let Some(terminal) = self.terminal.as_mut() {
            terminal.extend_from_slice(chunk);
            return Bytes::new();
        }

        self.pending.extend_from_slice(chunk);

        if let Some(pos) = self.find_sentinel() {
            let terminal = self.pending.split_off(pos);
            self.terminal = Some(terminal);
            return self.pending.split().freeze();
        }

        let held = self.ambiguous_tail_len();
        let forward = self.pending.split_to(self.pending.len() - held).freeze();
        if let Some(last) = forward.last() {
            self.at_line_start = *last == b'\n';
        }
        forward
    }

    /// Whether the terminal event has been seen
    pub fn saw_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// End of input: held non-terminal bytes, and the terminal event if seen
    pub fn finish(self) -> (Bytes, Option<Bytes>) {
        (self.pending.freeze(), self.terminal.map(BytesMut::freeze))
    }

    fn is_line_start(&self, pos: usize) -> bool {
        if pos == 0 {
            self.at_line_start
        } else {
            self.pending[pos - 1] == b'\n'
        }
    }

    fn find_sentinel(&self) -> Option<usize> {
        let buf = &self.pending[..];
        if buf.len() < SENTINEL.len() {
            return None;
        }
        (0..=buf.len() - SENTINEL.len())
            .find(|&pos| self.is_line_start(pos) && buf[pos..].starts_with(SENTINEL))
    }

    /// Length of the longest tail starting at a line start that is a proper
    /// prefix of the sentinel
    fn ambiguous_tail_len(&self) -> usize {
        let len = self.pending.len();
        let earliest = len.saturating_sub(SENTINEL.len() - 1);
        (earliest..len)
            .find(|&pos| {
                self.is_line_start(pos) && SENTINEL.starts_with(&self.pending[pos..])
            })
            .map(|pos| len - pos)
            .unwrap_or(0)
    }
}

/// Drive one streamed response from upstream to the client channel
pub async fn relay<S, E>(mut upstream: S, tx: ClientSender, plan: RelayPlan) -> RelayReport
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let RelayPlan {
        request_id,
        model,
        balance,
        limits,
    } = plan;
    let mut captured = BytesMut::new();
    let mut scanner = SentinelScanner::new();
    let mut balance_injected = false;
    let synthetic_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    // Opening: settle the balance before the first byte goes out
    if let Some(mut handle) = balance {
        let settled = tokio::select! {
            biased;
            _ = tx.closed() => None,
            joined = &mut handle => Some(joined),
        };
        let Some(joined) = settled else {
            handle.abort();
            tracing::debug!(%request_id, "Client left while balance was pending");
            return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Opening, captured);
        };
        let balance = joined.unwrap_or_else(|e| {
            tracing::warn!(%request_id, error = %e, "Balance task failed");
            None
        });

        if let Some(balance) = balance {
            let chunk = balance.to_chunk(&synthetic_id, &model, created);
            if tx.send(Ok(chunk.to_sse_bytes())).await.is_err() {
                return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Opening, captured);
            }
            balance_injected = true;
        }
    }

    // Relaying
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::info!(
                    %request_id,
                    captured_bytes = captured.len(),
                    "Client disconnected mid-stream, dropping upstream"
                );
                return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Relaying, captured);
            }
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                captured.extend_from_slice(&bytes);
                let forward = scanner.push(&bytes);
                if !forward.is_empty() && tx.send(Ok(forward)).await.is_err() {
                    tracing::info!(%request_id, "Client disconnected mid-stream, dropping upstream");
                    return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Relaying, captured);
                }
            }
            Some(Err(e)) if scanner.saw_terminal() => {
                // Upstream already finished the turn; only the close failed
                tracing::warn!(
                    %request_id,
                    error = %e,
                    "Upstream errored after the terminal event"
                );
                break;
            }
            Some(Err(e)) => {
                let (held, _) = std::mem::take(&mut scanner).finish();
                if !held.is_empty() && tx.send(Ok(held)).await.is_err() {
                    return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Relaying, captured);
                }
                tracing::error!(
                    %request_id,
                    error_type = "mid_stream",
                    error_message = %e,
                    captured_bytes = captured.len(),
                    "Upstream failed after the response was committed"
                );
                let _ = tx
                    .send(Err(io::Error::other(format!("upstream stream failed: {e}"))))
                    .await;
                return RelayReport::ended(RelayOutcome::UpstreamFailed, RelayState::Failed, captured);
            }
            None => break,
        }
    }

    // Finalizing
    let (held, terminal) = scanner.finish();
    let response = SseParser::reconstruct(&captured);
    let mut warning = WarningLevel::None;
    let mut outgoing = Vec::with_capacity(3);

    if !held.is_empty() {
        outgoing.push(held);
    }

    if let (Some(limits), Some(prompt_tokens)) = (limits, response.prompt_tokens()) {
        warning = WarningLevel::for_limits(prompt_tokens, &limits);
        let id = response.id.as_deref().unwrap_or(&synthetic_id);
        let chunk_model = response.model.as_deref().unwrap_or(&model);
        let chunk_created = response.created.unwrap_or(created);
        if let Some(chunk) = warning_chunk(prompt_tokens, &limits, id, chunk_model, chunk_created) {
            tracing::info!(
                %request_id,
                level = warning.as_str(),
                prompt_tokens,
                max_context_tokens = limits.max_context_tokens,
                "Appending context warning"
            );
            outgoing.push(chunk.to_sse_bytes());
        }
    }

    if let Some(terminal) = terminal {
        outgoing.push(terminal);
    } else {
        tracing::debug!(%request_id, "Upstream ended without a terminal event");
    }

    for bytes in outgoing {
        if tx.send(Ok(bytes)).await.is_err() {
            tracing::info!(%request_id, "Client disconnected while finalizing");
            return RelayReport::ended(RelayOutcome::ClientDisconnected, RelayState::Finalizing, captured);
        }
    }

    RelayReport {
        outcome: RelayOutcome::Completed,
        state: RelayState::Done,
        response: Some(response),
        captured: captured.freeze(),
        balance_injected,
        warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::balance::Credits;
    use crate::proxy::models::Provider;
    use futures::stream;
    use std::time::Duration;

    fn scan_all(chunks: &[&[u8]]) -> (Vec<u8>, Vec<u8>, Option<Vec<u8>>) {
        let mut scanner = SentinelScanner::new();
        let mut forwarded = Vec::new();
        for chunk in chunks {
            forwarded.extend_from_slice(&scanner.push(chunk));
        }
        let (held, terminal) = scanner.finish();
        (forwarded, held.to_vec(), terminal.map(|t| t.to_vec()))
    }

    fn plan(balance: Option<JoinHandle<Option<Balance>>>, limits: Option<ModelLimits>) -> RelayPlan {
        RelayPlan {
            request_id: RequestId::generate(),
            model: "anthropic/claude-sonnet-4".to_string(),
            balance,
            limits,
        }
    }

    fn upstream(parts: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    async fn collect(mut rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> (Vec<Bytes>, bool) {
        let mut items = Vec::new();
        let mut errored = false;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(bytes) => items.push(bytes),
                Err(_) => errored = true,
            }
        }
        (items, errored)
    }

    const CONTENT: &str = "data: {\"id\":\"chatcmpl-u\",\"model\":\"anthropic/claude-sonnet-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n";
    const USAGE: &str = "data: {\"id\":\"chatcmpl-u\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":200000,\"completion_tokens\":1,\"total_tokens\":200001}}\n\n";
    const DONE: &str = "data: [DONE]\n\n";

    #[test]
    fn test_scanner_passes_plain_bytes_through() {
        let (forwarded, held, terminal) = scan_all(&[b"data: {\"a\":1}\n\n", b"data: {\"b\":2}\n\n"]);
        assert_eq!(forwarded, b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert!(held.is_empty());
        assert!(terminal.is_none());
    }

    #[test]
    fn test_scanner_holds_terminal_event() {
        let (forwarded, held, terminal) = scan_all(&[b"data: {\"a\":1}\n\ndata: [DONE]\n\n"]);
        assert_eq!(forwarded, b"data: {\"a\":1}\n\n");
        assert!(held.is_empty());
        assert_eq!(terminal.unwrap(), b"data: [DONE]\n\n");
    }

    #[test]
    fn test_scanner_sentinel_split_across_chunks() {
        let (forwarded, _, terminal) = scan_all(&[b"data: {\"a\":1}\n\nda", b"ta: [DO", b"NE]\n\n"]);
        assert_eq!(forwarded, b"data: {\"a\":1}\n\n");
        assert_eq!(terminal.unwrap(), b"data: [DONE]\n\n");
    }

    #[test]
    fn test_scanner_releases_false_alarm() {
        let mut scanner = SentinelScanner::new();
        assert_eq!(&scanner.push(b"x\ndata: "), &b"x\n"[..]);
        assert_eq!(&scanner.push(b"{\"a\":1}\n\n"), &b"data: {\"a\":1}\n\n"[..]);
        assert!(!scanner.saw_terminal());
    }

    #[test]
    fn test_scanner_ignores_sentinel_text_mid_line() {
        let (forwarded, held, terminal) =
            scan_all(&[b"data: {\"content\":\"data: [DONE]\"}\n\n"]);
        assert_eq!(forwarded, b"data: {\"content\":\"data: [DONE]\"}\n\n");
        assert!(held.is_empty());
        assert!(terminal.is_none());
    }

    #[test]
    fn test_scanner_keeps_bytes_after_terminal() {
        let (_, _, terminal) = scan_all(&[b"data: [DONE]\n", b"\n: trailing\n\n"]);
        assert_eq!(terminal.unwrap(), b"data: [DONE]\n\n: trailing\n\n");
    }

    #[test]
    fn test_scanner_held_tail_returned_on_finish() {
        let (forwarded, held, terminal) = scan_all(&[b"data: {}\n\ndata"]);
        assert_eq!(forwarded, b"data: {}\n\n");
        assert_eq!(held, b"data");
        assert!(terminal.is_none());
    }

    #[tokio::test]
    async fn test_relay_passthrough_is_byte_identical() {
        let (tx, rx) = mpsc::channel(4);
        let parts = vec![CONTENT, USAGE, DONE];
        let expected: String = parts.concat();

        let relay_task = tokio::spawn(relay(upstream(parts), tx, plan(None, None)));
        let (items, errored) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(!errored);
        assert_eq!(items.concat(), expected.as_bytes());
        assert_eq!(report.outcome, RelayOutcome::Completed);
        assert_eq!(report.state, RelayState::Done);
        assert_eq!(report.captured, expected.as_bytes());
        assert_eq!(report.warning, WarningLevel::None);
        assert!(!report.balance_injected);
        let response = report.response.unwrap();
        assert_eq!(response.content, "Hi");
        assert!(response.is_complete);
    }

    #[tokio::test]
    async fn test_relay_warning_before_terminal() {
        let limits = ModelLimits {
            provider: Provider::Anthropic,
            max_context_tokens: 400_000,
        };
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(
            upstream(vec![CONTENT, USAGE, DONE]),
            tx,
            plan(None, Some(limits)),
        ));
        let (items, _) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert_eq!(report.warning, WarningLevel::Critical);
        let body = items.concat();
        assert!(body.ends_with(DONE.as_bytes()));

        let text = String::from_utf8(body).unwrap();
        let events: Vec<&str> = text.split("\n\n").filter(|e| !e.is_empty()).collect();
        let warning = events[events.len() - 2];
        assert!(warning.contains("🚨"));
        assert!(warning.contains("chatcmpl-u"));

        // The capture holds upstream bytes only
        assert_eq!(report.captured, [CONTENT, USAGE, DONE].concat().as_bytes());
    }

    #[tokio::test]
    async fn test_relay_balance_leads_stream() {
        let balance = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some(Balance {
                total_credits: Credits::Unlimited,
                used_credits: 10.0,
            })
        });
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(
            upstream(vec![CONTENT, DONE]),
            tx,
            plan(Some(balance), None),
        ));
        let (items, _) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(report.balance_injected);
        let first = std::str::from_utf8(&items[0]).unwrap();
        assert!(first.contains("unlimited"));
        assert!(first.contains("10"));
        assert_eq!(items[1..].concat(), [CONTENT, DONE].concat().as_bytes());
    }

    #[tokio::test]
    async fn test_relay_failed_balance_is_skipped() {
        let balance = tokio::spawn(async { None });
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(upstream(vec![CONTENT, DONE]), tx, plan(Some(balance), None)));
        let (items, _) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(!report.balance_injected);
        assert_eq!(items.concat(), [CONTENT, DONE].concat().as_bytes());
    }

    #[tokio::test]
    async fn test_relay_mid_stream_failure() {
        let parts: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(CONTENT)),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(stream::iter(parts), tx, plan(None, None)));
        let (items, errored) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(errored);
        assert_eq!(items.concat(), CONTENT.as_bytes());
        assert_eq!(report.outcome, RelayOutcome::UpstreamFailed);
        assert_eq!(report.state, RelayState::Failed);
        assert!(report.response.is_none());
    }

    #[tokio::test]
    async fn test_relay_error_after_terminal_still_completes() {
        let parts: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(CONTENT)),
            Ok(Bytes::from(DONE)),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(stream::iter(parts), tx, plan(None, None)));
        let (items, errored) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(!errored);
        assert_eq!(items.concat(), report.captured);
        assert!(items.concat().ends_with(DONE.as_bytes()));
        assert_eq!(report.outcome, RelayOutcome::Completed);
        assert_eq!(report.response.unwrap().content, "Hi");
    }

    #[tokio::test]
    async fn test_relay_failure_flushes_held_bytes() {
        let parts: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from("data: {}\n\ndata")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (tx, rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(stream::iter(parts), tx, plan(None, None)));
        let (items, errored) = collect(rx).await;
        let report = relay_task.await.unwrap();

        assert!(errored);
        assert_eq!(items.concat(), report.captured);
        assert_eq!(report.outcome, RelayOutcome::UpstreamFailed);
    }

    #[tokio::test]
    async fn test_slow_client_stalls_upstream_reads() {
        let (upstream_tx, upstream_rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let (tx, mut rx) = mpsc::channel(1);
        let relay_task = tokio::spawn(relay(
            tokio_stream::wrappers::ReceiverStream::new(upstream_rx),
            tx,
            plan(None, None),
        ));

        // One chunk fills the client channel, one is parked in the relay's
        // pending send, one sits in the upstream buffer. The next must block.
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(1), upstream_tx.send(Ok(Bytes::from(CONTENT))))
                .await
                .expect("upstream send should fit")
                .unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(200),
            upstream_tx.send(Ok(Bytes::from(CONTENT))),
        )
        .await;
        assert!(blocked.is_err(), "relay kept reading while the client was stalled");

        // Draining the client lets upstream reads resume
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from(CONTENT));
        tokio::time::timeout(Duration::from_secs(1), upstream_tx.send(Ok(Bytes::from(DONE))))
            .await
            .expect("upstream should resume once the client reads")
            .unwrap();
        drop(upstream_tx);

        let (items, _) = collect(rx).await;
        let report = relay_task.await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(report.outcome, RelayOutcome::Completed);
    }

    #[tokio::test]
    async fn test_relay_stops_when_client_disconnects() {
        let (upstream_tx, upstream_rx) = mpsc::channel::<Result<Bytes, io::Error>>(4);
        let (tx, mut rx) = mpsc::channel(4);
        let relay_task = tokio::spawn(relay(
            tokio_stream::wrappers::ReceiverStream::new(upstream_rx),
            tx,
            plan(None, None),
        ));

        upstream_tx.send(Ok(Bytes::from(CONTENT))).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from(CONTENT));

        // Client goes away while upstream is idle
        drop(rx);
        let report = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay should stop promptly")
            .unwrap();

        assert_eq!(report.outcome, RelayOutcome::ClientDisconnected);
        assert!(report.response.is_none());
        assert!(upstream_tx.is_closed());
    }
}
