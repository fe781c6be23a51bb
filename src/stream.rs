//! Progress transport for the analysis service.
//!
//! Owns one server-sent-event subscription per query, decodes the event
//! vocabulary into transport signals, and guarantees that at most one
//! terminal signal is delivered per subscription.

use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::state::{CompletePayload, StageId, StageStatus, StageUpdate};

/// Transport-layer errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to parse progress data")]
    Protocol,

    #[error("Stream request failed: {0}")]
    Connect(String),

    #[error("Connection lost after {0} attempts")]
    ConnectionLost(u32),
}

/// One decoded message from the progress stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Handshake/heartbeat, carries no information
    Connection,

    /// Stage-level progress
    Stage(StageUpdate),

    /// Terminal success with the final payload
    Complete(CompletePayload),

    /// Terminal without payload; a prior Complete already delivered it
    StreamEnd,

    /// Terminal failure reported by the backend
    Error(String),

    /// Well-formed JSON that matches no known shape; dropped
    Ignored,
}

/// Signal delivered to the transport's owner
#[derive(Debug)]
pub enum TransportSignal {
    Stage(StageUpdate),
    Success(CompletePayload),
    Failure(String),
}

/// Decode one `data:` payload into a stream event
pub fn parse_event(data: &str) -> Result<StreamEvent, StreamError> {
    let value: Value = serde_json::from_str(data).map_err(|_| StreamError::Protocol)?;

    if let Some(step) = value.get("step").and_then(|v| v.as_str()) {
        match step {
            "connection" => return Ok(StreamEvent::Connection),
            "complete" => {
                let payload = value
                    .get("data")
                    .cloned()
                    .map(serde_json::from_value)
                    .and_then(Result::ok)
                    .unwrap_or_default();
                return Ok(StreamEvent::Complete(payload));
            }
            "stream-end" => return Ok(StreamEvent::StreamEnd),
            _ => {}
        }
    }

    // An error status terminates the run regardless of any step field
    if value.get("status").and_then(|v| v.as_str()) == Some("error") {
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Analysis failed")
            .to_string();
        return Ok(StreamEvent::Error(message));
    }

    if let (Some(step), Some(status)) = (
        value.get("step").and_then(|v| v.as_str()),
        value.get("status").and_then(|v| v.as_str()),
    ) {
        let stage = StageId::from_wire_id(step);
        let status = match status {
            "active" => Some(StageStatus::Active),
            "completed" => Some(StageStatus::Completed),
            _ => None,
        };
        if let (Some(stage), Some(status)) = (stage, status) {
            return Ok(StreamEvent::Stage(StageUpdate {
                stage,
                status,
                message: value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|m| m.to_string()),
            }));
        }
        debug!("Dropping progress event for unknown stage/status: {}", value);
    }

    Ok(StreamEvent::Ignored)
}

/// Locate the first complete SSE frame in `buf`.
///
/// Returns the frame length and the length of its separator. Frames are
/// delimited by a blank line, either `\n\n` or `\r\n\r\n`.
fn frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// Join the `data:` lines of one SSE frame; comments and other fields are
/// ignored because the service only ever sends data payloads.
fn frame_data(frame_text: &str) -> Option<String> {
    let mut data_lines = Vec::new();

    for line in frame_text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Handle to a live subscription. `stop` is idempotent and safe to call at
/// any time, including after the subscription already terminated.
#[derive(Debug)]
pub struct StreamHandle {
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Release the subscription; no further signals will be delivered
    pub fn stop(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("🔌 Progress stream closed");
        }
        self.task.abort();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of pumping one connection's byte stream
enum PumpOutcome {
    /// A terminal signal was delivered; the subscription is done
    Terminated,

    /// The connection dropped before a terminal event
    Disconnected,
}

/// SSE subscription factory for progress streams
pub struct ProgressStream {
    client: reqwest::Client,
    config: Config,
}

impl ProgressStream {
    pub fn new(config: &Config) -> Self {
        // No overall request timeout: the stream stays open for the whole
        // run. Only the connection setup is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.api.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
        }
    }

    /// Open a subscription for `query`.
    ///
    /// Signals arrive on the returned channel in arrival order. After a
    /// `Success` or `Failure` signal the channel closes and the connection
    /// is released. A dropped connection is re-established up to the
    /// configured attempt budget, 3 seconds apart by default.
    pub fn subscribe(&self, query: &str) -> (StreamHandle, mpsc::Receiver<TransportSignal>) {
        let (tx, rx) = mpsc::channel(32);
        let closed = Arc::new(AtomicBool::new(false));

        let url = format!(
            "{}/process-query-stream?query={}",
            self.config.api.base_url.trim_end_matches('/'),
            urlencoding::encode(query)
        );
        let client = self.client.clone();
        let max_attempts = self.config.stream.reconnect_attempts.max(1);
        let retry_delay = Duration::from_secs(self.config.stream.reconnect_delay_secs);
        let task_closed = Arc::clone(&closed);

        let task = tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }

                match client
                    .get(&url)
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("📡 Progress stream connected (attempt {})", attempt);
                        match pump(resp.bytes_stream(), &tx, &task_closed).await {
                            PumpOutcome::Terminated => return,
                            PumpOutcome::Disconnected => {
                                warn!(
                                    "Progress stream dropped before a terminal event \
                                     (attempt {}/{})",
                                    attempt, max_attempts
                                );
                            }
                        }
                    }
                    Ok(resp) => {
                        // A refused subscription is not retried
                        let reason = StreamError::Connect(resp.status().to_string());
                        deliver_failure(&tx, &task_closed, reason.to_string()).await;
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "Progress stream connect error (attempt {}/{}): {}",
                            attempt, max_attempts, e
                        );
                    }
                }

                if attempt < max_attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }

            let reason = StreamError::ConnectionLost(max_attempts);
            deliver_failure(&tx, &task_closed, reason.to_string()).await;
        });

        (StreamHandle { closed, task }, rx)
    }
}

/// Read frames off one connection until it terminates or drops
async fn pump(
    mut stream: impl StreamExt<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    tx: &mpsc::Sender<TransportSignal>,
    closed: &Arc<AtomicBool>,
) -> PumpOutcome {
    let mut buf = Vec::<u8>::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Progress stream read error: {}", e);
                return PumpOutcome::Disconnected;
            }
        };
        buf.extend_from_slice(&bytes);

        while let Some((end, sep_len)) = frame_boundary(&buf) {
            let data = std::str::from_utf8(&buf[..end])
                .ok()
                .and_then(frame_data);
            buf.drain(..end + sep_len);

            let Some(data) = data else { continue };

            if closed.load(Ordering::SeqCst) {
                return PumpOutcome::Terminated;
            }

            match parse_event(&data) {
                Ok(StreamEvent::Connection) | Ok(StreamEvent::Ignored) => {}
                Ok(StreamEvent::Stage(update)) => {
                    if tx.send(TransportSignal::Stage(update)).await.is_err() {
                        // Receiver gone; nobody is listening anymore
                        return PumpOutcome::Terminated;
                    }
                }
                Ok(StreamEvent::Complete(payload)) => {
                    let _ = tx.send(TransportSignal::Success(payload)).await;
                    return PumpOutcome::Terminated;
                }
                Ok(StreamEvent::StreamEnd) => {
                    // Results were already delivered by a prior complete
                    // event, or the run produced nothing to deliver
                    return PumpOutcome::Terminated;
                }
                Ok(StreamEvent::Error(message)) => {
                    let _ = tx.send(TransportSignal::Failure(message)).await;
                    return PumpOutcome::Terminated;
                }
                Err(e) => {
                    let _ = tx.send(TransportSignal::Failure(e.to_string())).await;
                    return PumpOutcome::Terminated;
                }
            }
        }
    }

    PumpOutcome::Disconnected
}

/// Send a failure signal unless the handle was already stopped
async fn deliver_failure(
    tx: &mpsc::Sender<TransportSignal>,
    closed: &Arc<AtomicBool>,
    reason: String,
) {
    if !closed.load(Ordering::SeqCst) {
        let _ = tx.send(TransportSignal::Failure(reason)).await;
    }
}
