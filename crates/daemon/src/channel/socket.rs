//! Socket plumbing shared by every channel: close frames, the outbound
//! writer with its unsent-byte counter, watermark flow control and the
//! ping/pong heartbeat.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::ChannelKind;
use crate::telemetry::Metrics;

/// Longest close reason a websocket close frame can carry.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// How long [`Outbound::finish`] waits for queued messages to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds a close message, truncating the reason on a char boundary.
pub fn close_message(code: u16, reason: &str) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON_BYTES);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(reason[..end].to_string()),
    }))
}

/// Sends a close frame on a socket that has not been split. Errors are
/// ignored; the peer may already be gone.
pub async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket.send(close_message(code, reason)).await;
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

/// Queue in front of a socket's sink.
///
/// Messages are written by a dedicated task so producers never wait on the
/// network. `buffered()` is the number of payload bytes queued but not yet
/// written, which drives flow control.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
    kind: ChannelKind,
    metrics: Arc<Metrics>,
}

impl Outbound {
    /// Starts the writer task for `sink`.
    pub fn spawn(
        mut sink: SplitSink<WebSocket, Message>,
        kind: ChannelKind,
        metrics: Arc<Metrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let buffered = Arc::new(AtomicUsize::new(0));

        let writer_buffered = Arc::clone(&buffered);
        let writer_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let len = payload_len(&message);
                let closing = matches!(message, Message::Close(_));
                let sent = sink.send(message).await;
                writer_buffered.fetch_sub(len, Ordering::SeqCst);
                writer_metrics.buffered(kind, -(len as i64));
                if sent.is_err() || closing {
                    break;
                }
            }
            rx.close();
            let leftover = writer_buffered.swap(0, Ordering::SeqCst);
            writer_metrics.buffered(kind, -(leftover as i64));
            let _ = sink.close().await;
        });

        (
            Self {
                tx,
                buffered,
                kind,
                metrics,
            },
            handle,
        )
    }

    /// Queues a message. Returns false once the writer has stopped.
    pub fn send(&self, message: Message) -> bool {
        let len = payload_len(&message);
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.metrics.buffered(self.kind, len as i64);
        if self.tx.send(message).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            self.metrics.buffered(self.kind, -(len as i64));
            return false;
        }
        true
    }

    /// Serializes and queues a JSON text message.
    pub fn send_json<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send(Message::Text(text)),
            Err(e) => {
                tracing::error!("Failed to encode outbound message: {}", e);
                false
            }
        }
    }

    /// Queues a close frame. Nothing sent afterwards reaches the peer.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.send(close_message(code, reason));
    }

    /// Payload bytes queued but not yet written.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits for the writer to drain, up to a short timeout.
    pub async fn finish(self, writer: JoinHandle<()>) {
        drop(self);
        if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
            tracing::debug!("Socket writer did not drain in time");
        }
    }
}

/// Result of a watermark check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

/// High/low watermark hysteresis over a buffered-byte count.
#[derive(Debug, Clone)]
pub struct FlowControl {
    high: usize,
    low: usize,
    paused: bool,
}

impl FlowControl {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low,
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pauses above `high`, resumes at or below `low`. Returns a signal only
    /// on a state change.
    pub fn update(&mut self, buffered: usize) -> Option<FlowSignal> {
        if !self.paused && buffered > self.high {
            self.paused = true;
            Some(FlowSignal::Pause)
        } else if self.paused && buffered <= self.low {
            self.paused = false;
            Some(FlowSignal::Resume)
        } else {
            None
        }
    }
}

/// What a heartbeat tick asks the connection to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a ping.
    Ping,
    /// No pong arrived in time; close with `HEARTBEAT_TIMEOUT`.
    Expired,
}

/// Server-driven ping with a pong deadline.
pub struct Heartbeat {
    interval: Interval,
    timeout: Duration,
    last_pong: Instant,
}

impl Heartbeat {
    pub fn new(every: Duration, timeout: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            timeout,
            last_pong: Instant::now(),
        }
    }

    /// Waits for the next tick.
    pub async fn tick(&mut self) -> Beat {
        let now = self.interval.tick().await;
        if now.duration_since(self.last_pong) >= self.timeout {
            Beat::Expired
        } else {
            Beat::Ping
        }
    }

    pub fn pong(&mut self) {
        self.last_pong = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let Message::Close(Some(frame)) = close_message(4001, &reason) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 4001);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON_BYTES);
        assert_eq!(frame.reason.len(), 122);
    }

    #[test]
    fn test_short_reason_kept() {
        let Message::Close(Some(frame)) = close_message(4004, "session not found") else {
            panic!("expected close frame");
        };
        assert_eq!(frame.reason, "session not found");
    }

    #[test]
    fn test_flow_control_hysteresis() {
        let mut flow = FlowControl::new(100, 25);
        assert_eq!(flow.update(100), None);
        assert_eq!(flow.update(101), Some(FlowSignal::Pause));
        assert_eq!(flow.update(500), None);
        assert_eq!(flow.update(26), None);
        assert!(flow.is_paused());
        assert_eq!(flow.update(25), Some(FlowSignal::Resume));
        assert_eq!(flow.update(0), None);
        assert_eq!(flow.update(101), Some(FlowSignal::Pause));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expires_without_pong() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(15), Duration::from_secs(45));
        assert_eq!(heartbeat.tick().await, Beat::Ping);
        assert_eq!(heartbeat.tick().await, Beat::Ping);
        assert_eq!(heartbeat.tick().await, Beat::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pong_resets_deadline() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(15), Duration::from_secs(45));
        for _ in 0..10 {
            assert_eq!(heartbeat.tick().await, Beat::Ping);
            heartbeat.pong();
        }
    }
}
