//! Terminal channel: one socket streaming one session.
//!
//! `/ws/terminal?session=<id>&replayFrom=<n>&codec=<binary-v1|none>`
//!
//! After auth the socket gets an `attached` message, then the replay window
//! `[replayFrom, logLength)` read from the session log, then live output.
//! Live chunks that arrive during replay are held back and trimmed against
//! a cursor so every log byte reaches the client exactly once, in order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use serde::Deserialize;
use tether_protocol::messages::{parse_text, to_text};
use tether_protocol::{
    close_code, Codec, FrameCodec, ProtocolError, TerminalEvent, TerminalRequest,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::socket::{close_socket, Beat, FlowControl, FlowSignal, Heartbeat, Outbound};
use super::ChannelKind;
use crate::server::AppState;
use crate::session::tail::read_range;
use crate::session::{clamp_dimension, Attachment, AttachmentChunk, SessionError, SessionEvent};

/// Largest batch sent without waiting for the window to close.
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Live chunks held back while replay is still running.
const MAX_QUEUED_CHUNKS: usize = 256;

/// Grace period for trailing output after the session exits.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// Raw query string of a terminal socket.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalQuery {
    pub session: Option<String>,
    #[serde(rename = "replayFrom")]
    pub replay_from: Option<String>,
    pub codec: Option<String>,
}

/// Validated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalParams {
    pub session_id: String,
    pub replay_from: Option<u64>,
    pub codec: Codec,
}

impl TerminalQuery {
    pub fn parse(&self) -> Result<TerminalParams, ProtocolError> {
        let session_id = self
            .session
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::UnexpectedMessage("missing session".to_string()))?;
        let replay_from = match self.replay_from.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ProtocolError::UnexpectedMessage(format!("invalid replayFrom: {}", raw))
            })?),
        };
        let codec = self.codec.as_deref().unwrap_or_default().parse()?;
        Ok(TerminalParams {
            session_id,
            replay_from,
            codec,
        })
    }
}

/// Start of the replay window for a log of `log_length` bytes.
pub fn replay_start(requested: Option<u64>, log_length: u64, tail_bytes: u64) -> u64 {
    match requested {
        Some(from) => from.min(log_length),
        None => log_length.saturating_sub(tail_bytes),
    }
}

/// Next log offset owed to the client.
///
/// Chunks behind the cursor are dropped, overlapping ones trimmed. A chunk
/// past the cursor means an unreadable range was skipped; delivery resumes
/// from it.
#[derive(Debug, Clone)]
pub struct ReplayCursor {
    next: u64,
}

impl ReplayCursor {
    pub fn new(start: u64) -> Self {
        Self { next: start }
    }

    pub fn position(&self) -> u64 {
        self.next
    }

    pub fn accept(&mut self, chunk: AttachmentChunk) -> Option<AttachmentChunk> {
        let chunk = chunk.trim_before(self.next)?;
        if chunk.start_offset > self.next {
            tracing::debug!(
                from = self.next,
                to = chunk.start_offset,
                "Skipping unreadable log range"
            );
        }
        self.next = chunk.end_offset;
        Some(chunk)
    }
}

/// Incremental UTF-8 decoder that never splits a code point.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back as the start of an incomplete code point.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decodes as much as possible. Invalid sequences become U+FFFD.
    pub fn decode(&mut self, data: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Checked by from_utf8 above.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Coalesces chunks for a short window before they are sent.
#[derive(Debug)]
pub struct OutputBatcher {
    buf: Vec<u8>,
    end_offset: u64,
    deadline: Option<Instant>,
    window: Duration,
}

impl OutputBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            buf: Vec::new(),
            end_offset: 0,
            deadline: None,
            window,
        }
    }

    pub fn push(&mut self, chunk: AttachmentChunk) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.buf.extend_from_slice(&chunk.data);
        self.end_offset = chunk.end_offset;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Takes the batch and the log offset just past it.
    pub fn take(&mut self) -> Option<(Vec<u8>, u64)> {
        self.deadline = None;
        if self.buf.is_empty() {
            return None;
        }
        Some((std::mem::take(&mut self.buf), self.end_offset))
    }
}

/// Turns output batches into socket messages and input frames into bytes.
pub enum StreamCodec {
    Text(Utf8Decoder),
    Binary(FrameCodec),
}

impl StreamCodec {
    pub fn new(codec: Codec, session_id: &str) -> Self {
        match codec {
            Codec::None => Self::Text(Utf8Decoder::new()),
            Codec::BinaryV1 => Self::Binary(FrameCodec::new(session_id)),
        }
    }

    pub fn encode(&mut self, data: &[u8], end_offset: u64) -> Option<Message> {
        match self {
            Self::Binary(codec) => Some(Message::Binary(codec.encode_output(data))),
            Self::Text(decoder) => {
                let text = decoder.decode(data);
                if text.is_empty() {
                    return None;
                }
                let event = TerminalEvent::Output {
                    data: text,
                    offset: end_offset - decoder.pending_len() as u64,
                };
                to_text(&event).ok().map(Message::Text)
            }
        }
    }

    pub fn decode_input(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Binary(codec) => codec.decode_input(data).map(<[u8]>::to_vec),
            Self::Text(_) => Err(ProtocolError::UnexpectedBinary),
        }
    }
}

/// Handles one terminal socket from handshake to close.
pub async fn serve(mut socket: WebSocket, peer: SocketAddr, query: TerminalQuery, state: AppState) {
    let Some(ctx) = state
        .gate
        .require_auth(&mut socket, ChannelKind::Terminal, peer)
        .await
    else {
        return;
    };

    let params = match query.parse() {
        Ok(params) => params,
        Err(e) => {
            close_socket(&mut socket, close_code::PROTOCOL_VIOLATION, &e.to_string()).await;
            return;
        }
    };
    let session_id = params.session_id.clone();

    let Some(session) = state.sessions.get(&session_id) else {
        close_socket(&mut socket, close_code::SESSION_NOT_FOUND, "session not found").await;
        return;
    };

    let events = state.sessions.subscribe();
    let attachment = match state
        .sessions
        .attach(&session_id, session.cols, session.rows)
        .await
    {
        Ok(attachment) => attachment,
        Err(SessionError::NotFound(_)) => {
            close_socket(&mut socket, close_code::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Attach failed");
            close_socket(&mut socket, close_code::INTERNAL, &e.to_string()).await;
            return;
        }
    };

    tracing::info!(
        session_id = %session_id,
        actor = %ctx.actor(),
        codec = %params.codec,
        "Terminal attached"
    );

    state.metrics.connection_opened(ChannelKind::Terminal);
    let (sink, stream) = socket.split();
    let (outbound, writer) = Outbound::spawn(sink, ChannelKind::Terminal, state.metrics.clone());

    run(&state, &params, attachment, events, &outbound, stream).await;

    state.metrics.connection_closed(ChannelKind::Terminal);
    outbound.finish(writer).await;
    tracing::info!(session_id = %session_id, "Terminal detached");
}

async fn run(
    state: &AppState,
    params: &TerminalParams,
    mut attachment: Attachment,
    mut events: broadcast::Receiver<SessionEvent>,
    outbound: &Outbound,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
) {
    let stream_config = &state.config.stream;
    let session_id = params.session_id.as_str();

    let Some(mut live) = attachment.take_chunks() else {
        outbound.close(close_code::INTERNAL, "attachment already consumed");
        return;
    };

    let log_length = attachment.start_offset();
    let replay_from = replay_start(params.replay_from, log_length, stream_config.replay_tail_bytes);

    outbound.send_json(&TerminalEvent::Attached {
        session_id: session_id.to_string(),
        replay_from,
        log_length,
        codec: params.codec.to_string(),
    });

    let (backfill_tx, backfill_rx) = mpsc::channel(16);
    let log_path = state.sessions.log_path(session_id);
    let read_chunk = stream_config.read_chunk_bytes;
    let backfill_task = tokio::spawn(async move {
        if let Err(e) = read_range(&log_path, replay_from, log_length, read_chunk, &backfill_tx).await {
            tracing::warn!(path = ?log_path, error = %e, "Replay read failed; continuing live");
        }
    });

    let mut backfill = Some(backfill_rx);
    let mut queued: VecDeque<AttachmentChunk> = VecDeque::new();
    let mut cursor = ReplayCursor::new(replay_from);
    let mut batcher = OutputBatcher::new(Duration::from_millis(stream_config.batch_window_ms));
    let mut codec = StreamCodec::new(params.codec, session_id);
    let mut flow = FlowControl::new(stream_config.high_watermark, stream_config.low_watermark);
    let mut flow_tick = tokio::time::interval(Duration::from_millis(stream_config.batch_window_ms.max(1)));
    let mut heartbeat = Heartbeat::new(
        state.config.server.heartbeat_interval(),
        state.config.server.heartbeat_timeout(),
    );
    let mut exit: Option<(i32, Instant)> = None;

    loop {
        let flush_at = batcher.deadline();
        let exit_at = exit.map(|(_, at)| at);
        let take_live = !flow.is_paused() && (backfill.is_none() || queued.len() < MAX_QUEUED_CHUNKS);

        tokio::select! {
            _ = state.shutdown.cancelled() => {
                outbound.close(close_code::GOING_AWAY, "server shutting down");
                break;
            }

            chunk = recv_backfill(&mut backfill), if backfill.is_some() && !flow.is_paused() => {
                match chunk {
                    Some(chunk) => {
                        if let Some(chunk) = cursor.accept(chunk) {
                            batcher.push(chunk);
                        }
                    }
                    None => {
                        backfill = None;
                        while let Some(chunk) = queued.pop_front() {
                            if let Some(chunk) = cursor.accept(chunk) {
                                batcher.push(chunk);
                            }
                        }
                    }
                }
            }

            chunk = live.recv(), if take_live => {
                match chunk {
                    Some(chunk) if backfill.is_some() => queued.push_back(chunk),
                    Some(chunk) => {
                        if let Some(chunk) = cursor.accept(chunk) {
                            batcher.push(chunk);
                        }
                    }
                    None => {
                        outbound.close(close_code::INTERNAL, "log tail stopped");
                        break;
                    }
                }
            }

            _ = sleep_until(flush_at), if flush_at.is_some() => {
                flush(&mut batcher, &mut codec, outbound);
            }

            _ = flow_tick.tick(), if flow.is_paused() => {}

            _ = sleep_until(exit_at), if exit_at.is_some() => {
                flush(&mut batcher, &mut codec, outbound);
                let exit_code = exit.map(|(code, _)| code).unwrap_or(0);
                outbound.send_json(&TerminalEvent::Exit { exit_code });
                outbound.close(close_code::NORMAL, "session exited");
                break;
            }

            event = events.recv(), if exit.is_none() => {
                match event {
                    Ok(SessionEvent::Exited { session_id: ended, exit_code }) if ended == session_id => {
                        exit = Some((exit_code, Instant::now() + EXIT_DRAIN));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !state.sessions.contains(session_id) {
                            exit = Some((0, Instant::now() + EXIT_DRAIN));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            beat = heartbeat.tick() => {
                match beat {
                    Beat::Ping => {
                        outbound.send(Message::Ping(Vec::new()));
                    }
                    Beat::Expired => {
                        tracing::debug!(session_id = %session_id, "Terminal heartbeat expired");
                        outbound.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                        break;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_text::<TerminalRequest>(&text) {
                        Ok(request) => handle_request(state, session_id, &attachment, request).await,
                        Err(e) => {
                            outbound.close(close_code::PROTOCOL_VIOLATION, &e.to_string());
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(data))) => match codec.decode_input(&data) {
                        Ok(input) => {
                            if let Err(e) = attachment.write_input(input).await {
                                tracing::warn!(session_id = %session_id, error = %e, "Failed to write input");
                            }
                        }
                        Err(e) => {
                            outbound.close(close_code::PROTOCOL_VIOLATION, &e.to_string());
                            break;
                        }
                    },
                    Some(Ok(Message::Pong(_))) => heartbeat.pong(),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }

        if batcher.len() >= MAX_BATCH_BYTES {
            flush(&mut batcher, &mut codec, outbound);
        }
        if outbound.is_closed() {
            break;
        }
        match flow.update(outbound.buffered()) {
            Some(FlowSignal::Pause) => {
                state.metrics.flow_paused(ChannelKind::Terminal);
                if let Err(e) = state.sessions.pause_output(&attachment).await {
                    tracing::debug!(session_id = %session_id, error = %e, "Pause failed");
                }
            }
            Some(FlowSignal::Resume) => {
                state.metrics.flow_resumed(ChannelKind::Terminal);
                if let Err(e) = state.sessions.resume_output(&attachment).await {
                    tracing::debug!(session_id = %session_id, error = %e, "Resume failed");
                }
            }
            None => {}
        }
    }

    backfill_task.abort();
    if flow.is_paused() {
        state.metrics.flow_resumed(ChannelKind::Terminal);
    }
    if attachment.is_paused() {
        if let Err(e) = state.sessions.resume_output(&attachment).await {
            tracing::debug!(session_id = %session_id, error = %e, "Resume on close failed");
        }
    }
    tracing::debug!(session_id = %session_id, offset = cursor.position(), "Terminal stream ended");
}

async fn handle_request(
    state: &AppState,
    session_id: &str,
    attachment: &Attachment,
    request: TerminalRequest,
) {
    match request {
        TerminalRequest::Input { data } => {
            if let Err(e) = attachment.write_input(data.into_bytes()).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to write input");
            }
        }
        TerminalRequest::Resize { cols, rows } => {
            let cols = clamp_dimension(cols);
            let rows = clamp_dimension(rows);
            if let Err(e) = attachment.resize(cols, rows) {
                tracing::debug!(session_id = %session_id, error = %e, "Attach resize failed");
            }
            if let Err(e) = state.sessions.resize(session_id, cols, rows).await {
                tracing::debug!(session_id = %session_id, error = %e, "Session resize failed");
            }
        }
    }
}

fn flush(batcher: &mut OutputBatcher, codec: &mut StreamCodec, outbound: &Outbound) {
    if let Some((data, end_offset)) = batcher.take() {
        if let Some(message) = codec.encode(&data, end_offset) {
            outbound.send(message);
        }
    }
}

async fn recv_backfill(
    rx: &mut Option<mpsc::Receiver<AttachmentChunk>>,
) -> Option<AttachmentChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: u64, data: &[u8]) -> AttachmentChunk {
        AttachmentChunk::new(start, data.to_vec())
    }

    #[test]
    fn test_query_parse() {
        let query = TerminalQuery {
            session: Some("abc".to_string()),
            replay_from: Some("42".to_string()),
            codec: Some("binary-v1".to_string()),
        };
        assert_eq!(
            query.parse().unwrap(),
            TerminalParams {
                session_id: "abc".to_string(),
                replay_from: Some(42),
                codec: Codec::BinaryV1,
            }
        );

        let defaults = TerminalQuery {
            session: Some("abc".to_string()),
            ..Default::default()
        };
        let params = defaults.parse().unwrap();
        assert_eq!(params.replay_from, None);
        assert_eq!(params.codec, Codec::None);

        assert!(TerminalQuery::default().parse().is_err());
        let bad_codec = TerminalQuery {
            codec: Some("zstd".to_string()),
            ..defaults.clone()
        };
        assert!(bad_codec.parse().is_err());
        let bad_offset = TerminalQuery {
            replay_from: Some("-1".to_string()),
            ..defaults
        };
        assert!(bad_offset.parse().is_err());
    }

    #[test]
    fn test_replay_start() {
        assert_eq!(replay_start(Some(10), 100, 50), 10);
        assert_eq!(replay_start(Some(500), 100, 50), 100);
        assert_eq!(replay_start(None, 100, 50), 50);
        assert_eq!(replay_start(None, 20, 50), 0);
    }

    #[test]
    fn test_cursor_exactly_once_with_overlap() {
        let mut cursor = ReplayCursor::new(5);
        let mut out = Vec::new();

        // Replay, then live data that overlaps it and repeats it.
        for c in [
            chunk(5, b"hello"),
            chunk(10, b" wor"),
            chunk(8, b"lo world"),
            chunk(10, b" wor"),
            chunk(16, b"!"),
        ] {
            if let Some(c) = cursor.accept(c) {
                out.extend(c.data);
            }
        }
        assert_eq!(out, b"hello world!");
        assert_eq!(cursor.position(), 17);
    }

    #[test]
    fn test_cursor_skips_gap() {
        let mut cursor = ReplayCursor::new(0);
        assert!(cursor.accept(chunk(0, b"ab")).is_some());
        let jumped = cursor.accept(chunk(10, b"cd")).unwrap();
        assert_eq!(jumped.start_offset, 10);
        assert_eq!(cursor.position(), 12);
    }

    #[test]
    fn test_utf8_decoder_splits_code_points() {
        let text = "aé€😀z";
        let bytes = text.as_bytes();
        for cut in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut out = decoder.decode(&bytes[..cut]);
            out.push_str(&decoder.decode(&bytes[cut..]));
            assert_eq!(out, text, "cut at {}", cut);
            assert_eq!(decoder.pending_len(), 0);
        }
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.pending_len(), 2);
        assert_eq!(decoder.decode(b"\xac"), "€");
    }

    #[test]
    fn test_text_codec_offset_excludes_pending() {
        let mut codec = StreamCodec::new(Codec::None, "s");
        let Some(Message::Text(text)) = codec.encode(b"ok\xe2\x82", 104) else {
            panic!("expected text message");
        };
        let event: TerminalEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(
            event,
            TerminalEvent::Output {
                data: "ok".to_string(),
                offset: 102
            }
        );
    }

    #[test]
    fn test_binary_codec_roundtrip_and_rejects() {
        let mut codec = StreamCodec::new(Codec::BinaryV1, "sess");
        let frames = FrameCodec::new("sess");

        let Some(Message::Binary(frame)) = codec.encode(b"out", 3) else {
            panic!("expected binary message");
        };
        assert_eq!(frames.decode(&frame).unwrap().payload, b"out");

        let input = frames.encode(tether_protocol::FrameType::Input, b"ls\r");
        assert_eq!(codec.decode_input(&input).unwrap(), b"ls\r");

        let foreign = FrameCodec::new("other").encode(tether_protocol::FrameType::Input, b"x");
        assert!(codec.decode_input(&foreign).is_err());
        let mut unknown = input.clone();
        unknown[0] = 0x09;
        assert!(codec.decode_input(&unknown).is_err());

        let text = StreamCodec::new(Codec::None, "sess");
        assert_eq!(text.decode_input(&input), Err(ProtocolError::UnexpectedBinary));
    }

    #[tokio::test]
    async fn test_batcher_coalesces() {
        let mut batcher = OutputBatcher::new(Duration::from_millis(16));
        assert!(batcher.deadline().is_none());
        assert!(batcher.take().is_none());

        batcher.push(chunk(0, b"ab"));
        let deadline = batcher.deadline().unwrap();
        batcher.push(chunk(2, b"cd"));
        assert_eq!(batcher.deadline(), Some(deadline));

        assert_eq!(batcher.take(), Some((b"abcd".to_vec(), 4)));
        assert!(batcher.is_empty());
        assert!(batcher.deadline().is_none());
    }
}
