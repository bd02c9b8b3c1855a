//! Desktop channel: a byte-transparent proxy between the socket and a local
//! remote-desktop server (VNC by default).
//!
//! If nothing listens on the configured address, the first installed
//! candidate command is started and polled until it accepts connections.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use tether_protocol::close_code;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::socket::{close_socket, Beat, FlowControl, FlowSignal, Heartbeat, Outbound};
use super::{ChannelError, ChannelKind};
use crate::config::DesktopConfig;
use crate::server::AppState;

/// Upstream read size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Delay between connection attempts while a server starts.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Finds or starts the desktop server.
pub struct DesktopBackend {
    addr: String,
    candidates: Vec<String>,
    startup_timeout: Duration,
    resume_poll: Duration,
    child: Mutex<Option<Child>>,
}

impl DesktopBackend {
    pub fn from_config(config: &DesktopConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            candidates: config.candidates.clone(),
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            resume_poll: Duration::from_millis(config.resume_poll_ms),
            child: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connects to the desktop server, starting one if needed.
    pub async fn connect(&self) -> Result<TcpStream, ChannelError> {
        if let Ok(stream) = TcpStream::connect(&self.addr).await {
            return Ok(stream);
        }

        let mut child = self.child.lock().await;
        // Another socket may have started it while we waited.
        if let Ok(stream) = TcpStream::connect(&self.addr).await {
            return Ok(stream);
        }
        if let Some(mut stale) = child.take() {
            let _ = stale.kill().await;
        }

        for candidate in &self.candidates {
            let mut parts = candidate.split_whitespace();
            let Some(program) = parts.next() else {
                continue;
            };
            let Ok(path) = which::which(program) else {
                tracing::debug!(program = %program, "Desktop candidate not installed");
                continue;
            };

            tracing::info!(command = %candidate, "Starting desktop server");
            let mut process = match Command::new(path)
                .args(parts)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(process) => process,
                Err(e) => {
                    tracing::warn!(command = %candidate, error = %e, "Failed to start desktop server");
                    continue;
                }
            };

            match self.wait_ready(&mut process).await {
                Some(stream) => {
                    *child = Some(process);
                    return Ok(stream);
                }
                None => {
                    tracing::warn!(command = %candidate, "Desktop server did not come up");
                    let _ = process.kill().await;
                }
            }
        }

        Err(ChannelError::DesktopUnavailable(format!(
            "no desktop server reachable at {}",
            self.addr
        )))
    }

    async fn wait_ready(&self, process: &mut Child) -> Option<TcpStream> {
        let deadline = Instant::now() + self.startup_timeout;
        while Instant::now() < deadline {
            if let Ok(stream) = TcpStream::connect(&self.addr).await {
                return Some(stream);
            }
            if let Ok(Some(status)) = process.try_wait() {
                tracing::debug!(status = %status, "Desktop server exited during startup");
                return None;
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
        None
    }

    /// Stops a desktop server this process started.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

/// Handles one desktop socket from handshake to close.
pub async fn serve(mut socket: WebSocket, peer: SocketAddr, state: AppState) {
    let Some(ctx) = state
        .gate
        .require_auth(&mut socket, ChannelKind::Desktop, peer)
        .await
    else {
        return;
    };

    let upstream = match state.desktop.connect().await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(error = %e, "Desktop unavailable");
            close_socket(&mut socket, close_code::DESKTOP_UNAVAILABLE, &e.to_string()).await;
            return;
        }
    };

    tracing::info!(actor = %ctx.actor(), upstream = %state.desktop.addr(), "Desktop connected");
    state.metrics.connection_opened(ChannelKind::Desktop);
    let (sink, stream) = socket.split();
    let (outbound, writer) = Outbound::spawn(sink, ChannelKind::Desktop, state.metrics.clone());

    proxy(&state, upstream, &outbound, stream).await;

    state.metrics.connection_closed(ChannelKind::Desktop);
    outbound.finish(writer).await;
    tracing::info!(actor = %ctx.actor(), "Desktop disconnected");
}

async fn proxy(
    state: &AppState,
    upstream: TcpStream,
    outbound: &Outbound,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
) {
    let stream_config = &state.config.stream;
    let (mut up_read, mut up_write) = upstream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut flow = FlowControl::new(stream_config.high_watermark, stream_config.low_watermark);
    let mut resume_tick = tokio::time::interval(state.desktop.resume_poll.max(Duration::from_millis(1)));
    let mut heartbeat = Heartbeat::new(
        state.config.server.heartbeat_interval(),
        state.config.server.heartbeat_timeout(),
    );

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                outbound.close(close_code::GOING_AWAY, "server shutting down");
                break;
            }

            read = up_read.read(&mut buf), if !flow.is_paused() => {
                match read {
                    Ok(0) => {
                        outbound.close(close_code::NORMAL, "desktop server closed");
                        break;
                    }
                    Ok(n) => {
                        if !outbound.send(Message::Binary(buf[..n].to_vec())) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Desktop upstream read failed");
                        outbound.close(close_code::DESKTOP_UNAVAILABLE, "desktop server error");
                        break;
                    }
                }
            }

            _ = resume_tick.tick(), if flow.is_paused() => {}

            beat = heartbeat.tick() => {
                match beat {
                    Beat::Ping => {
                        outbound.send(Message::Ping(Vec::new()));
                    }
                    Beat::Expired => {
                        outbound.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                        break;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = up_write.write_all(&data).await {
                            tracing::debug!(error = %e, "Desktop upstream write failed");
                            outbound.close(close_code::DESKTOP_UNAVAILABLE, "desktop server error");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        outbound.close(close_code::PROTOCOL_VIOLATION, "desktop channel carries binary frames only");
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat.pong(),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }

        if outbound.is_closed() {
            break;
        }
        match flow.update(outbound.buffered()) {
            Some(FlowSignal::Pause) => {
                tracing::trace!(buffered = outbound.buffered(), "Desktop upstream paused");
                state.metrics.flow_paused(ChannelKind::Desktop);
            }
            Some(FlowSignal::Resume) => {
                tracing::trace!(buffered = outbound.buffered(), "Desktop upstream resumed");
                state.metrics.flow_resumed(ChannelKind::Desktop);
            }
            None => {}
        }
    }

    if flow.is_paused() {
        state.metrics.flow_resumed(ChannelKind::Desktop);
    }
    let _ = up_write.shutdown().await;
}
