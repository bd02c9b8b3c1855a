//! Control channel: session lifecycle commands and broadcast events.
//!
//! Every control socket registers with the [`ControlHub`], which fans out
//! session list changes, exits and clipboard updates to all of them.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::json;
use tether_protocol::messages::parse_text;
use tether_protocol::{
    close_code, ControlEvent, ControlRequest, ExitOutcome, SessionState, PROTOCOL_VERSION,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::socket::{Beat, Heartbeat, Outbound};
use super::ChannelKind;
use crate::auth::AuthContext;
use crate::clock::now_millis;
use crate::server::AppState;
use crate::session::{SessionError, SessionEvent, SessionManager};
use crate::store::{self, SessionUpdate, Store, TaskRecord, TaskStatus};
use crate::telemetry::{AuditEvent, AuditLog, AuditOutcome, Metrics, Notification, Notifier};

/// Features announced in the server `hello`.
pub const CAPABILITIES: &[&str] = &["spawn", "kill", "resize", "clipboard", "binary-v1", "desktop"];

/// Shared state of all control sockets.
pub struct ControlHub {
    sockets: DashMap<u64, Outbound>,
    next_socket_id: AtomicU64,
    /// Sessions whose exit was requested through `kill`.
    pending_kills: Mutex<HashSet<String>>,
    sessions: SessionManager,
    store: Arc<dyn Store>,
    audit: AuditLog,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<Metrics>,
}

impl ControlHub {
    pub fn new(
        sessions: SessionManager,
        store: Arc<dyn Store>,
        audit: AuditLog,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sockets: DashMap::new(),
            next_socket_id: AtomicU64::new(1),
            pending_kills: Mutex::new(HashSet::new()),
            sessions,
            store,
            audit,
            notifier,
            metrics,
        }
    }

    pub fn register(&self, outbound: Outbound) -> u64 {
        let id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
        self.sockets.insert(id, outbound);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.sockets.remove(&id);
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Sends an event to every control socket.
    pub fn broadcast(&self, event: &ControlEvent) {
        for entry in self.sockets.iter() {
            entry.value().send_json(event);
        }
    }

    pub fn sessions_event(&self) -> ControlEvent {
        ControlEvent::Sessions {
            list: self
                .sessions
                .list_sessions()
                .iter()
                .map(|s| s.summary())
                .collect(),
        }
    }

    pub fn broadcast_sessions(&self) {
        self.broadcast(&self.sessions_event());
    }

    /// Closes every control socket with `code`.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.sockets.iter() {
            entry.value().close(code, reason);
        }
    }

    fn mark_kill(&self, id: &str) {
        if let Ok(mut pending) = self.pending_kills.lock() {
            pending.insert(id.to_string());
        }
    }

    fn take_kill(&self, id: &str) -> bool {
        self.pending_kills
            .lock()
            .map(|mut pending| pending.remove(id))
            .unwrap_or(false)
    }

    /// Applies one request. The returned event goes to the requesting socket only.
    pub async fn handle(&self, ctx: &AuthContext, request: ControlRequest) -> Option<ControlEvent> {
        match request {
            ControlRequest::Hello { capabilities } => {
                tracing::debug!(actor = %ctx.actor(), capabilities = ?capabilities, "Client hello");
                None
            }
            ControlRequest::Spawn {
                cli,
                cwd,
                cols,
                rows,
            } => Some(self.spawn(ctx, &cli, cwd.as_deref(), cols, rows).await),
            ControlRequest::Resize {
                session_id,
                cols,
                rows,
            } => self.resize(&session_id, cols, rows).await,
            ControlRequest::Kill { session_id } => self.kill(ctx, &session_id).await,
        }
    }

    async fn spawn(
        &self,
        ctx: &AuthContext,
        cli: &str,
        cwd: Option<&str>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> ControlEvent {
        let id = SessionManager::generate_id();
        let session = match self.sessions.spawn(&id, cli, cwd, cols, rows).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(cli = %cli, error = %e, "Spawn failed");
                self.audit.record(
                    AuditEvent::new("spawn", ctx.actor(), cli, AuditOutcome::Failure)
                        .with_metadata(json!({ "error": e.to_string() })),
                );
                return error_event(&e);
            }
        };

        let now = now_millis();
        let task = TaskRecord {
            id: session.id.clone(),
            cli: session.cli.clone(),
            cwd: session.cwd.clone(),
            actor: ctx.actor(),
            status: TaskStatus::Running,
            created_at: now,
            ended_at: None,
            exit_code: None,
        };
        if let Err(e) = store::blocking(&self.store, move |s| s.add_task(task)).await {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to record task");
        }
        let record = session.record(now);
        if let Err(e) = store::blocking(&self.store, move |s| s.upsert_session(record)).await {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to record session");
        }

        self.metrics.session_spawned();
        self.audit.record(
            AuditEvent::new("spawn", ctx.actor(), session.id.as_str(), AuditOutcome::Success)
                .with_metadata(json!({ "cli": session.cli, "cwd": session.cwd })),
        );
        self.broadcast_sessions();

        ControlEvent::Spawned {
            session_id: session.id,
            cli: session.cli,
            cwd: session.cwd,
            cols: session.cols,
            rows: session.rows,
        }
    }

    async fn resize(&self, id: &str, cols: Option<u16>, rows: Option<u16>) -> Option<ControlEvent> {
        let Some(current) = self.sessions.get(id) else {
            return Some(error_event(&SessionError::NotFound(id.to_string())));
        };
        let cols = cols.unwrap_or(current.cols);
        let rows = rows.unwrap_or(current.rows);
        match self.sessions.resize(id, cols, rows).await {
            Ok((cols, rows)) => {
                let update = SessionUpdate {
                    cols: Some(cols),
                    rows: Some(rows),
                    ..Default::default()
                };
                let session_id = id.to_string();
                let result =
                    store::blocking(&self.store, move |s| s.update_session(&session_id, update))
                        .await;
                if let Err(e) = result {
                    tracing::debug!(session_id = %id, error = %e, "Failed to record resize");
                }
                self.broadcast_sessions();
                None
            }
            Err(e) => Some(error_event(&e)),
        }
    }

    async fn kill(&self, ctx: &AuthContext, id: &str) -> Option<ControlEvent> {
        self.mark_kill(id);
        let result = self.sessions.kill(id).await;
        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit
            .record(AuditEvent::new("kill", ctx.actor(), id, outcome));

        match result {
            Ok(()) => None,
            Err(e) => {
                // Nothing was killed, so any exit seen later is the session's own.
                self.take_kill(id);
                Some(error_event(&e))
            }
        }
    }

    /// Reacts to a session event from the manager.
    pub async fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Exited {
                session_id,
                exit_code,
            } => {
                let outcome = ExitOutcome::classify(self.take_kill(&session_id), exit_code);
                let now = now_millis();
                let status = match outcome {
                    ExitOutcome::Killed => TaskStatus::Killed,
                    ExitOutcome::Done => TaskStatus::Done,
                    ExitOutcome::Error => TaskStatus::Error,
                };
                let id = session_id.clone();
                let result = store::blocking(&self.store, move |s| {
                    s.update_task(&id, status, Some(exit_code), now)
                })
                .await;
                if let Err(e) = result {
                    tracing::debug!(session_id = %session_id, error = %e, "No task to update");
                }
                let id = session_id.clone();
                let update = SessionUpdate {
                    status: Some(SessionState::Killed),
                    ..Default::default()
                };
                let result = store::blocking(&self.store, move |s| s.update_session(&id, update)).await;
                if let Err(e) = result {
                    tracing::debug!(session_id = %session_id, error = %e, "No session record to update");
                }

                self.metrics.session_exited();
                tracing::info!(session_id = %session_id, exit_code = exit_code, outcome = ?outcome, "Session exited");
                self.broadcast(&ControlEvent::Exited {
                    session_id: session_id.clone(),
                    exit_code,
                    outcome,
                });
                self.broadcast_sessions();

                let notifier = Arc::clone(&self.notifier);
                let notification = Notification {
                    title: "Session ended".to_string(),
                    body: format!("Session {} ended ({:?}, exit code {})", session_id, outcome, exit_code),
                    session_id: Some(session_id),
                };
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify(notification).await {
                        tracing::debug!(error = %e, "Notification failed");
                    }
                });
            }
            SessionEvent::Discovered { session_id } => {
                if let Some(session) = self.sessions.get(&session_id) {
                    let record = session.record(now_millis());
                    let result = store::blocking(&self.store, move |s| s.upsert_session(record)).await;
                    if let Err(e) = result {
                        tracing::debug!(session_id = %session_id, error = %e, "Failed to record discovered session");
                    }
                }
                self.broadcast_sessions();
            }
            SessionEvent::Clipboard { session_id, text } => {
                self.broadcast(&ControlEvent::Clipboard { session_id, text });
            }
        }
    }

    /// Forwards manager events to [`on_session_event`](Self::on_session_event) until cancelled.
    pub fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut events = self.sessions.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => hub.on_session_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Session event listener lagged");
                            hub.broadcast_sessions();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Session event listener stopped");
        })
    }
}

fn error_event(error: &SessionError) -> ControlEvent {
    ControlEvent::Error {
        message: error.to_string(),
    }
}

/// Handles one control socket from handshake to close.
pub async fn serve(mut socket: WebSocket, peer: SocketAddr, state: AppState) {
    let Some(ctx) = state
        .gate
        .require_auth(&mut socket, ChannelKind::Control, peer)
        .await
    else {
        return;
    };

    state.metrics.connection_opened(ChannelKind::Control);
    let (sink, mut stream) = socket.split();
    let (outbound, writer) = Outbound::spawn(sink, ChannelKind::Control, state.metrics.clone());
    let hub = &state.control;

    outbound.send_json(&ControlEvent::Hello {
        version: PROTOCOL_VERSION,
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
    });
    outbound.send_json(&hub.sessions_event());
    let socket_id = hub.register(outbound.clone());
    tracing::info!(actor = %ctx.actor(), socket_id = socket_id, "Control socket connected");

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
                    Some(Ok(Message::Text(text))) => match parse_text::<ControlRequest>(&text) {
                        Ok(request) => {
                            if let Some(reply) = hub.handle(&ctx, request).await {
                                outbound.send_json(&reply);
                            }
                        }
                        Err(e) => {
                            outbound.close(close_code::PROTOCOL_VIOLATION, &e.to_string());
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        outbound.close(close_code::PROTOCOL_VIOLATION, "control channel carries text frames only");
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
    }

    hub.unregister(socket_id);
    state.metrics.connection_closed(ChannelKind::Control);
    outbound.finish(writer).await;
    tracing::info!(actor = %ctx.actor(), socket_id = socket_id, "Control socket disconnected");
}
