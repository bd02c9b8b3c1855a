//! HTTP surface: the axum router, shared state and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tether_protocol::PROTOCOL_VERSION;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthGate;
use crate::channel::control::{self, ControlHub};
use crate::channel::desktop::{self, DesktopBackend};
use crate::channel::terminal::{self, TerminalQuery};
use crate::config::Config;
use crate::session::SessionManager;
use crate::telemetry::Metrics;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<AuthGate>,
    pub sessions: SessionManager,
    pub control: Arc<ControlHub>,
    pub desktop: Arc<DesktopBackend>,
    pub metrics: Arc<Metrics>,
    /// Cancelled when the daemon shuts down; open sockets close with 1001.
    pub shutdown: CancellationToken,
}

/// Builds the router with all endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/control", get(control_handler))
        .route("/ws/terminal", get(terminal_handler))
        .route("/ws/desktop", get(desktop_handler))
        .route("/healthz", get(health))
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn control_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| control::serve(socket, peer, state))
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| terminal::serve(socket, peer, query, state))
}

async fn desktop_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| desktop::serve(socket, peer, state))
}

/// GET /healthz
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "tmux": state.sessions.is_available(),
        "sessions": state.sessions.list_sessions().len(),
        "control_sockets": state.control.socket_count(),
        "metrics": state.metrics.snapshot(),
    }))
}
