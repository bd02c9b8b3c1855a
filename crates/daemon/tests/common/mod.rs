//! Shared harness: a real router on an ephemeral port, backed by a scripted
//! multiplexer so no tmux is needed.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use portable_pty::CommandBuilder;
use tempfile::TempDir;
use tether_daemon::auth::{AccessTokenService, AuthGate, RateLimiter};
use tether_daemon::channel::control::ControlHub;
use tether_daemon::channel::desktop::DesktopBackend;
use tether_daemon::config::Config;
use tether_daemon::server::{self, AppState};
use tether_daemon::session::backend::session_name;
use tether_daemon::session::{
    BackendError, CreateSpec, ManagerConfig, MultiplexerBackend, PaneInfo, SessionManager,
};
use tether_daemon::store::{JsonStore, Store};
use tether_daemon::telemetry::{AuditLog, LogNotifier, MemoryAuditSink, Metrics};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for any single server message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer of a client that is not reading, small enough that the
/// server's socket writes stall after a few hundred kilobytes.
const STALLED_RECV_BUFFER: u32 = 4096;

/// Multiplexer that keeps panes in memory.
#[derive(Default)]
pub struct FakeBackend {
    panes: Mutex<Vec<PaneInfo>>,
    killed: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn add_pane(&self, id: &str) {
        self.panes.lock().unwrap().push(PaneInfo {
            session_name: session_name(id),
            cwd: "/tmp".to_string(),
            width: 80,
            height: 24,
            created_secs: 1_700_000_000,
            dead: false,
            dead_status: None,
            pid: None,
            cli: Some("shell".to_string()),
        });
    }
}

#[async_trait]
impl MultiplexerBackend for FakeBackend {
    async fn probe(&self) -> Result<String, BackendError> {
        Ok("tmux 3.4".to_string())
    }

    async fn create_session(&self, spec: &CreateSpec) -> Result<(), BackendError> {
        self.panes.lock().unwrap().push(PaneInfo {
            session_name: spec.name.clone(),
            cwd: spec.cwd.to_string_lossy().into_owned(),
            width: spec.cols,
            height: spec.rows,
            created_secs: 1_700_000_000,
            dead: false,
            dead_status: None,
            pid: None,
            cli: Some(spec.cli.clone()),
        });
        Ok(())
    }

    async fn list_panes(&self) -> Result<Vec<PaneInfo>, BackendError> {
        Ok(self.panes.lock().unwrap().clone())
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), BackendError> {
        for pane in self.panes.lock().unwrap().iter_mut() {
            if pane.session_name == name {
                pane.width = cols;
                pane.height = rows;
            }
        }
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), BackendError> {
        self.panes.lock().unwrap().retain(|p| p.session_name != name);
        self.killed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn attach_command(&self, _name: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "cat > /dev/null"]);
        cmd
    }
}

/// A running daemon and handles into its internals.
pub struct TestServer {
    pub addr: SocketAddr,
    pub tokens: Arc<AccessTokenService>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: SessionManager,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<JsonStore>,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<MemoryAuditSink>,
    pub shutdown: CancellationToken,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a server after `configure` has adjusted the test defaults.
    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().to_path_buf();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.reconcile_interval_ms = 50;
        config.stream.batch_window_ms = 5;
        configure(&mut config);
        let config = Arc::new(config);

        let store = Arc::new(JsonStore::open(config.daemon.store_path()).unwrap());
        let store_dyn: Arc<dyn Store> = store.clone();
        let tokens = Arc::new(AccessTokenService::with_secret(
            vec![42u8; 32],
            config.auth.token_ttl(),
            store_dyn.clone(),
        ));
        let limiter = Arc::new(RateLimiter::from_config(&config.auth.rate_limit));
        let audit_sink = Arc::new(MemoryAuditSink::default());
        let audit = AuditLog::new().with_sink(audit_sink.clone());
        let metrics = Arc::new(Metrics::new());

        let gate = Arc::new(AuthGate::new(
            tokens.clone(),
            limiter.clone(),
            audit.clone(),
            metrics.clone(),
            config.auth.auth_deadline(),
        ));

        let backend = Arc::new(FakeBackend::default());
        let sessions = SessionManager::new(backend.clone(), ManagerConfig::from_config(&config));
        assert!(sessions.init().await);

        let shutdown = CancellationToken::new();
        let control = Arc::new(ControlHub::new(
            sessions.clone(),
            store_dyn,
            audit,
            Arc::new(LogNotifier),
            metrics.clone(),
        ));
        control.spawn_event_listener(shutdown.child_token());
        sessions.spawn_reconcile_loop(shutdown.child_token());

        let state = AppState {
            config: config.clone(),
            gate,
            sessions: sessions.clone(),
            control,
            desktop: Arc::new(DesktopBackend::from_config(&config.desktop)),
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, state));

        Self {
            addr,
            tokens,
            limiter,
            sessions,
            backend,
            store,
            metrics,
            audit: audit_sink,
            shutdown,
            dir,
        }
    }

    pub fn token(&self) -> String {
        self.tokens.issue("test", "all").unwrap().token
    }

    pub async fn connect(&self, path: &str) -> Client {
        let url = format!("ws://{}{}", self.addr, path);
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    /// Connects and completes the auth handshake.
    pub async fn connect_authed(&self, path: &str) -> Client {
        let client = self.connect(path).await;
        self.authenticate(client).await
    }

    /// Like [`connect_authed`](Self::connect_authed), over a socket with a
    /// tiny receive buffer. Server writes stall while the test stops reading.
    pub async fn connect_stalled(&self, path: &str) -> Client {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(STALLED_RECV_BUFFER).unwrap();
        let stream = socket.connect(self.addr).await.unwrap();
        let url = format!("ws://{}{}", self.addr, path);
        let (client, _) = tokio_tungstenite::client_async(url, MaybeTlsStream::Plain(stream))
            .await
            .unwrap();
        self.authenticate(client).await
    }

    async fn authenticate(&self, mut client: Client) -> Client {
        send_auth(&mut client, &self.token()).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["type"], "auth_ok", "unexpected reply: {}", reply);
        client
    }

    /// Creates a session directly through the manager.
    pub async fn spawn_session(&self) -> String {
        let id = SessionManager::generate_id();
        self.sessions
            .spawn(&id, "shell", None, Some(80), Some(24))
            .await
            .unwrap();
        id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Polls `condition` until it holds, panicking after [`RECV_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn send_auth(client: &mut Client, token: &str) {
    let text = serde_json::json!({ "type": "auth", "token": token, "client": "it" }).to_string();
    client.send(Message::Text(text)).await.unwrap();
}

pub async fn send_json(client: &mut Client, value: serde_json::Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next non-control message, or panics after [`RECV_TIMEOUT`].
pub async fn recv(client: &mut Client) -> Message {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            other => return other,
        }
    }
}

pub async fn recv_json(client: &mut Client) -> serde_json::Value {
    match recv(client).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Skips messages until one of the given `type` arrives.
pub async fn recv_type(client: &mut Client, kind: &str) -> serde_json::Value {
    loop {
        let value = recv_json(client).await;
        if value["type"] == kind {
            return value;
        }
    }
}

/// Reads until the close frame and returns its code.
pub async fn recv_close(client: &mut Client) -> u16 {
    loop {
        match recv(client).await {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame without code"),
            _ => continue,
        }
    }
}

/// Collects binary payloads until `len` bytes have arrived.
pub async fn recv_binary(client: &mut Client, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        match recv(client).await {
            Message::Binary(data) => out.extend_from_slice(&data),
            other => panic!("expected binary message, got {:?}", other),
        }
    }
    out
}

/// Concatenates terminal `output` data until `len` bytes have arrived,
/// checking that offsets only grow and end where the text does.
pub async fn recv_output(client: &mut Client, start: u64, len: usize) -> String {
    let mut text = String::with_capacity(len);
    let mut last_offset = start;
    while text.len() < len {
        let output = recv_type(client, "output").await;
        let offset = output["offset"].as_u64().unwrap();
        assert!(offset > last_offset, "offset went from {} to {}", last_offset, offset);
        last_offset = offset;
        text.push_str(output["data"].as_str().unwrap());
    }
    assert_eq!(last_offset, start + text.len() as u64);
    text
}

/// `count` numbered lines, so a lost, repeated or reordered byte shows up
/// as a mismatch.
pub fn numbered_lines(from: usize, count: usize) -> String {
    (from..from + count).map(|n| format!("{:07}\n", n)).collect()
}
