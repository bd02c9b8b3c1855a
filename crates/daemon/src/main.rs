//! Tether daemon
//!
//! Serves tmux-backed terminal sessions over websockets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tether_daemon::auth::{AccessTokenService, AuthGate, RateLimiter};
use tether_daemon::channel::control::ControlHub;
use tether_daemon::channel::desktop::DesktopBackend;
use tether_daemon::config::{default_config_path, Config};
use tether_daemon::pidfile::{read_running_pid, PidFile};
use tether_daemon::protocol::{close_code, SessionState};
use tether_daemon::server::{self, AppState};
use tether_daemon::session::{ManagerConfig, MultiplexerBackend, SessionManager, TmuxBackend};
use tether_daemon::store::{JsonStore, SessionUpdate, Store};
use tether_daemon::telemetry::{AuditLog, JsonlAuditSink, LogNotifier, Metrics, TracingAuditSink};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// How long the server may take to stop accepting after shutdown.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tether daemon - remote control for terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "tetherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Serve,

    /// Manage access tickets
    #[command(subcommand)]
    Token(TokenCommands),

    /// List tmux-backed sessions
    Sessions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show daemon status
    Status,
}

/// Subcommands for ticket management.
#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommands {
    /// Issue a new ticket
    Issue {
        /// `all` or a channel name (control, terminal, desktop)
        #[arg(long, default_value = "all")]
        scope: String,

        /// Who the ticket is for, recorded in the store and audit log
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Permanently revoke a ticket
    Revoke {
        token: String,

        #[arg(long, default_value = "revoked from cli")]
        reason: String,
    },

    /// Check whether a ticket would be accepted
    Verify { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose, matches!(cli.command, Commands::Serve))?;
    tracing::debug!(path = %config_path.display(), "Loaded configuration");

    match cli.command {
        Commands::Serve => run_serve(config).await?,
        Commands::Token(cmd) => run_token(&config, cmd)?,
        Commands::Sessions { json } => list_sessions(&config, json).await?,
        Commands::Status => {
            let pid_path = config.daemon.pid_file_path();
            match read_running_pid(&pid_path) {
                Some(pid) => {
                    println!("Daemon Status: running");
                    println!("  PID:      {}", pid);
                    println!("  Bind:     {}", config.server.bind);
                    println!("  Data dir: {}", config.daemon.data_dir.display());
                }
                None => {
                    println!("Daemon Status: stopped");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Sets up the global subscriber. File logging only applies to `serve`.
fn init_logging(
    config: &Config,
    verbose: bool,
    serving: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = if serving && config.daemon.log_to_file {
        let dir = config.daemon.logs_dir().join("daemon");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, "tetherd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}

/// Runs the daemon until SIGINT or SIGTERM.
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let pidfile = PidFile::acquire(config.daemon.pid_file_path()).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        eprintln!("To check daemon status, run:");
        eprintln!("  tetherd status");
        e
    })?;
    tracing::info!(pid = std::process::id(), pidfile = %pidfile.path().display(), "Tether daemon starting");

    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let store: Arc<dyn Store> = Arc::new(
        JsonStore::open(config.daemon.store_path()).context("Failed to open record store")?,
    );
    let tokens = Arc::new(
        AccessTokenService::open(
            &config.daemon.secret_path(),
            config.auth.token_ttl(),
            Arc::clone(&store),
        )
        .context("Failed to load ticket secret")?,
    );

    let audit_sink = JsonlAuditSink::open(config.daemon.audit_log_path())
        .context("Failed to open audit log")?;
    let audit = AuditLog::new()
        .with_sink(Arc::new(TracingAuditSink))
        .with_sink(Arc::new(audit_sink));
    let metrics = Arc::new(Metrics::new());

    let gate = Arc::new(AuthGate::new(
        tokens,
        Arc::new(RateLimiter::from_config(&config.auth.rate_limit)),
        audit.clone(),
        Arc::clone(&metrics),
        config.auth.auth_deadline(),
    ));

    let backend: Arc<dyn MultiplexerBackend> =
        Arc::new(TmuxBackend::new(config.session.tmux_bin.clone()));
    let sessions = SessionManager::new(backend, ManagerConfig::from_config(&config));
    sessions.init().await;
    recover_sessions(&sessions, store.as_ref()).await;

    let shutdown = CancellationToken::new();
    let control = Arc::new(ControlHub::new(
        sessions.clone(),
        Arc::clone(&store),
        audit,
        Arc::new(LogNotifier),
        Arc::clone(&metrics),
    ));
    let event_task = control.spawn_event_listener(shutdown.child_token());
    let reconcile_task = sessions.spawn_reconcile_loop(shutdown.child_token());
    let desktop = Arc::new(DesktopBackend::from_config(&config.desktop));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");

    let state = AppState {
        config: Arc::new(config),
        gate,
        sessions: sessions.clone(),
        control: Arc::clone(&control),
        desktop: Arc::clone(&desktop),
        metrics,
        shutdown: shutdown.clone(),
    };
    let mut server_task = tokio::spawn(server::serve(listener, state));

    tokio::select! {
        result = &mut server_task => {
            // The server only returns on its own if accepting failed.
            shutdown.cancel();
            result.context("Server task panicked")?.context("Server failed")?;
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
            control.close_all(close_code::GOING_AWAY, "server shutting down");
            match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_task).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Server stopped with error"),
                Ok(_) => {}
                Err(_) => tracing::warn!("Server did not stop in time"),
            }
        }
    }

    let _ = event_task.await;
    let _ = reconcile_task.await;
    sessions.shutdown();
    desktop.shutdown().await;

    // tmux sessions are left running for the next start.
    tracing::info!("Tether daemon stopped");
    Ok(())
}

/// Rebuilds the session cache from the store and tmux, marking records
/// whose session is gone as killed.
async fn recover_sessions(sessions: &SessionManager, store: &dyn Store) {
    let records = match store.list_sessions() {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read stored sessions");
            Vec::new()
        }
    };

    let report = match sessions.recover(&records).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "Session recovery failed");
            return;
        }
    };

    for id in &report.missing {
        let update = SessionUpdate {
            status: Some(SessionState::Killed),
            ..Default::default()
        };
        if let Err(e) = store.update_session(id, update) {
            tracing::warn!(session_id = %id, error = %e, "Failed to mark session killed");
        }
    }

    let now = tether_daemon::clock::now_millis();
    for id in &report.discovered {
        if let Some(session) = sessions.get(id) {
            if let Err(e) = store.upsert_session(session.record(now)) {
                tracing::warn!(session_id = %id, error = %e, "Failed to store discovered session");
            }
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            tracing::warn!("Failed to register signal handlers; falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

fn open_token_service(config: &Config) -> anyhow::Result<AccessTokenService> {
    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    let store: Arc<dyn Store> = Arc::new(
        JsonStore::open(config.daemon.store_path()).context("Failed to open record store")?,
    );
    AccessTokenService::open(&config.daemon.secret_path(), config.auth.token_ttl(), store)
        .context("Failed to load ticket secret")
}

fn run_token(config: &Config, cmd: TokenCommands) -> anyhow::Result<()> {
    let tokens = open_token_service(config)?;

    match cmd {
        TokenCommands::Issue { scope, actor } => {
            let issued = tokens.issue(&actor, &scope)?;
            println!("{}", issued.token);
            eprintln!("Scope:   {}", issued.claims.scope);
            eprintln!("ID:      {}", issued.claims.jti);
            eprintln!("Expires: {}", format_expiry(issued.expires_at));
        }
        TokenCommands::Revoke { token, reason } => {
            let claims = tokens.revoke(&token, &reason)?;
            println!("Ticket {} has been revoked", claims.jti);
        }
        TokenCommands::Verify { token } => match tokens.verify(&token) {
            Ok(verified) => {
                println!("valid");
                println!("  Scope:   {}", verified.claims.scope);
                println!("  ID:      {}", verified.claims.jti);
                println!("  Expires: {}", format_expiry(verified.expires_at));
            }
            Err(failure) => {
                println!("invalid: {}", failure.kind());
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

/// A tmux session as shown by `tetherd sessions`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRow {
    id: String,
    cli: String,
    cwd: String,
    cols: u16,
    rows: u16,
    started_at: u64,
    alive: bool,
    exit_code: Option<i32>,
}

/// Lists daemon-owned tmux sessions without going through the daemon.
async fn list_sessions(config: &Config, json: bool) -> anyhow::Result<()> {
    let backend = TmuxBackend::new(config.session.tmux_bin.clone());
    let panes = backend
        .list_panes()
        .await
        .context("Failed to query tmux")?;

    let mut rows: Vec<SessionRow> = panes
        .iter()
        .filter_map(|pane| {
            let id = pane.session_id()?;
            Some(SessionRow {
                id: id.to_string(),
                cli: pane.cli.clone().unwrap_or_else(|| "shell".to_string()),
                cwd: pane.cwd.clone(),
                cols: pane.width,
                rows: pane.height,
                started_at: pane.created_secs * 1000,
                alive: !pane.dead,
                exit_code: pane.dead_status,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
    rows.dedup_by(|a, b| a.id == b.id);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_sessions_table(&rows);
    }
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionRow]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(2).max(2);
    let cli_width = sessions.iter().map(|s| s.cli.len()).max().unwrap_or(3).max(3);

    println!(
        "{:<id_width$}  {:<cli_width$}  {:>7}  {:<7}  {:>9}  CWD",
        "ID",
        "CLI",
        "SIZE",
        "STATE",
        "STARTED",
        id_width = id_width,
        cli_width = cli_width
    );
    println!("{}", "-".repeat(id_width + cli_width + 36));

    for session in sessions {
        let state = if session.alive { "running" } else { "dead" };
        println!(
            "{:<id_width$}  {:<cli_width$}  {:>7}  {:<7}  {:>9}  {}",
            session.id,
            session.cli,
            format!("{}x{}", session.cols, session.rows),
            state,
            format_relative_time(session.started_at),
            truncate_path(&session.cwd, 40),
            id_width = id_width,
            cli_width = cli_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix millisecond timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = tether_daemon::clock::now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

fn format_expiry(expires_at_ms: u64) -> String {
    let remaining = expires_at_ms.saturating_sub(tether_daemon::clock::now_millis()) / 1000;
    format!("in {}s (unix ms {})", remaining, expires_at_ms)
}

/// Keeps the tail of a long path.
fn truncate_path(path: &str, max_chars: usize) -> String {
    let count = path.chars().count();
    if count <= max_chars {
        return path.to_string();
    }
    let tail: String = path.chars().skip(count - max_chars + 3).collect();
    format!("...{}", tail)
}
