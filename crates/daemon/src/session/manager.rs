//! Session manager.
//!
//! tmux is the source of truth. The manager keeps a cache of daemon-owned
//! sessions keyed by id, serializes per-session operations, and converges
//! the cache to tmux on a fixed interval.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tether_protocol::SessionState;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::attach::{AttachSpec, Attachment};
use super::backend::{session_name, CreateSpec, MultiplexerBackend, PaneInfo};
use super::clipboard::ClipboardScanner;
use super::reconcile::{diff, ReconcilePlan};
use super::tail::spawn_log_tail;
use super::{
    clamp_dimension, validate_session_id, Session, SessionError, SessionEvent, SessionId,
    KILLED_EXIT_CODE,
};
use crate::clock::now_millis;
use crate::config::Config;
use crate::store::SessionRecord;

/// Capacity of the session event feed.
const EVENT_CAPACITY: usize = 256;

/// Interval between liveness checks while waiting for attach clients to exit.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings the manager needs from the daemon config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub logs_dir: PathBuf,
    pub default_shell: String,
    pub default_cwd: Option<PathBuf>,
    pub default_cols: u16,
    pub default_rows: u16,
    /// CLI kind to command. An empty command runs a plain login shell.
    pub clis: BTreeMap<String, String>,
    pub reconcile_interval: Duration,
    pub kill_grace: Duration,
    pub read_chunk_bytes: usize,
}

impl ManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            logs_dir: config.daemon.logs_dir(),
            default_shell: config.session.default_shell.clone(),
            default_cwd: config.session.default_cwd.clone(),
            default_cols: config.session.default_cols,
            default_rows: config.session.default_rows,
            clis: config.session.clis.clone(),
            reconcile_interval: Duration::from_millis(config.session.reconcile_interval_ms),
            kill_grace: Duration::from_millis(config.session.kill_grace_ms),
            read_chunk_bytes: config.stream.read_chunk_bytes,
        }
    }
}

/// Outcome of [`SessionManager::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Known records whose tmux session is still alive.
    pub recovered: Vec<SessionId>,
    /// Live daemon-owned sessions with no record.
    pub discovered: Vec<SessionId>,
    /// Known records with no live tmux session.
    pub missing: Vec<SessionId>,
}

/// Cache entry for one session.
pub(crate) struct SessionSlot {
    info: Mutex<Session>,
    op_lock: tokio::sync::Mutex<()>,
    /// Attach id to attach client pid.
    attachments: Mutex<HashMap<u64, Option<u32>>>,
    monitor: CancellationToken,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            info: Mutex::new(session),
            op_lock: tokio::sync::Mutex::new(()),
            attachments: Mutex::new(HashMap::new()),
            monitor: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> Option<Session> {
        let mut session = self.info.lock().ok()?.clone();
        if session.status != SessionState::Killed {
            session.status = if self.attachment_count() > 0 {
                SessionState::Running
            } else {
                SessionState::Detached
            };
        }
        Some(session)
    }

    fn size(&self) -> Option<(u16, u16)> {
        self.info.lock().ok().map(|s| (s.cols, s.rows))
    }

    fn set_size(&self, cols: u16, rows: u16) {
        if let Ok(mut info) = self.info.lock() {
            info.cols = cols;
            info.rows = rows;
        }
    }

    fn attachment_count(&self) -> usize {
        self.attachments.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn attach_pids(&self) -> Vec<u32> {
        self.attachments
            .lock()
            .map(|a| a.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    fn register(&self, id: u64, pid: Option<u32>) {
        if let Ok(mut attachments) = self.attachments.lock() {
            attachments.insert(id, pid);
        }
    }

    pub(crate) fn detach(&self, id: u64) {
        if let Ok(mut attachments) = self.attachments.lock() {
            attachments.remove(&id);
        }
    }
}

struct Inner {
    backend: Arc<dyn MultiplexerBackend>,
    config: ManagerConfig,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    /// Ids reserved by in-flight spawns. Reconciliation leaves them alone.
    pending: Mutex<HashSet<SessionId>>,
    events: broadcast::Sender<SessionEvent>,
    available: AtomicBool,
    next_attach_id: AtomicU64,
}

/// Releases a spawn reservation when dropped.
struct Reservation<'a> {
    inner: &'a Inner,
    id: SessionId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Owns the daemon's tmux sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a manager. The backend counts as unavailable until [`init`](Self::init).
    pub fn new(backend: Arc<dyn MultiplexerBackend>, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                sessions: DashMap::new(),
                pending: Mutex::new(HashSet::new()),
                events,
                available: AtomicBool::new(false),
                next_attach_id: AtomicU64::new(1),
            }),
        }
    }

    /// Probes the backend once. Returns whether it is usable.
    pub async fn init(&self) -> bool {
        match self.inner.backend.probe().await {
            Ok(version) => {
                tracing::info!(version = %version, "Terminal multiplexer available");
                self.inner.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Terminal multiplexer unavailable; sessions are read-only");
                self.inner.available.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Generates a fresh session id.
    pub fn generate_id() -> SessionId {
        Uuid::new_v4().to_string()
    }

    /// Subscribes to exit, discovery and clipboard events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Path of a session's output log.
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.inner.config.logs_dir.join(format!("{}.log", id))
    }

    /// Current length of a session's log. A missing log has length zero.
    pub async fn log_length(&self, id: &str) -> u64 {
        tokio::fs::metadata(self.log_path(id))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.sessions.get(id).and_then(|slot| slot.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.sessions.contains_key(id)
    }

    /// All cached sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .filter_map(|entry| entry.value().snapshot())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Creates a tmux session running `cli` and starts its log.
    pub async fn spawn(
        &self,
        id: &str,
        cli: &str,
        cwd: Option<&str>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<Session, SessionError> {
        if !validate_session_id(id) {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        if !self.is_available() {
            return Err(SessionError::BackendUnavailable);
        }
        let command = self
            .inner
            .config
            .clis
            .get(cli)
            .ok_or_else(|| SessionError::UnknownCli(cli.to_string()))?
            .clone();

        let _reservation = self.reserve(id)?;

        let config = &self.inner.config;
        let cwd = self.resolve_cwd(cwd);
        let cols = clamp_dimension(cols.unwrap_or(config.default_cols));
        let rows = clamp_dimension(rows.unwrap_or(config.default_rows));
        let log_path = self.log_path(id);

        tokio::fs::create_dir_all(&config.logs_dir).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        let log_length = self.log_length(id).await;

        let spec = CreateSpec {
            name: session_name(id),
            cwd: cwd.clone(),
            cols,
            rows,
            argv: self.shell_argv(&command),
            log_path,
            cli: cli.to_string(),
        };
        self.inner.backend.create_session(&spec).await?;

        let session = Session {
            id: id.to_string(),
            cli: cli.to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
            cols,
            rows,
            started_at: now_millis(),
            status: SessionState::Detached,
        };
        self.insert_slot(session.clone(), log_length);

        tracing::info!(
            session_id = %id,
            cli = %cli,
            cwd = %session.cwd,
            cols = cols,
            rows = rows,
            "Spawned session"
        );
        Ok(session)
    }

    /// Attaches a new client to a session, sized `cols` x `rows`.
    pub async fn attach(&self, id: &str, cols: u16, rows: u16) -> Result<Attachment, SessionError> {
        if !self.is_available() {
            return Err(SessionError::BackendUnavailable);
        }
        let slot = self.slot(id)?;
        let _guard = slot.op_lock.lock().await;
        if !self.contains(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }

        let attach_id = self.inner.next_attach_id.fetch_add(1, Ordering::SeqCst);
        let spec = AttachSpec {
            id: attach_id,
            session_id: id.to_string(),
            command: self.inner.backend.attach_command(&session_name(id)),
            cols: clamp_dimension(cols),
            rows: clamp_dimension(rows),
            log_path: self.log_path(id),
            start_offset: self.log_length(id).await,
            read_chunk: self.inner.config.read_chunk_bytes,
        };
        let attachment = Attachment::open(spec, Arc::downgrade(&slot))?;
        slot.register(attach_id, attachment.pid());
        Ok(attachment)
    }

    /// Resizes the tmux window of a session.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(u16, u16), SessionError> {
        let slot = self.slot(id)?;
        let _guard = slot.op_lock.lock().await;
        let cols = clamp_dimension(cols);
        let rows = clamp_dimension(rows);
        if self.is_available() {
            self.inner
                .backend
                .resize(&session_name(id), cols, rows)
                .await?;
        }
        slot.set_size(cols, rows);
        tracing::debug!(session_id = %id, cols = cols, rows = rows, "Resized session");
        Ok((cols, rows))
    }

    /// Kills a session: attach clients get SIGTERM, then SIGKILL after the
    /// grace window, then the tmux session is killed.
    pub async fn kill(&self, id: &str) -> Result<(), SessionError> {
        let slot = self.slot(id)?;
        let _guard = slot.op_lock.lock().await;

        let pids = slot.attach_pids();
        if !pids.is_empty() {
            terminate_processes(&pids, self.inner.config.kill_grace).await;
        }

        self.inner.backend.kill_session(&session_name(id)).await?;
        if let Ok(mut info) = slot.info.lock() {
            info.status = SessionState::Killed;
        }
        self.finish(id, KILLED_EXIT_CODE);
        tracing::info!(session_id = %id, "Killed session");
        Ok(())
    }

    /// Rebuilds the cache from stored records and tmux.
    ///
    /// With the backend unavailable every non-killed record is trusted as-is.
    pub async fn recover(&self, known: &[SessionRecord]) -> Result<RecoveryReport, SessionError> {
        let mut report = RecoveryReport::default();
        let candidates = known
            .iter()
            .filter(|r| r.status != SessionState::Killed && validate_session_id(&r.id));

        if !self.is_available() {
            for record in candidates {
                if !self.contains(&record.id) {
                    self.inner
                        .sessions
                        .insert(record.id.clone(), Arc::new(SessionSlot::new(from_record(record))));
                }
                report.recovered.push(record.id.clone());
            }
            return Ok(report);
        }

        let panes = self.inner.backend.list_panes().await?;
        let mut live: HashMap<&str, &PaneInfo> = HashMap::new();
        for pane in &panes {
            if let Some(id) = pane.session_id().filter(|id| validate_session_id(id)) {
                live.entry(id).or_insert(pane);
            }
        }

        let mut seen = HashSet::new();
        for record in candidates {
            seen.insert(record.id.as_str());
            match live.get(record.id.as_str()) {
                Some(pane) if !pane.dead => {
                    if !self.contains(&record.id) {
                        let mut session = from_record(record);
                        session.cols = clamp_dimension(pane.width);
                        session.rows = clamp_dimension(pane.height);
                        let offset = self.log_length(&record.id).await;
                        self.insert_slot(session, offset);
                    }
                    report.recovered.push(record.id.clone());
                }
                _ => report.missing.push(record.id.clone()),
            }
        }

        for (id, pane) in &live {
            if pane.dead {
                self.reap(&pane.session_name).await;
                continue;
            }
            if seen.contains(id) || self.contains(id) {
                continue;
            }
            let offset = self.log_length(id).await;
            self.insert_slot(from_pane(id, pane), offset);
            report.discovered.push(id.to_string());
        }

        report.discovered.sort();
        tracing::info!(
            recovered = report.recovered.len(),
            discovered = report.discovered.len(),
            missing = report.missing.len(),
            "Recovered sessions"
        );
        Ok(report)
    }

    /// Converges the cache to tmux's live set once.
    pub async fn reconcile(&self) -> Result<ReconcilePlan, SessionError> {
        if !self.is_available() {
            return Ok(ReconcilePlan::default());
        }
        let panes = self.inner.backend.list_panes().await?;

        let pending = self.pending_ids();
        let local: HashMap<String, (u16, u16)> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| !pending.contains(entry.key()))
            .filter_map(|entry| entry.value().size().map(|size| (entry.key().clone(), size)))
            .collect();

        let plan = diff(&panes, &local);

        for pane in &plan.adopt {
            let Some(id) = pane.session_id() else {
                continue;
            };
            if pending.contains(id) || self.contains(id) {
                continue;
            }
            let offset = self.log_length(id).await;
            self.insert_slot(from_pane(id, pane), offset);
            tracing::info!(session_id = %id, "Discovered session");
            let _ = self.inner.events.send(SessionEvent::Discovered {
                session_id: id.to_string(),
            });
        }
        for (id, code) in &plan.drop {
            if self.finish(id, *code) {
                tracing::info!(session_id = %id, exit_code = code, "Session ended");
            }
        }
        for (id, cols, rows) in &plan.update {
            if let Some(slot) = self.inner.sessions.get(id) {
                slot.set_size(clamp_dimension(*cols), clamp_dimension(*rows));
            }
        }
        for name in &plan.reap {
            self.reap(name).await;
        }

        Ok(plan)
    }

    /// Runs [`reconcile`](Self::reconcile) on the configured interval until cancelled.
    pub fn spawn_reconcile_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.inner.config.reconcile_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.reconcile().await {
                            tracing::warn!(error = %e, "Reconciliation failed");
                        }
                    }
                }
            }
            tracing::debug!("Reconcile loop stopped");
        })
    }

    /// Stops every clipboard monitor. Sessions keep running in tmux.
    pub fn shutdown(&self) {
        for entry in self.inner.sessions.iter() {
            entry.value().monitor.cancel();
        }
    }

    pub async fn pause_output(&self, attachment: &Attachment) -> Result<(), SessionError> {
        attachment.pause().await
    }

    pub async fn resume_output(&self, attachment: &Attachment) -> Result<(), SessionError> {
        attachment.resume().await
    }

    fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.inner
            .sessions
            .get(id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn reserve(&self, id: &str) -> Result<Reservation<'_>, SessionError> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .map_err(|_| SessionError::Pty("reservation lock poisoned".to_string()))?;
        if self.contains(id) || !pending.insert(id.to_string()) {
            return Err(SessionError::DuplicateId(id.to_string()));
        }
        Ok(Reservation {
            inner: &self.inner,
            id: id.to_string(),
        })
    }

    fn pending_ids(&self) -> HashSet<SessionId> {
        self.inner
            .pending
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn insert_slot(&self, session: Session, log_offset: u64) {
        let id = session.id.clone();
        let slot = Arc::new(SessionSlot::new(session));
        self.spawn_clipboard_monitor(&id, log_offset, slot.monitor.clone());
        self.inner.sessions.insert(id, slot);
    }

    /// Removes a session and emits its exit. Only the first caller for an id
    /// gets `true`.
    fn finish(&self, id: &str, exit_code: i32) -> bool {
        let Some((_, slot)) = self.inner.sessions.remove(id) else {
            return false;
        };
        slot.monitor.cancel();
        let _ = self.inner.events.send(SessionEvent::Exited {
            session_id: id.to_string(),
            exit_code,
        });
        true
    }

    async fn reap(&self, name: &str) {
        if let Err(e) = self.inner.backend.kill_session(name).await {
            tracing::warn!(session = %name, error = %e, "Failed to reap dead session");
        }
    }

    fn resolve_cwd(&self, requested: Option<&str>) -> PathBuf {
        requested
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .or_else(|| self.inner.config.default_cwd.clone().filter(|p| p.is_dir()))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn shell_argv(&self, command: &str) -> Vec<String> {
        let shell = self.inner.config.default_shell.clone();
        if command.trim().is_empty() {
            vec![shell, "-l".to_string()]
        } else {
            vec![shell, "-lc".to_string(), command.to_string()]
        }
    }

    /// Tails the log from `offset` and emits clipboard events found in it.
    fn spawn_clipboard_monitor(&self, id: &str, offset: u64, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(16);
        let (_, paused_rx) = watch::channel(false);
        spawn_log_tail(
            self.log_path(id),
            offset,
            self.inner.config.read_chunk_bytes,
            tx,
            paused_rx,
            cancel.clone(),
        );

        let events = self.inner.events.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            let mut scanner = ClipboardScanner::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                for text in scanner.feed(&chunk.data) {
                    tracing::debug!(session_id = %session_id, bytes = text.len(), "Clipboard set");
                    let _ = events.send(SessionEvent::Clipboard {
                        session_id: session_id.clone(),
                        text,
                    });
                }
            }
        });
    }
}

fn from_record(record: &SessionRecord) -> Session {
    Session {
        id: record.id.clone(),
        cli: record.cli.clone(),
        cwd: record.cwd.clone(),
        cols: clamp_dimension(record.cols),
        rows: clamp_dimension(record.rows),
        started_at: record.started_at,
        status: SessionState::Detached,
    }
}

fn from_pane(id: &str, pane: &PaneInfo) -> Session {
    Session {
        id: id.to_string(),
        cli: pane.cli.clone().unwrap_or_else(|| "shell".to_string()),
        cwd: pane.cwd.clone(),
        cols: clamp_dimension(pane.width),
        rows: clamp_dimension(pane.height),
        started_at: pane.created_secs.saturating_mul(1000),
        status: SessionState::Detached,
    }
}

/// SIGTERMs `pids`, waits up to `grace` for them to exit, then SIGKILLs the rest.
///
/// Pids that do not fit a `pid_t` are skipped.
async fn terminate_processes(pids: &[u32], grace: Duration) {
    use nix::sys::signal::{kill, Signal};

    let pids: Vec<u32> = pids
        .iter()
        .copied()
        .filter(|&pid| {
            let valid = to_pid(pid).is_some();
            if !valid {
                tracing::warn!(pid = pid, "Skipping out-of-range pid");
            }
            valid
        })
        .collect();

    for &pid in &pids {
        if let Some(raw) = to_pid(pid) {
            if let Err(e) = kill(raw, Signal::SIGTERM) {
                tracing::debug!(pid = pid, error = %e, "SIGTERM failed");
            }
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !pids.iter().any(|&pid| process_alive(pid)) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    for &pid in pids.iter().filter(|&&pid| process_alive(pid)) {
        tracing::warn!(pid = pid, "Attach client ignored SIGTERM; sending SIGKILL");
        if let Some(raw) = to_pid(pid) {
            if let Err(e) = kill(raw, Signal::SIGKILL) {
                tracing::debug!(pid = pid, error = %e, "SIGKILL failed");
            }
        }
    }
}

fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid).ok().map(nix::unistd::Pid::from_raw)
}

/// Whether `pid` exists and is not a zombie.
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;

    let Some(raw) = to_pid(pid) else {
        return false;
    };
    if kill(raw, None).is_err() {
        return false;
    }
    let stat = Path::new("/proc").join(pid.to_string()).join("stat");
    match std::fs::read_to_string(stat) {
        Ok(contents) => contents
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(true),
        Err(_) => true,
    }
}
