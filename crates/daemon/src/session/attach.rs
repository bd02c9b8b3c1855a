//! Per-client attachment to a session.
//!
//! Every attach runs its own `tmux attach-session` client in a PTY. The PTY
//! carries input, resize and XOFF/XON; what it renders is drained and thrown
//! away. Output reaches the client through a tail of the session log, so each
//! chunk carries exact log offsets.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::manager::SessionSlot;
use super::tail::spawn_log_tail;
use super::{AttachmentChunk, SessionError, SessionId};

/// Pauses terminal output (XOFF).
pub const XOFF: u8 = 0x13;

/// Resumes terminal output (XON).
pub const XON: u8 = 0x11;

/// Chunks buffered between the log tail and the consumer.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Buffer size for draining the PTY.
const DRAIN_BUFFER_SIZE: usize = 4096;

/// Parameters for opening an attachment.
pub(crate) struct AttachSpec {
    pub id: u64,
    pub session_id: SessionId,
    pub command: CommandBuilder,
    pub cols: u16,
    pub rows: u16,
    pub log_path: PathBuf,
    pub start_offset: u64,
    pub read_chunk: usize,
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// A live attachment. Dropping it detaches the client.
pub struct Attachment {
    id: u64,
    session_id: SessionId,
    start_offset: u64,
    chunks: Option<mpsc::Receiver<AttachmentChunk>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: SharedChild,
    pid: Option<u32>,
    paused: AtomicBool,
    paused_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    slot: Weak<SessionSlot>,
}

impl Attachment {
    /// Starts the attach client and the log tail.
    pub(crate) fn open(spec: AttachSpec, slot: Weak<SessionSlot>) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(spec.command)
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        let pid = child.process_id();
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let cancel = CancellationToken::new();
        spawn_drain(spec.session_id.clone(), reader, Arc::clone(&child));

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (paused_tx, paused_rx) = watch::channel(false);
        spawn_log_tail(
            spec.log_path,
            spec.start_offset,
            spec.read_chunk,
            tx,
            paused_rx,
            cancel.clone(),
        );

        tracing::debug!(
            session_id = %spec.session_id,
            attach_id = spec.id,
            pid = ?pid,
            offset = spec.start_offset,
            "Attached to session"
        );

        Ok(Self {
            id: spec.id,
            session_id: spec.session_id,
            start_offset: spec.start_offset,
            chunks: Some(rx),
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            child,
            pid,
            paused: AtomicBool::new(false),
            paused_tx,
            cancel,
            slot,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Log length at attach time; live chunks start here.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Process id of the attach client.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Takes the live chunk stream. Returns `None` after the first call.
    pub fn take_chunks(&mut self) -> Option<mpsc::Receiver<AttachmentChunk>> {
        self.chunks.take()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Writes client input into the session.
    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), SessionError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| SessionError::Pty("writer lock poisoned".to_string()))?;
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| SessionError::Pty(e.to_string()))?
    }

    /// Resizes the attach client's PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SessionError::Pty("master lock poisoned".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))
    }

    /// Sends XOFF and stops the log tail. No-op when already paused.
    pub async fn pause(&self) -> Result<(), SessionError> {
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.paused_tx.send_replace(true);
        tracing::trace!(session_id = %self.session_id, attach_id = self.id, "Output paused");
        self.write_input(vec![XOFF]).await
    }

    /// Sends XON and restarts the log tail. No-op when not paused.
    pub async fn resume(&self) -> Result<(), SessionError> {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.paused_tx.send_replace(false);
        tracing::trace!(session_id = %self.session_id, attach_id = self.id, "Output resumed");
        self.write_input(vec![XON]).await
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut child) = self.child.lock() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
        }
        if let Some(slot) = self.slot.upgrade() {
            slot.detach(self.id);
        }
        tracing::debug!(session_id = %self.session_id, attach_id = self.id, "Detached from session");
    }
}

/// Reads and discards PTY output until EOF, then reaps the child.
fn spawn_drain(session_id: SessionId, mut reader: Box<dyn Read + Send>, child: SharedChild) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; DRAIN_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::trace!(session_id = %session_id, error = %e, "PTY drain ended");
                    break;
                }
            }
        }

        if let Ok(mut child) = child.lock() {
            match child.wait() {
                Ok(status) => tracing::debug!(
                    session_id = %session_id,
                    exit_code = status.exit_code(),
                    "Attach client exited"
                ),
                Err(e) => tracing::debug!(session_id = %session_id, error = %e, "Failed to reap attach client"),
            }
        }
    });
}
