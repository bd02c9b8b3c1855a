//! Session management module.
//!
//! Sessions live in tmux so they survive daemon restarts. This module wraps
//! tmux behind [`MultiplexerBackend`], keeps an in-memory cache of sessions
//! reconciled against it, and hands out [`Attachment`]s that stream a
//! session's append-only output log.

pub mod attach;
pub mod backend;
pub mod clipboard;
pub mod manager;
pub mod reconcile;
pub mod tail;

use tether_protocol::{SessionState, SessionSummary};
use thiserror::Error;

use crate::store::SessionRecord;

pub use attach::Attachment;
pub use backend::{BackendError, CreateSpec, MultiplexerBackend, PaneInfo, TmuxBackend};
pub use manager::{ManagerConfig, RecoveryReport, SessionManager};

/// Smallest accepted terminal dimension.
pub const MIN_DIMENSION: u16 = 10;

/// Largest accepted terminal dimension.
pub const MAX_DIMENSION: u16 = 500;

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Exit code reported for sessions ended by a kill request.
pub const KILLED_EXIT_CODE: i32 = 143;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The id is not 1-64 characters of `[A-Za-z0-9_-]`.
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    /// A live session already uses this id.
    #[error("session already exists: {0}")]
    DuplicateId(SessionId),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// No command is configured for this CLI kind.
    #[error("unknown cli: {0}")]
    UnknownCli(String),

    /// tmux is not installed or not working.
    #[error("terminal multiplexer unavailable")]
    BackendUnavailable,

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Failed to start or drive the attach PTY.
    #[error("PTY error: {0}")]
    Pty(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cached view of one tmux-backed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub cli: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Start time in Unix milliseconds.
    pub started_at: u64,
    pub status: SessionState,
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cli: self.cli.clone(),
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
            started_at: self.started_at,
            status: self.status,
        }
    }

    /// Store row for this session, stamped `updated_at`.
    pub fn record(&self, updated_at: u64) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            cli: self.cli.clone(),
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
            started_at: self.started_at,
            status: self.status,
            updated_at,
        }
    }
}

/// A half-open byte range `[start_offset, end_offset)` of a session log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentChunk {
    pub data: Vec<u8>,
    pub start_offset: u64,
    pub end_offset: u64,
    pub byte_length: usize,
}

impl AttachmentChunk {
    pub fn new(start_offset: u64, data: Vec<u8>) -> Self {
        let byte_length = data.len();
        Self {
            start_offset,
            end_offset: start_offset + byte_length as u64,
            byte_length,
            data,
        }
    }

    /// Drops every byte before `offset`. Returns `None` when nothing is left.
    pub fn trim_before(self, offset: u64) -> Option<Self> {
        if offset <= self.start_offset {
            return Some(self);
        }
        if offset >= self.end_offset {
            return None;
        }
        let skip = (offset - self.start_offset) as usize;
        Some(Self::new(offset, self.data[skip..].to_vec()))
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session disappeared. Fired exactly once per session.
    Exited { session_id: SessionId, exit_code: i32 },
    /// Reconciliation found a session started elsewhere.
    Discovered { session_id: SessionId },
    /// A program in the session set the clipboard.
    Clipboard { session_id: SessionId, text: String },
}

/// Whether `id` is acceptable as a session id.
pub fn validate_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Clamps a terminal dimension into the accepted range.
pub fn clamp_dimension(value: u16) -> u16 {
    value.clamp(MIN_DIMENSION, MAX_DIMENSION)
}
