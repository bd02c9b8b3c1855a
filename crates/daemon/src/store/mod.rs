//! Durable records.
//!
//! The daemon keeps a small amount of accounting outside tmux: which sessions
//! it spawned (so they can be recovered after a restart), one task row per
//! spawn, and which tickets were issued or revoked. The [`Store`] trait is the
//! whole contract; [`JsonStore`] is the default implementation.

mod json;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_protocol::SessionState;
use thiserror::Error;

pub use json::JsonStore;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An update named a record that does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,

    /// The blocking task running the operation panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of a spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Killed,
    Done,
    Error,
}

/// One row per spawn request, keyed by the session id it created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub cli: String,
    pub cwd: String,
    pub actor: String,
    pub status: TaskStatus,
    pub created_at: u64,
    #[serde(default)]
    pub ended_at: Option<u64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Cached view of a tmux-backed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub cli: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub started_at: u64,
    pub status: SessionState,
    pub updated_at: u64,
}

/// Partial update applied to a [`SessionRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub status: Option<SessionState>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Accounting row written when a ticket is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTokenRecord {
    pub jti: String,
    pub scope: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub actor: String,
}

/// A permanently revoked ticket id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedToken {
    pub jti: String,
    pub revoked_at: u64,
    pub reason: String,
}

/// Durable record store used by the channels and the ticket service.
pub trait Store: Send + Sync {
    fn add_task(&self, task: TaskRecord) -> Result<(), StoreError>;

    /// Marks a task finished.
    fn update_task(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: Option<i32>,
        ended_at: u64,
    ) -> Result<(), StoreError>;

    fn upsert_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    fn update_session(&self, id: &str, update: SessionUpdate) -> Result<(), StoreError>;

    fn record_issued_token(&self, record: IssuedTokenRecord) -> Result<(), StoreError>;

    fn is_token_revoked(&self, jti: &str) -> Result<bool, StoreError>;

    /// Revokes a ticket id. Revoking twice keeps the first record.
    fn revoke_token(&self, revoked: RevokedToken) -> Result<(), StoreError>;

    /// All session records, used for startup recovery.
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

/// Runs a store operation on tokio's blocking pool.
///
/// Store implementations do file I/O; async callers go through this.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}
