//! JSON file store.
//!
//! The whole store is one JSON document rewritten atomically (temp file then
//! rename) on every mutation. Mutations hold an exclusive `flock` on a sibling
//! `.lock` file and re-read the document under it, so a daemon and
//! `tetherd token revoke` never overwrite each other's rows. Reads compare the
//! file's modification stamp with the one last seen and reload on change.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{
    IssuedTokenRecord, RevokedToken, SessionRecord, SessionUpdate, Store, StoreError, TaskRecord,
    TaskStatus,
};
use crate::clock::now_millis;

const STORE_VERSION: u32 = 1;

/// Serialized form of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreData {
    version: u32,
    #[serde(default)]
    tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
    #[serde(default)]
    issued_tokens: BTreeMap<String, IssuedTokenRecord>,
    #[serde(default)]
    revoked_tokens: BTreeMap<String, RevokedToken>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            tasks: BTreeMap::new(),
            sessions: BTreeMap::new(),
            issued_tokens: BTreeMap::new(),
            revoked_tokens: BTreeMap::new(),
        }
    }
}

/// Identifies one version of the backing file.
type FileStamp = Option<(SystemTime, u64)>;

struct Inner {
    data: StoreData,
    stamp: FileStamp,
}

/// [`Store`] backed by a single JSON file.
pub struct JsonStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonStore {
    /// Opens the store at `path`, creating parent directories. A missing file
    /// is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (data, stamp) = read_file(&path)?;
        tracing::debug!(
            "Opened store at {:?} ({} sessions, {} revoked tokens)",
            path,
            data.sessions.len(),
            data.revoked_tokens.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner { data, stamp }),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up one task row.
    pub fn task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.read(|data| data.tasks.get(id).cloned())
    }

    /// Runs `f` against fresh data without writing.
    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        self.refresh(&mut inner)?;
        Ok(f(&inner.data))
    }

    /// Applies `f` to the on-disk data under the file lock and persists it.
    ///
    /// The in-memory copy only changes once the new file is in place.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let _lock = self.acquire_lock()?;

        let (mut data, _) = read_file(&self.path)?;
        let result = f(&mut data)?;
        let stamp = self.save(&data)?;

        inner.data = data;
        inner.stamp = stamp;
        Ok(result)
    }

    fn refresh(&self, inner: &mut Inner) -> Result<(), StoreError> {
        let current = file_stamp(&self.path);
        if current != inner.stamp {
            let (data, stamp) = read_file(&self.path)?;
            tracing::debug!("Store file {:?} changed on disk, reloaded", self.path);
            inner.data = data;
            inner.stamp = stamp;
        }
        Ok(())
    }

    /// Blocks until this handle holds the exclusive lock. Released on drop.
    fn acquire_lock(&self) -> Result<File, StoreError> {
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("json.lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn save(&self, data: &StoreData) -> Result<FileStamp, StoreError> {
        let contents = serde_json::to_string_pretty(data)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;

        Ok(file_stamp(&self.path))
    }
}

fn file_stamp(path: &Path) -> FileStamp {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn read_file(path: &Path) -> Result<(StoreData, FileStamp), StoreError> {
    let stamp = file_stamp(path);
    if stamp.is_none() {
        return Ok((StoreData::default(), None));
    }
    let contents = fs::read_to_string(path)?;
    let data = serde_json::from_str(&contents)?;
    Ok((data, stamp))
}

impl Store for JsonStore {
    fn add_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        self.write(|data| {
            data.tasks.insert(task.id.clone(), task);
            Ok(())
        })
    }

    fn update_task(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: Option<i32>,
        ended_at: u64,
    ) -> Result<(), StoreError> {
        self.write(|data| {
            let task = data
                .tasks
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            task.status = status;
            task.exit_code = exit_code;
            task.ended_at = Some(ended_at);
            Ok(())
        })
    }

    fn upsert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.write(|data| {
            data.sessions.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn update_session(&self, id: &str, update: SessionUpdate) -> Result<(), StoreError> {
        self.write(|data| {
            let record = data
                .sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if let Some(status) = update.status {
                record.status = status;
            }
            if let Some(cols) = update.cols {
                record.cols = cols;
            }
            if let Some(rows) = update.rows {
                record.rows = rows;
            }
            record.updated_at = now_millis();
            Ok(())
        })
    }

    fn record_issued_token(&self, record: IssuedTokenRecord) -> Result<(), StoreError> {
        self.write(|data| {
            data.issued_tokens.insert(record.jti.clone(), record);
            Ok(())
        })
    }

    fn is_token_revoked(&self, jti: &str) -> Result<bool, StoreError> {
        self.read(|data| data.revoked_tokens.contains_key(jti))
    }

    fn revoke_token(&self, revoked: RevokedToken) -> Result<(), StoreError> {
        self.write(|data| {
            data.revoked_tokens
                .entry(revoked.jti.clone())
                .or_insert(revoked);
            Ok(())
        })
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.read(|data| data.sessions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tether_protocol::SessionState;

    fn create_test_store(temp_dir: &TempDir) -> JsonStore {
        JsonStore::open(temp_dir.path().join("store.json")).unwrap()
    }

    fn session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            cli: "shell".to_string(),
            cwd: "/tmp".to_string(),
            cols: 80,
            rows: 24,
            started_at: 1,
            status: SessionState::Running,
            updated_at: 1,
        }
    }

    fn revoked(jti: &str, reason: &str) -> RevokedToken {
        RevokedToken {
            jti: jti.to_string(),
            revoked_at: 5,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(!store.is_token_revoked("abc").unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_session_upsert_and_update() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);

        store.upsert_session(session("s1")).unwrap();
        store
            .update_session(
                "s1",
                SessionUpdate {
                    status: Some(SessionState::Killed),
                    cols: Some(100),
                    ..Default::default()
                },
            )
            .unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionState::Killed);
        assert_eq!(sessions[0].cols, 100);
        assert_eq!(sessions[0].rows, 24);
    }

    #[test]
    fn test_update_missing_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        let result = store.update_session("nope", SessionUpdate::default());
        assert!(matches!(result, Err(StoreError::NotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_task_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);

        store
            .add_task(TaskRecord {
                id: "s1".to_string(),
                cli: "shell".to_string(),
                cwd: "/".to_string(),
                actor: "web".to_string(),
                status: TaskStatus::Running,
                created_at: 1,
                ended_at: None,
                exit_code: None,
            })
            .unwrap();
        store
            .update_task("s1", TaskStatus::Killed, Some(143), 9)
            .unwrap();

        let reopened = create_test_store(&temp_dir);
        let task = reopened.read(|data| data.tasks["s1"].clone()).unwrap();
        assert_eq!(task.status, TaskStatus::Killed);
        assert_eq!(task.exit_code, Some(143));
        assert_eq!(task.ended_at, Some(9));
    }

    #[test]
    fn test_revocation_is_permanent_and_first_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);

        store.revoke_token(revoked("jti-1", "lost phone")).unwrap();
        store.revoke_token(revoked("jti-1", "again")).unwrap();

        assert!(store.is_token_revoked("jti-1").unwrap());
        let reason = store
            .read(|data| data.revoked_tokens["jti-1"].reason.clone())
            .unwrap();
        assert_eq!(reason, "lost phone");
    }

    #[test]
    fn test_persistence_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = create_test_store(&temp_dir);
            store.upsert_session(session("s1")).unwrap();
            store
                .record_issued_token(IssuedTokenRecord {
                    jti: "j".to_string(),
                    scope: "all".to_string(),
                    issued_at: 1,
                    expires_at: 2,
                    actor: "cli".to_string(),
                })
                .unwrap();
        }

        let store = create_test_store(&temp_dir);
        assert_eq!(store.list_sessions().unwrap(), vec![session("s1")]);
        assert!(store
            .read(|data| data.issued_tokens.contains_key("j"))
            .unwrap());
    }

    #[test]
    fn test_sees_revocation_from_another_handle() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = create_test_store(&temp_dir);
        daemon.upsert_session(session("s1")).unwrap();
        assert!(!daemon.is_token_revoked("jti-2").unwrap());

        // A second process writing the same file.
        let cli = create_test_store(&temp_dir);
        cli.revoke_token(revoked("jti-2", "cli")).unwrap();

        assert!(daemon.is_token_revoked("jti-2").unwrap());
        assert_eq!(daemon.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_interleaved_handles_keep_each_others_rows() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = create_test_store(&temp_dir);
        daemon.upsert_session(session("s1")).unwrap();

        let cli = create_test_store(&temp_dir);
        cli.revoke_token(revoked("jti-3", "cli")).unwrap();

        // The daemon writes from its stale view without reading first.
        daemon.upsert_session(session("s2")).unwrap();

        let fresh = create_test_store(&temp_dir);
        assert!(fresh.is_token_revoked("jti-3").unwrap());
        assert_eq!(fresh.list_sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");

        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = JsonStore::open(&path).unwrap();
                    for n in 0..25 {
                        store
                            .revoke_token(revoked(&format!("jti-{}-{}", writer, n), "bulk"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = JsonStore::open(&path).unwrap();
        let count = store.read(|data| data.revoked_tokens.len()).unwrap();
        assert_eq!(count, 100);
    }

    #[test]
    fn test_failed_save_leaves_memory_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_test_store(&temp_dir);
        store.upsert_session(session("s1")).unwrap();

        // A directory where the temp file goes makes the write fail.
        fs::create_dir(temp_dir.path().join("store.json.tmp")).unwrap();
        assert!(matches!(
            store.upsert_session(session("s2")),
            Err(StoreError::Io(_))
        ));

        assert_eq!(store.list_sessions().unwrap(), vec![session("s1")]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
