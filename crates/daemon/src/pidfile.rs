//! PID file for single-instance detection.
//!
//! `tetherd serve` holds a [`PidFile`] for its lifetime; `tetherd status`
//! reads it with [`read_running_pid`]. A file naming a dead process is
//! stale and removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("daemon already running (PID {0})")]
    AlreadyRunning(u32),

    #[error("PID file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Held by the running daemon; removes the file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current PID to `path`, refusing if another live process
    /// already owns it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        if let Some(pid) = read_running_pid(&path) {
            if pid != std::process::id() {
                return Err(PidFileError::AlreadyRunning(pid));
            }
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), "Wrote PID file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        if read_pid(&self.path) == Some(std::process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Returns the PID recorded at `path` if that process is alive.
///
/// Cleans up the file when it is unreadable or names a dead process.
pub fn read_running_pid(path: &Path) -> Option<u32> {
    if !path.exists() {
        return None;
    }
    match read_pid(path) {
        Some(pid) if is_process_running(pid) => Some(pid),
        _ => {
            tracing::debug!(path = %path.display(), "Removing stale PID file");
            let _ = fs::remove_file(path);
            None
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a process with the given PID is running and not a zombie.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // The state field follows the parenthesised command name.
        match stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next()) {
            Some(state) => state != "Z" && state != "X",
            None => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
            .unwrap_or(false)
    }
}
