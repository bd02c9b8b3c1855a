//! Terminal multiplexer backend.
//!
//! tmux owns the processes; the daemon only drives it through its CLI. The
//! [`MultiplexerBackend`] trait is the seam the session manager talks to, so
//! tests can run the manager against a scripted backend.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use thiserror::Error;
use tokio::process::Command;

/// Prefix of every tmux session the daemon owns.
pub const SESSION_PREFIX: &str = "tether-";

/// tmux user option holding the session's CLI kind.
pub const CLI_OPTION: &str = "@tether_cli";

const PANE_FORMAT: &str = "#{session_name}\t#{pane_current_path}\t#{pane_width}\t#{pane_height}\t#{session_created}\t#{pane_dead}\t#{pane_dead_status}\t#{pane_pid}\t#{@tether_cli}";

/// Errors from the multiplexer.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("multiplexer unavailable: {0}")]
    Unavailable(String),

    #[error("`tmux {command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// tmux session name.
    pub name: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Program and arguments run inside the pane.
    pub argv: Vec<String>,
    /// Log file receiving the pane's output.
    pub log_path: PathBuf,
    pub cli: String,
}

/// One pane as reported by `list-panes -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub session_name: String,
    pub cwd: String,
    pub width: u16,
    pub height: u16,
    /// Session creation time in Unix seconds.
    pub created_secs: u64,
    pub dead: bool,
    pub dead_status: Option<i32>,
    pub pid: Option<u32>,
    pub cli: Option<String>,
}

impl PaneInfo {
    /// Session id if this pane belongs to a daemon-owned session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_name.strip_prefix(SESSION_PREFIX)
    }
}

/// tmux session name for a session id.
pub fn session_name(id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

#[async_trait]
pub trait MultiplexerBackend: Send + Sync {
    /// Checks the multiplexer is installed and returns its version string.
    async fn probe(&self) -> Result<String, BackendError>;

    /// Creates a detached session with output piped to its log.
    async fn create_session(&self, spec: &CreateSpec) -> Result<(), BackendError>;

    /// Lists every pane on the server. No server means no panes.
    async fn list_panes(&self) -> Result<Vec<PaneInfo>, BackendError>;

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), BackendError>;

    /// Kills a session. Killing a missing session succeeds.
    async fn kill_session(&self, name: &str) -> Result<(), BackendError>;

    /// Command run in a PTY to attach a client to the session.
    fn attach_command(&self, name: &str) -> CommandBuilder;
}

/// Backend driving the `tmux` CLI.
pub struct TmuxBackend {
    bin: String,
}

impl TmuxBackend {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, BackendError> {
        let output = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BackendError::Unavailable(format!("{} not found", self.bin))
                }
                _ => BackendError::Io(e),
            })?;
        Ok(output)
    }

    /// Runs a tmux command and returns stdout.
    async fn run_checked(&self, args: &[&str]) -> Result<String, BackendError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MultiplexerBackend for TmuxBackend {
    async fn probe(&self) -> Result<String, BackendError> {
        let version = self
            .run_checked(&["-V"])
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(version.trim().to_string())
    }

    async fn create_session(&self, spec: &CreateSpec) -> Result<(), BackendError> {
        let cols = spec.cols.to_string();
        let rows = spec.rows.to_string();
        let cwd = spec.cwd.to_string_lossy().into_owned();
        let session_target = exact_session(&spec.name);
        let pane_target = exact_pane(&spec.name);
        let pipe = format!("cat >> {}", shell_quote(&spec.log_path.to_string_lossy()));

        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            spec.name.as_str(),
            "-x",
            cols.as_str(),
            "-y",
            rows.as_str(),
            "-c",
            cwd.as_str(),
        ];
        args.extend(spec.argv.iter().map(String::as_str));
        // Chained in one invocation so the options land before anything else
        // can observe the session.
        args.extend([
            ";",
            "set-option",
            "-w",
            "-t",
            pane_target.as_str(),
            "remain-on-exit",
            "on",
            ";",
            "set-option",
            "-t",
            session_target.as_str(),
            CLI_OPTION,
            spec.cli.as_str(),
            ";",
            "pipe-pane",
            "-o",
            "-t",
            pane_target.as_str(),
            pipe.as_str(),
        ]);

        self.run_checked(&args).await?;
        tracing::debug!(session = %spec.name, cwd = %cwd, "Created tmux session");
        Ok(())
    }

    async fn list_panes(&self) -> Result<Vec<PaneInfo>, BackendError> {
        let output = self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                return Ok(Vec::new());
            }
            return Err(BackendError::CommandFailed {
                command: "list-panes".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(parse_panes(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), BackendError> {
        let target = exact_pane(name);
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.run_checked(&[
            "resize-window",
            "-t",
            target.as_str(),
            "-x",
            cols.as_str(),
            "-y",
            rows.as_str(),
        ])
        .await?;
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), BackendError> {
        let target = exact_session(name);
        let output = self.run(&["kill-session", "-t", target.as_str()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_session(&stderr) || is_no_server(&stderr) {
                return Ok(());
            }
            return Err(BackendError::CommandFailed {
                command: "kill-session".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn attach_command(&self, name: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.bin);
        cmd.args(["attach-session".to_string(), "-t".to_string(), exact_session(name)]);
        cmd.env("TERM", "xterm-256color");
        cmd
    }
}

fn exact_session(name: &str) -> String {
    format!("={}", name)
}

fn exact_pane(name: &str) -> String {
    format!("={}:", name)
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("session not found")
}

/// Single-quotes a string for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parses `list-panes -F` output in [`PANE_FORMAT`]. Malformed lines are skipped.
pub fn parse_panes(output: &str) -> Vec<PaneInfo> {
    output.lines().filter_map(parse_pane_line).collect()
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return None;
    }

    let dead = fields[5] == "1";
    let cli = fields
        .get(8)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(PaneInfo {
        session_name: fields[0].to_string(),
        cwd: fields[1].to_string(),
        width: fields[2].parse().ok()?,
        height: fields[3].parse().ok()?,
        created_secs: fields[4].parse().unwrap_or(0),
        dead,
        dead_status: if dead { fields[6].parse().ok() } else { None },
        pid: fields[7].parse().ok(),
        cli,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name() {
        assert_eq!(session_name("abc"), "tether-abc");
    }

    #[test]
    fn test_parse_live_and_dead_panes() {
        let output = "tether-a\t/home/me\t120\t36\t1700000000\t0\t\t4242\tshell\n\
                      tether-b\t/tmp\t80\t24\t1700000100\t1\t3\t4300\t\n\
                      other\t/\t80\t24\t1700000200\t0\t\t1\t\n";
        let panes = parse_panes(output);
        assert_eq!(panes.len(), 3);

        assert_eq!(panes[0].session_id(), Some("a"));
        assert_eq!(panes[0].cwd, "/home/me");
        assert_eq!((panes[0].width, panes[0].height), (120, 36));
        assert_eq!(panes[0].created_secs, 1_700_000_000);
        assert!(!panes[0].dead);
        assert_eq!(panes[0].dead_status, None);
        assert_eq!(panes[0].pid, Some(4242));
        assert_eq!(panes[0].cli.as_deref(), Some("shell"));

        assert!(panes[1].dead);
        assert_eq!(panes[1].dead_status, Some(3));
        assert_eq!(panes[1].cli, None);

        assert_eq!(panes[2].session_id(), None);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let output = "garbage\n\
                      tether-a\t/\tnot-a-number\t24\t0\t0\t\t1\t\n\
                      tether-c\t/\t80\t24\t0\t0\t\t1\n";
        let panes = parse_panes(output);
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0].session_name, "tether-c");
        assert_eq!(panes[0].cli, None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b.log"), "'/tmp/a b.log'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_stderr_classification() {
        assert!(is_no_server("no server running on /tmp/tmux-1000/default"));
        assert!(is_missing_session("can't find session: =tether-x"));
        assert!(!is_missing_session("unknown command"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = TmuxBackend::new("/nonexistent/tmux-binary");
        assert!(matches!(
            backend.probe().await,
            Err(BackendError::Unavailable(_))
        ));
    }
}
