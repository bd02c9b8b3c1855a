//! Channel message definitions for Tether.
//!
//! Every socket speaks JSON text messages tagged by a `type` field. Each
//! channel has one closed enum per direction; handlers parse into it once at
//! the boundary and then match exhaustively.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version, announced in the control `hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Websocket close codes used by the daemon.
pub mod close_code {
    /// Orderly close, e.g. the session exited.
    pub const NORMAL: u16 = 1000;
    /// The daemon is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Ticket missing, malformed, expired, revoked or out of scope.
    pub const AUTH_FAILED: u16 = 4001;
    /// Malformed frame, wrong message type or frame/session mismatch.
    pub const PROTOCOL_VIOLATION: u16 = 4002;
    /// No auth message arrived before the deadline.
    pub const AUTH_TIMEOUT: u16 = 4003;
    /// Terminal socket addressed a session that does not exist.
    pub const SESSION_NOT_FOUND: u16 = 4004;
    /// Peer stopped answering heartbeats.
    pub const HEARTBEAT_TIMEOUT: u16 = 4008;
    /// Remote desktop backend could not be reached or started.
    pub const DESKTOP_UNAVAILABLE: u16 = 4010;
    /// Peer address is locked out by the rate limiter.
    pub const RATE_LIMITED: u16 = 4029;
    /// Unexpected server-side failure.
    pub const INTERNAL: u16 = 1011;
}

/// Parses a JSON text message into `T`, mapping failures to protocol errors.
pub fn parse_text<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| {
        if e.is_data() {
            ProtocolError::UnexpectedMessage(e.to_string())
        } else {
            ProtocolError::Deserialization(e.to_string())
        }
    })
}

/// Serializes a message to JSON text.
pub fn to_text<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

// ============================================================================
// Authentication handshake
// ============================================================================

/// First message a client must send on any channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRequest {
    /// Present a signed ticket.
    Auth {
        /// The signed ticket.
        token: String,
        /// Optional free-form client label, used for audit tagging.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<String>,
    },
}

/// Acknowledgement sent after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthReply {
    /// Ticket accepted.
    AuthOk {
        /// Ticket expiry in Unix milliseconds.
        #[serde(rename = "expiresAt")]
        expires_at: u64,
    },
}

// ============================================================================
// Control channel
// ============================================================================

/// Session lifecycle state as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Process is alive and at least one viewer may be attached.
    Running,
    /// Process is alive with no tracked viewers.
    Detached,
    /// Session is gone.
    Killed,
}

/// Wire view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Which CLI the session runs.
    pub cli: String,
    /// Working directory.
    pub cwd: String,
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
    /// Start time in Unix milliseconds.
    #[serde(rename = "startedAt")]
    pub started_at: u64,
    /// Lifecycle state.
    pub status: SessionState,
}

/// How a session ended, from the control channel's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitOutcome {
    /// A client asked for the kill.
    Killed,
    /// The process exited cleanly on its own.
    Done,
    /// The process exited with a failure code.
    Error,
}

impl ExitOutcome {
    /// Classifies an exit given whether a kill was requested.
    pub fn classify(kill_requested: bool, exit_code: i32) -> Self {
        if kill_requested {
            Self::Killed
        } else if exit_code == 0 {
            Self::Done
        } else {
            Self::Error
        }
    }
}

/// Messages a client sends on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Client capability announcement.
    Hello {
        /// Feature names the client understands.
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Start a new session.
    Spawn {
        /// CLI kind to launch.
        cli: String,
        /// Requested working directory.
        #[serde(default)]
        cwd: Option<String>,
        /// Requested columns.
        #[serde(default)]
        cols: Option<u16>,
        /// Requested rows.
        #[serde(default)]
        rows: Option<u16>,
    },
    /// Change a session's geometry.
    Resize {
        /// Target session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// New columns.
        #[serde(default)]
        cols: Option<u16>,
        /// New rows.
        #[serde(default)]
        rows: Option<u16>,
    },
    /// Terminate a session.
    Kill {
        /// Target session.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Messages the daemon sends on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Server capability handshake.
    Hello {
        /// Protocol version.
        version: u8,
        /// Features the server supports.
        capabilities: Vec<String>,
    },
    /// A session was created.
    Spawned {
        /// New session id.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// CLI kind.
        cli: String,
        /// Effective working directory.
        cwd: String,
        /// Effective columns.
        cols: u16,
        /// Effective rows.
        rows: u16,
    },
    /// A session ended.
    Exited {
        /// Session id.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Process exit code (0 when unknown).
        #[serde(rename = "exitCode")]
        exit_code: i32,
        /// Classified outcome.
        outcome: ExitOutcome,
    },
    /// Full session list.
    Sessions {
        /// All live sessions.
        list: Vec<SessionSummary>,
    },
    /// A program in a session set the clipboard.
    Clipboard {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Decoded clipboard text.
        text: String,
    },
    /// A request failed.
    Error {
        /// Human readable reason.
        message: String,
    },
}

// ============================================================================
// Terminal channel
// ============================================================================

/// Text messages a client sends on a terminal socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalRequest {
    /// Keyboard input.
    Input {
        /// Input text.
        data: String,
    },
    /// Viewport geometry change.
    Resize {
        /// New columns.
        cols: u16,
        /// New rows.
        rows: u16,
    },
}

/// Text messages the daemon sends on a terminal socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    /// Attachment established; replay follows.
    Attached {
        /// Session id.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// First byte offset that will be delivered.
        #[serde(rename = "replayFrom")]
        replay_from: u64,
        /// Log length when the replay window was computed.
        #[serde(rename = "logLength")]
        log_length: u64,
        /// Negotiated codec.
        codec: String,
    },
    /// Output text (only when no binary codec is negotiated).
    Output {
        /// Decoded text.
        data: String,
        /// Log offset just past the last byte covered by this message.
        offset: u64,
    },
    /// The session ended.
    Exit {
        /// Process exit code.
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_auth_request() {
        let msg: AuthRequest =
            parse_text(r#"{"type":"auth","token":"v1.a.b","client":"web"}"#).unwrap();
        assert_eq!(
            msg,
            AuthRequest::Auth {
                token: "v1.a.b".to_string(),
                client: Some("web".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_auth_request_wrong_type() {
        let err = parse_text::<AuthRequest>(r#"{"type":"hello"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));
    }

    #[test]
    fn test_parse_auth_request_not_json() {
        let err = parse_text::<AuthRequest>("auth please").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_auth_reply_shape() {
        let text = to_text(&AuthReply::AuthOk { expires_at: 42 }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "auth_ok", "expiresAt": 42}));
    }

    #[test]
    fn test_parse_spawn_with_defaults() {
        let msg: ControlRequest = parse_text(r#"{"type":"spawn","cli":"shell"}"#).unwrap();
        assert_eq!(
            msg,
            ControlRequest::Spawn {
                cli: "shell".to_string(),
                cwd: None,
                cols: None,
                rows: None,
            }
        );
    }

    #[test]
    fn test_parse_kill_uses_camel_case_id() {
        let msg: ControlRequest = parse_text(r#"{"type":"kill","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            ControlRequest::Kill {
                session_id: "s1".to_string()
            }
        );
    }

    #[test]
    fn test_exited_event_shape() {
        let event = ControlEvent::Exited {
            session_id: "s1".to_string(),
            exit_code: 143,
            outcome: ExitOutcome::Killed,
        };
        let value: serde_json::Value = serde_json::from_str(&to_text(&event).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "exited", "sessionId": "s1", "exitCode": 143, "outcome": "killed"})
        );
    }

    #[test]
    fn test_sessions_event_shape() {
        let event = ControlEvent::Sessions {
            list: vec![SessionSummary {
                id: "s1".to_string(),
                cli: "shell".to_string(),
                cwd: "/tmp".to_string(),
                cols: 120,
                rows: 36,
                started_at: 1000,
                status: SessionState::Running,
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&to_text(&event).unwrap()).unwrap();
        assert_eq!(value["list"][0]["startedAt"], 1000);
        assert_eq!(value["list"][0]["status"], "running");
    }

    #[test]
    fn test_exit_outcome_classification() {
        assert_eq!(ExitOutcome::classify(true, 137), ExitOutcome::Killed);
        assert_eq!(ExitOutcome::classify(true, 0), ExitOutcome::Killed);
        assert_eq!(ExitOutcome::classify(false, 0), ExitOutcome::Done);
        assert_eq!(ExitOutcome::classify(false, 2), ExitOutcome::Error);
    }

    #[test]
    fn test_parse_terminal_resize() {
        let msg: TerminalRequest = parse_text(r#"{"type":"resize","cols":90,"rows":30}"#).unwrap();
        assert_eq!(msg, TerminalRequest::Resize { cols: 90, rows: 30 });
    }
}
