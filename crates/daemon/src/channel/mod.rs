//! Websocket channels.
//!
//! Three endpoints share the same handshake ([`crate::auth::AuthGate`]) and
//! socket plumbing ([`socket`]):
//!
//! - [`control`]: session lifecycle commands and broadcast events
//! - [`terminal`]: one session's byte stream with replay from an offset
//! - [`desktop`]: byte-transparent proxy to a local remote-desktop server

pub mod control;
pub mod desktop;
pub mod socket;
pub mod terminal;

use thiserror::Error;

/// Which endpoint a socket is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Terminal,
    Desktop,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [Self::Control, Self::Terminal, Self::Desktop];

    /// Name used in ticket scopes, metrics and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Terminal => "terminal",
            Self::Desktop => "desktop",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// Errors that end a channel connection before it is established.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("desktop backend unavailable: {0}")]
    DesktopUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::from_name("all"), None);
        assert_eq!(ChannelKind::from_name("Control"), None);
    }

    #[test]
    fn test_channel_error_message() {
        let e = ChannelError::DesktopUnavailable("no server at 127.0.0.1:5900".to_string());
        assert_eq!(
            e.to_string(),
            "desktop backend unavailable: no server at 127.0.0.1:5900"
        );
    }
}
