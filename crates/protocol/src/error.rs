//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A binary frame arrived where a text message was required.
    #[error("unexpected binary frame")]
    UnexpectedBinary,

    /// A text message had a valid shape but the wrong type for this point
    /// in the conversation.
    #[error("unexpected message type: {0}")]
    UnexpectedMessage(String),

    // Frame errors
    /// Frame is shorter than the fixed header.
    #[error("frame too short: {len} bytes, header needs {min}")]
    FrameTooShort {
        /// Actual frame length.
        len: usize,
        /// Minimum frame length.
        min: usize,
    },

    /// Frame carries a type tag this side does not accept.
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Frame header names a different session than the connection.
    #[error("session hash mismatch: expected {expected:#010x}, got {got:#010x}")]
    SessionHashMismatch {
        /// Hash of the connection's session id.
        expected: u32,
        /// Hash carried by the frame.
        got: u32,
    },

    /// Unsupported codec name in the connection query.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_frame_too_short_display() {
        let err = ProtocolError::FrameTooShort { len: 3, min: 5 };
        assert_eq!(err.to_string(), "frame too short: 3 bytes, header needs 5");
    }

    #[test]
    fn test_unknown_frame_type_display() {
        let err = ProtocolError::UnknownFrameType(0x7f);
        assert_eq!(err.to_string(), "unknown frame type: 0x7f");
    }

    #[test]
    fn test_session_hash_mismatch_display() {
        let err = ProtocolError::SessionHashMismatch {
            expected: 0xdeadbeef,
            got: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "session hash mismatch: expected 0xdeadbeef, got 0x00000001"
        );
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
