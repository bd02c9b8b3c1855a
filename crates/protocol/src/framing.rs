//! Binary frame codec for terminal sockets.
//!
//! # Frame Format (`binary-v1`)
//!
//! Each binary websocket message consists of:
//! - 1 byte: frame type (`0x01` output, `0x02` input)
//! - 4 bytes: FNV-1a hash of the session id (big-endian)
//! - N bytes: raw terminal bytes
//!
//! The hash lets either side reject a frame addressed to another session
//! without parsing anything beyond the fixed header.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Frame header size: 1 (type) + 4 (session hash).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Codec name negotiated in the terminal query string.
pub const BINARY_V1: &str = "binary-v1";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes the 32-bit FNV-1a hash of a session id.
pub fn session_hash(session_id: &str) -> u32 {
    session_id.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Terminal output, server to client.
    Output = 0x01,
    /// Terminal input, client to server.
    Input = 0x02,
}

impl FrameType {
    /// Parses a type tag.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Output),
            0x02 => Ok(Self::Input),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// Terminal stream codec negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Text frames carrying JSON messages.
    #[default]
    None,
    /// Binary frames with the `binary-v1` header.
    BinaryV1,
}

impl FromStr for Codec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Self::None),
            BINARY_V1 => Ok(Self::BinaryV1),
            other => Err(ProtocolError::UnsupportedCodec(other.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::BinaryV1 => write!(f, "{}", BINARY_V1),
        }
    }
}

/// A decoded binary frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Frame type.
    pub kind: FrameType,
    /// Session hash carried in the header.
    pub session_hash: u32,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Encoder and decoder bound to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    session_hash: u32,
}

impl FrameCodec {
    /// Creates a codec for the given session id.
    pub fn new(session_id: &str) -> Self {
        Self {
            session_hash: session_hash(session_id),
        }
    }

    /// Returns the hash this codec stamps and expects.
    pub fn session_hash(&self) -> u32 {
        self.session_hash
    }

    /// Encodes a frame of the given type.
    pub fn encode(&self, kind: FrameType, payload: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.push(kind as u8);
        output.extend_from_slice(&self.session_hash.to_be_bytes());
        output.extend_from_slice(payload);
        output
    }

    /// Encodes an output frame.
    pub fn encode_output(&self, payload: &[u8]) -> Vec<u8> {
        self.encode(FrameType::Output, payload)
    }

    /// Decodes any frame, validating the header against this session.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<Frame<'a>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                len: data.len(),
                min: FRAME_HEADER_SIZE,
            });
        }

        let kind = FrameType::from_byte(data[0])?;
        let got = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if got != self.session_hash {
            return Err(ProtocolError::SessionHashMismatch {
                expected: self.session_hash,
                got,
            });
        }

        Ok(Frame {
            kind,
            session_hash: got,
            payload: &data[FRAME_HEADER_SIZE..],
        })
    }

    /// Decodes a client frame, which must be an input frame.
    pub fn decode_input<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let frame = self.decode(data)?;
        match frame.kind {
            FrameType::Input => Ok(frame.payload),
            other => Err(ProtocolError::UnknownFrameType(other as u8)),
        }
    }
}
