//! # Tether Protocol Library
//!
//! Wire definitions shared by the Tether daemon and its clients.
//!
//! ## Overview
//!
//! Every channel is a websocket. The first message on any of them is an
//! authentication request carrying a signed ticket; after that each channel
//! speaks its own closed set of JSON messages, and terminal sockets may
//! negotiate a compact binary frame format for raw terminal bytes.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Channel messages (control / terminal)  │  JSON, tagged by "type"
//! ├─────────────────────────────────────────┤
//! │       binary-v1 terminal frames         │  optional, per socket
//! ├─────────────────────────────────────────┤
//! │     auth handshake (signed ticket)      │  HMAC-SHA256
//! ├─────────────────────────────────────────┤
//! │            WebSocket over TLS           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tether_protocol::framing::{FrameCodec, FrameType};
//! use tether_protocol::ticket::{self, TicketClaims};
//!
//! let secret = [7u8; 32];
//! let claims = TicketClaims::new("all", 0, 60_000);
//! let token = ticket::sign(&secret, &claims).unwrap();
//! assert_eq!(ticket::verify_signature(&secret, &token).unwrap(), claims);
//!
//! let codec = FrameCodec::new("session-1");
//! let frame = codec.encode(FrameType::Input, b"ls\r");
//! assert_eq!(codec.decode_input(&frame).unwrap(), b"ls\r");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Channel message definitions and close codes
//! - [`framing`]: binary-v1 frame codec
//! - [`ticket`]: Signed ticket format
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;
pub mod ticket;

pub use error::{ProtocolError, Result};
pub use framing::{session_hash, Codec, Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE};
pub use messages::{
    close_code, AuthReply, AuthRequest, ControlEvent, ControlRequest, ExitOutcome, SessionState,
    SessionSummary, TerminalEvent, TerminalRequest, PROTOCOL_VERSION,
};
pub use ticket::{TicketClaims, TicketError, SCOPE_ALL};
