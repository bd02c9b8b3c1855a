//! # Tether Daemon Library
//!
//! Remote control of long-running terminal sessions over websockets.
//!
//! ## Overview
//!
//! Sessions run inside tmux, so they outlive both client connections and the
//! daemon itself. Clients reach them through three websocket channels that
//! share a ticket-based handshake:
//!
//! - **Control** (`/ws/control`): spawn, kill and resize sessions; receive the
//!   session list, exit notices and clipboard updates
//! - **Terminal** (`/ws/terminal`): one session's output with exactly-once
//!   replay from a byte offset, plus input and resize
//! - **Desktop** (`/ws/desktop`): byte-transparent proxy to a local VNC server
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        axum server                           │
//! │   /ws/control      /ws/terminal      /ws/desktop   /healthz  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                 AuthGate (tickets + limiter)                 │
//! ├──────────────┬───────────────────────────┬───────────────────┤
//! │  ControlHub  │      SessionManager       │  DesktopBackend   │
//! │              │  tmux ─ logs ─ attach PTY │                   │
//! ├──────────────┴───────────────────────────┴───────────────────┤
//! │          Store (JSON)   ·   Audit   ·   Metrics              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Tickets, the first-message handshake and rate limiting
//! - [`session`]: tmux backend, session cache and attachments
//! - [`channel`]: The three websocket channels
//! - [`server`]: Router and shared state
//! - [`store`]: Durable task, session and ticket records
//! - [`telemetry`]: Audit, metrics and notifications
//! - [`pidfile`]: Single-instance detection

pub mod auth;
pub mod channel;
pub mod clock;
pub mod config;
pub mod pidfile;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;

// Re-export protocol for convenience
pub use tether_protocol as protocol;

pub use config::Config;
pub use server::AppState;
pub use session::{Session, SessionError, SessionId, SessionManager};
