//! First-message authentication handshake shared by every channel.
//!
//! A socket gets one chance: its first data message must be a text
//! `{type:"auth", token}` arriving before the deadline. Anything else closes
//! the socket with a specific close code, counts once against the peer's
//! rate-limit bucket and lands in the audit trail.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde_json::json;
use tether_protocol::messages::{parse_text, to_text};
use tether_protocol::{close_code, AuthReply, AuthRequest, TicketClaims};
use thiserror::Error;

use super::rate_limit::RateLimiter;
use super::tokens::{AccessTokenService, VerifiedToken, VerifyFailure};
use crate::channel::socket::close_socket;
use crate::channel::ChannelKind;
use crate::telemetry::{AuditEvent, AuditLog, AuditOutcome, Metrics};

/// What the peer sent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstMessage {
    Text(String),
    Binary,
    Closed,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("too many failed attempts, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("authentication timed out")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    Failed(VerifyFailure),

    #[error("ticket scope {scope} does not cover {channel}")]
    ScopeMismatch { scope: String, channel: &'static str },

    #[error("peer closed before authenticating")]
    Closed,
}

impl AuthRejection {
    /// Close code sent to the peer, if the socket is still open.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(close_code::RATE_LIMITED),
            Self::Timeout => Some(close_code::AUTH_TIMEOUT),
            Self::ProtocolViolation(_) => Some(close_code::PROTOCOL_VIOLATION),
            Self::Failed(_) | Self::ScopeMismatch { .. } => Some(close_code::AUTH_FAILED),
            Self::Closed => None,
        }
    }

    /// Whether this rejection counts against the peer's limiter bucket.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::RateLimited { .. } | Self::Closed)
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Failed(failure) => failure.kind(),
            Self::ScopeMismatch { .. } => "scope",
            Self::Closed => "closed",
        }
    }
}

/// An authenticated socket.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: TicketClaims,
    pub expires_at: u64,
    pub channel: ChannelKind,
    pub peer: SocketAddr,
    pub client: Option<String>,
}

impl AuthContext {
    /// Label used as the actor in audit records.
    pub fn actor(&self) -> String {
        match &self.client {
            Some(client) => format!("{}@{}", client, self.peer.ip()),
            None => self.peer.ip().to_string(),
        }
    }
}

/// Timed handshake in front of every channel.
pub struct AuthGate {
    tokens: Arc<AccessTokenService>,
    limiter: Arc<RateLimiter>,
    audit: AuditLog,
    metrics: Arc<Metrics>,
    deadline: Duration,
}

impl AuthGate {
    pub fn new(
        tokens: Arc<AccessTokenService>,
        limiter: Arc<RateLimiter>,
        audit: AuditLog,
        metrics: Arc<Metrics>,
        deadline: Duration,
    ) -> Self {
        Self {
            tokens,
            limiter,
            audit,
            metrics,
            deadline,
        }
    }

    /// Runs the handshake. Returns `None` once the socket has been closed.
    pub async fn require_auth(
        &self,
        socket: &mut WebSocket,
        channel: ChannelKind,
        peer: SocketAddr,
    ) -> Option<AuthContext> {
        let decision = self.limiter.peek(&limiter_key(&peer));
        if !decision.allowed {
            let rejection = AuthRejection::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            };
            self.reject(socket, channel, peer, rejection).await;
            return None;
        }

        let first = match tokio::time::timeout(self.deadline, next_first_message(socket)).await {
            Ok(first) => first,
            Err(_) => {
                self.reject(socket, channel, peer, AuthRejection::Timeout).await;
                return None;
            }
        };

        let (verified, client) = match self.evaluate(first, channel).await {
            Ok(accepted) => accepted,
            Err(rejection) => {
                self.reject(socket, channel, peer, rejection).await;
                return None;
            }
        };

        let reply = AuthReply::AuthOk {
            expires_at: verified.expires_at,
        };
        let text = match to_text(&reply) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode auth reply: {}", e);
                close_socket(socket, close_code::INTERNAL, "internal error").await;
                return None;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            tracing::debug!(peer = %peer, "Peer went away during auth reply");
            return None;
        }

        let context = AuthContext {
            claims: verified.claims,
            expires_at: verified.expires_at,
            channel,
            peer,
            client,
        };
        self.audit.record(
            AuditEvent::new(
                "auth",
                context.actor(),
                channel.as_str(),
                AuditOutcome::Success,
            )
            .with_metadata(json!({ "jti": context.claims.jti })),
        );
        tracing::debug!(peer = %peer, channel = channel.as_str(), "Socket authenticated");
        Some(context)
    }

    /// Decides a handshake from the first message alone.
    pub async fn evaluate(
        &self,
        first: FirstMessage,
        channel: ChannelKind,
    ) -> Result<(VerifiedToken, Option<String>), AuthRejection> {
        let text = match first {
            FirstMessage::Text(text) => text,
            FirstMessage::Binary => {
                return Err(AuthRejection::ProtocolViolation(
                    "binary frame before auth".to_string(),
                ))
            }
            FirstMessage::Closed => return Err(AuthRejection::Closed),
        };

        let AuthRequest::Auth { token, client } = parse_text::<AuthRequest>(&text)
            .map_err(|e| AuthRejection::ProtocolViolation(e.to_string()))?;

        let verified = self
            .tokens
            .verify_blocking(token)
            .await
            .map_err(AuthRejection::Failed)?;
        if !verified.claims.allows_channel(channel.as_str()) {
            return Err(AuthRejection::ScopeMismatch {
                scope: verified.claims.scope,
                channel: channel.as_str(),
            });
        }

        Ok((verified, client))
    }

    async fn reject(
        &self,
        socket: &mut WebSocket,
        channel: ChannelKind,
        peer: SocketAddr,
        rejection: AuthRejection,
    ) {
        if rejection.counts_as_failure() {
            self.limiter.hit(&limiter_key(&peer));
            self.metrics.auth_failure();
        }

        self.audit.record(
            AuditEvent::new(
                "auth",
                peer.ip().to_string(),
                channel.as_str(),
                AuditOutcome::Failure,
            )
            .with_metadata(json!({ "reason": rejection.reason() })),
        );
        tracing::info!(peer = %peer, channel = channel.as_str(), "Rejected socket: {}", rejection);

        if let Some(code) = rejection.close_code() {
            close_socket(socket, code, &rejection.to_string()).await;
        }
    }
}

fn limiter_key(peer: &SocketAddr) -> String {
    peer.ip().to_string()
}

async fn next_first_message(socket: &mut WebSocket) -> FirstMessage {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return FirstMessage::Text(text),
            Some(Ok(Message::Binary(_))) => return FirstMessage::Binary,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return FirstMessage::Closed,
        }
    }
}
