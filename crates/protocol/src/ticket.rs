//! Signed access tickets.
//!
//! A ticket is three dot-separated segments:
//!
//! ```text
//! v1.<base64url(claims json)>.<base64url(hmac-sha256(secret, claims segment))>
//! ```
//!
//! This module only knows the format and the MAC. Expiry and revocation are
//! policy and live with whoever owns the clock and the revocation list.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Version prefix of the current ticket format.
pub const TICKET_VERSION: &str = "v1";

/// Scope granting access to every channel.
pub const SCOPE_ALL: &str = "all";

/// Size of a ticket id in bytes before hex encoding.
pub const JTI_BYTES: usize = 16;

/// Claims carried inside a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    /// Random ticket id, 32 lowercase hex characters.
    pub jti: String,
    /// Issue time in Unix milliseconds.
    pub iat: u64,
    /// Expiry time in Unix milliseconds.
    pub exp: u64,
    /// `all` or a channel name.
    pub scope: String,
}

impl TicketClaims {
    /// Builds claims with a fresh random id.
    pub fn new(scope: impl Into<String>, issued_at_ms: u64, ttl_ms: u64) -> Self {
        Self {
            jti: generate_jti(),
            iat: issued_at_ms,
            exp: issued_at_ms.saturating_add(ttl_ms),
            scope: scope.into(),
        }
    }

    /// Whether the claims have expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.exp
    }

    /// Whether this ticket may open the named channel.
    pub fn allows_channel(&self, channel: &str) -> bool {
        self.scope == SCOPE_ALL || self.scope == channel
    }
}

/// Structural ticket failures.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TicketError {
    /// Empty ticket.
    #[error("ticket missing")]
    Missing,
    /// Wrong segment count or version.
    #[error("ticket has an invalid format")]
    InvalidFormat,
    /// Signature verified but the claims did not decode.
    #[error("ticket payload is invalid")]
    InvalidPayload,
    /// MAC did not match.
    #[error("ticket signature mismatch")]
    SignatureMismatch,
    /// Signing key was rejected by the MAC.
    #[error("invalid signing key")]
    InvalidKey,
}

/// Generates a random ticket id.
pub fn generate_jti() -> String {
    let mut bytes = [0u8; JTI_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mac_for(secret: &[u8], payload_segment: &str) -> Result<HmacSha256, TicketError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TicketError::InvalidKey)?;
    mac.update(payload_segment.as_bytes());
    Ok(mac)
}

/// Encodes and signs claims into a ticket string.
pub fn sign(secret: &[u8], claims: &TicketClaims) -> Result<String, TicketError> {
    let json = serde_json::to_vec(claims).map_err(|_| TicketError::InvalidPayload)?;
    let payload = URL_SAFE_NO_PAD.encode(json);
    let signature = mac_for(secret, &payload)?.finalize().into_bytes();
    Ok(format!(
        "{}.{}.{}",
        TICKET_VERSION,
        payload,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Checks a ticket's format and signature and returns its claims.
///
/// The MAC is compared in constant time. The payload is only decoded once the
/// signature has been accepted.
pub fn verify_signature(secret: &[u8], token: &str) -> Result<TicketClaims, TicketError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TicketError::Missing);
    }

    let mut parts = token.split('.');
    let (version, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(p), Some(s)) if parts.next().is_none() => (v, p, s),
        _ => return Err(TicketError::InvalidFormat),
    };
    if version != TICKET_VERSION || payload.is_empty() || signature.is_empty() {
        return Err(TicketError::InvalidFormat);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TicketError::SignatureMismatch)?;
    mac_for(secret, payload)?
        .verify_slice(&signature)
        .map_err(|_| TicketError::SignatureMismatch)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TicketError::InvalidPayload)?;
    serde_json::from_slice(&json).map_err(|_| TicketError::InvalidPayload)
}
