//! Access ticket issuance, verification and revocation.
//!
//! The signing secret is 32 random bytes, hex-encoded, stored at
//! `<data_dir>/token.secret` with mode 0600 and created on first use.
//! The ticket format itself lives in [`tether_protocol::ticket`].

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tether_protocol::ticket::{self, TicketClaims, TicketError};
use thiserror::Error;

use super::ChannelKind;
use crate::clock::now_millis;
use crate::store::{IssuedTokenRecord, RevokedToken, Store, StoreError};

/// Secret length in bytes before hex encoding.
const SECRET_BYTES: usize = 32;

/// Why a ticket was rejected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum VerifyFailure {
    #[error("missing")]
    Missing,
    #[error("invalid_format")]
    InvalidFormat,
    #[error("invalid_payload")]
    InvalidPayload,
    #[error("signature_mismatch")]
    SignatureMismatch,
    #[error("expired")]
    Expired,
    #[error("revoked")]
    Revoked,
}

impl VerifyFailure {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::InvalidFormat => "invalid_format",
            Self::InvalidPayload => "invalid_payload",
            Self::SignatureMismatch => "signature_mismatch",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl From<TicketError> for VerifyFailure {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::Missing => Self::Missing,
            TicketError::InvalidFormat => Self::InvalidFormat,
            TicketError::InvalidPayload => Self::InvalidPayload,
            TicketError::SignatureMismatch | TicketError::InvalidKey => Self::SignatureMismatch,
        }
    }
}

/// Errors from the ticket service itself.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to access token secret: {0}")]
    Secret(#[from] io::Error),

    #[error("token secret is malformed")]
    MalformedSecret,

    #[error("unknown scope: {0}")]
    InvalidScope(String),

    #[error("failed to sign ticket: {0}")]
    Signing(#[from] TicketError),

    #[error("ticket rejected: {0}")]
    Rejected(VerifyFailure),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A freshly issued ticket.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TicketClaims,
    pub expires_at: u64,
}

/// A ticket that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub claims: TicketClaims,
    pub expires_at: u64,
}

/// Issues, verifies and revokes signed tickets.
pub struct AccessTokenService {
    secret: Vec<u8>,
    ttl: Duration,
    store: Arc<dyn Store>,
}

impl AccessTokenService {
    /// Creates the service, loading or creating the secret at `secret_path`.
    pub fn open(
        secret_path: &Path,
        ttl: Duration,
        store: Arc<dyn Store>,
    ) -> Result<Self, TokenError> {
        let secret = load_or_create_secret(secret_path)?;
        Ok(Self::with_secret(secret, ttl, store))
    }

    pub fn with_secret(secret: Vec<u8>, ttl: Duration, store: Arc<dyn Store>) -> Self {
        Self { secret, ttl, store }
    }

    /// Issues a ticket for `scope` (`all` or a channel name).
    pub fn issue(&self, actor: &str, scope: &str) -> Result<IssuedToken, TokenError> {
        if scope != ticket::SCOPE_ALL && ChannelKind::from_name(scope).is_none() {
            return Err(TokenError::InvalidScope(scope.to_string()));
        }

        let claims = TicketClaims::new(scope, now_millis(), self.ttl.as_millis() as u64);
        let token = ticket::sign(&self.secret, &claims)?;

        self.store.record_issued_token(IssuedTokenRecord {
            jti: claims.jti.clone(),
            scope: claims.scope.clone(),
            issued_at: claims.iat,
            expires_at: claims.exp,
            actor: actor.to_string(),
        })?;

        tracing::info!(jti = %claims.jti, scope = %claims.scope, actor = %actor, "Issued ticket");
        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
            claims,
        })
    }

    /// Verifies signature, revocation and expiry, in that order.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, VerifyFailure> {
        self.verify_at(token, now_millis())
    }

    /// [`verify`](Self::verify) on the blocking pool, for async callers.
    ///
    /// A failed blocking task fails closed as [`VerifyFailure::Revoked`].
    pub async fn verify_blocking(
        self: &Arc<Self>,
        token: String,
    ) -> Result<VerifiedToken, VerifyFailure> {
        let service = Arc::clone(self);
        match tokio::task::spawn_blocking(move || service.verify(&token)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Ticket verification task failed: {}", e);
                Err(VerifyFailure::Revoked)
            }
        }
    }

    fn verify_at(&self, token: &str, now_ms: u64) -> Result<VerifiedToken, VerifyFailure> {
        let claims = ticket::verify_signature(&self.secret, token)?;

        match self.store.is_token_revoked(&claims.jti) {
            Ok(false) => {}
            Ok(true) => return Err(VerifyFailure::Revoked),
            Err(e) => {
                // Fail closed when revocation state is unknown.
                tracing::error!(jti = %claims.jti, "Revocation lookup failed: {}", e);
                return Err(VerifyFailure::Revoked);
            }
        }

        if claims.is_expired(now_ms) {
            return Err(VerifyFailure::Expired);
        }

        Ok(VerifiedToken {
            expires_at: claims.exp,
            claims,
        })
    }

    /// Permanently revokes a ticket. Expired tickets may still be revoked, but
    /// the signature must be valid.
    pub fn revoke(&self, token: &str, reason: &str) -> Result<TicketClaims, TokenError> {
        let claims = ticket::verify_signature(&self.secret, token)
            .map_err(|e| TokenError::Rejected(e.into()))?;
        self.revoke_jti(&claims.jti, reason)?;
        Ok(claims)
    }

    /// Revokes a ticket by id.
    pub fn revoke_jti(&self, jti: &str, reason: &str) -> Result<(), TokenError> {
        self.store.revoke_token(RevokedToken {
            jti: jti.to_string(),
            revoked_at: now_millis(),
            reason: reason.to_string(),
        })?;
        tracing::info!(jti = %jti, reason = %reason, "Revoked ticket");
        Ok(())
    }
}

/// Reads the hex secret at `path`, generating it with mode 0600 if absent.
pub fn load_or_create_secret(path: &Path) -> Result<Vec<u8>, TokenError> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let secret = hex::decode(contents.trim()).map_err(|_| TokenError::MalformedSecret)?;
            if secret.len() != SECRET_BYTES {
                return Err(TokenError::MalformedSecret);
            }
            Ok(secret)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut secret = vec![0u8; SECRET_BYTES];
            rand::thread_rng().fill_bytes(&mut secret);
            write_secret(path, &hex::encode(&secret))?;
            tracing::info!("Generated new token secret at {:?}", path);
            Ok(secret)
        }
        Err(e) => Err(TokenError::Secret(e)),
    }
}

fn write_secret(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
    }

    #[cfg(not(unix))]
    fs::write(path, contents)?;

    Ok(())
}
