//! Socket authentication: signed tickets, the first-message handshake and
//! the failed-attempt limiter.

pub mod gate;
pub mod rate_limit;
pub mod tokens;

pub use crate::channel::ChannelKind;
pub use gate::{AuthContext, AuthGate, AuthRejection, FirstMessage};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use tokens::{
    load_or_create_secret, AccessTokenService, IssuedToken, TokenError, VerifiedToken,
    VerifyFailure,
};
