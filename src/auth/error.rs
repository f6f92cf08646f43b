//! Error taxonomy for the credential and authorization-flow engine.
//!
//! Security-sensitive distinctions (unknown identifier vs. wrong password
//! vs. expired artifact) are collapsed into one generic message before they
//! cross the service boundary. Operational distinctions (rate limit,
//! permission reason, upstream failure) are preserved because they are not
//! exploitable and help callers self-serve. The full reason is always
//! logged server-side before the collapse.

use axum::http::StatusCode;
use thiserror::Error;

/// Message shared by all credential failures to prevent user enumeration.
pub const GENERIC_CREDENTIAL_MESSAGE: &str = "Invalid username or password.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Identity, token, or grant absent. Externally identical to `Expired`.
    #[error("not found")]
    NotFound,

    /// Wrong password. Externally identical to `NotFound`.
    #[error("invalid credential")]
    InvalidCredential,

    /// Sliding-window limit exceeded. Always safe to reveal.
    #[error("too many attempts")]
    RateLimited,

    /// Token or code past its TTL. Internally distinct for logging only.
    #[error("expired")]
    Expired,

    /// Department or level rule failure. The reason is revealed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Directory or store timeout/outage. Retryable, never treated as absent.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl AuthError {
    /// The message callers outside the trust boundary are allowed to see.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound | Self::InvalidCredential | Self::Expired => {
                GENERIC_CREDENTIAL_MESSAGE.to_string()
            }
            Self::RateLimited => "Too many attempts, please try again in 5 minutes.".to_string(),
            Self::PermissionDenied(reason) => reason.clone(),
            Self::UpstreamUnavailable(_) => "Service temporarily unavailable.".to_string(),
        }
    }

    /// HTTP status for handler responses.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound | Self::InvalidCredential | Self::Expired => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}
