//! Request handlers and the shared broker state they run against.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use secrecy::SecretString;
use serde_json::json;
use sqlx::PgPool;

use crate::auth::accounts::AccountStore;
use crate::auth::directory::Directory;
use crate::auth::error::AuthError;
use crate::auth::onetime::{AuthCodePayload, RegistrationPayload, TokenStore};
use crate::auth::permissions::GrantStore;
use crate::auth::rate_limit::RateLimiter;
use crate::notify::Notifier;
use crate::registry::AppRegistry;
use crate::token::{Claims, TokenError, TokenIssuer, TokenVerifier, ADMIN_AUDIENCE};

pub mod grants;
pub mod health;
pub mod login;
pub mod password;
pub mod register;
pub mod token;

/// Environment-configured super-admin login for the admin surface.
pub struct AdminCredentials {
    pub username: String,
    /// bcrypt hash, never the plaintext.
    pub password_hash: SecretString,
}

/// Everything the handlers need, assembled once at startup. Stores are
/// trait objects so tests can swap in the in-memory implementations.
pub struct BrokerState {
    pub directory: Arc<dyn Directory>,
    pub accounts: Arc<dyn AccountStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub registration_tokens: Arc<dyn TokenStore<RegistrationPayload>>,
    pub auth_codes: Arc<dyn TokenStore<AuthCodePayload>>,
    pub grants: Arc<dyn GrantStore>,
    pub registry: AppRegistry,
    pub issuer: TokenIssuer,
    pub verifier: TokenVerifier,
    pub notifier: Arc<dyn Notifier>,
    /// Broker database; `None` only in handler tests running against the
    /// in-memory stores.
    pub pool: Option<PgPool>,
    pub admin: AdminCredentials,
}

/// Rate-limit key for a request. Proxied deployments forward the client
/// address; absent headers collapse into one shared bucket.
#[must_use]
pub fn source_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Bearer token from the Authorization header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verify an admin-audience token or reply 401.
pub fn require_admin(state: &BrokerState, headers: &HeaderMap) -> Result<Claims, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Missing bearer token"})),
        )
            .into_response());
    };
    match state.verifier.verify(token, Some(ADMIN_AUDIENCE)) {
        Ok(claims) if claims.admin_scope().is_some() => Ok(claims),
        Ok(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid token"})),
        )
            .into_response()),
        Err(TokenError::Expired) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token expired"})),
        )
            .into_response()),
        Err(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid token"})),
        )
            .into_response()),
    }
}

/// Map a domain error to its public HTTP shape. The detailed reason was
/// already logged where the error was raised.
#[must_use]
pub fn error_response(err: &AuthError) -> Response {
    (err.status(), Json(json!({"detail": err.public_message()}))).into_response()
}

/// Best-effort audit insert; a broken audit store must not block the
/// admin action that already happened.
pub async fn audit(
    state: &BrokerState,
    admin: &str,
    action: &str,
    target: &str,
    details: serde_json::Value,
    ip: &str,
) {
    let Some(pool) = &state.pool else {
        return;
    };
    if let Err(err) = crate::audit::record(pool, admin, action, target, &details, ip).await {
        tracing::error!(action, target, "Audit insert failed: {err}");
    }
}
