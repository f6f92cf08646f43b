//! Short-lived, single-use token storage.
//!
//! One generic store serves two token classes: registration tokens (the
//! identity-verification hand-off, read-many until explicitly invalidated)
//! and authorization codes (consumed exactly once). Consumption deletes
//! first and validates after: when two callers race on the same token, both
//! may attempt the delete but only one receives a row, so at most one
//! consumption can succeed. Expiry and context checks run on the returned
//! row and degrade to "not found", which is also what callers see for a
//! token that never existed.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{error, info, info_span, warn, Instrument};

use super::directory::normalize_identifier;
use super::error::AuthError;
use super::BoxFuture;

/// TTL for a login-initiated registration token.
pub const REGISTRATION_TOKEN_TTL: Duration = Duration::seconds(600);
/// TTL for an admin-generated registration link.
pub const ADMIN_REGISTRATION_TOKEN_TTL: Duration = Duration::seconds(86_400);
/// TTL for an authorization code.
pub const AUTH_CODE_TTL: Duration = Duration::seconds(300);
/// How often the background sweep deletes expired rows.
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Payload carried by one token class.
pub trait TokenPayload:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Discriminator separating token classes that share a table.
    const KIND: &'static str;
    /// Application the token is bound to, checked on consumption.
    fn app_id(&self) -> &str;
}

/// Hand-off artifact binding an unverified identity to an application context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub employee_name: String,
    pub app_id: String,
    pub redirect_uri: String,
}

impl TokenPayload for RegistrationPayload {
    const KIND: &'static str = "registration";

    fn app_id(&self) -> &str {
        &self.app_id
    }
}

/// Proof of successful authentication, exchanged once for a signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCodePayload {
    pub employee_name: String,
    pub app_id: String,
}

impl TokenPayload for AuthCodePayload {
    const KIND: &'static str = "auth_code";

    fn app_id(&self) -> &str {
        &self.app_id
    }
}

/// Generate an opaque token: 32 bytes of OS entropy, URL-safe encoding.
/// Collisions are statistically impossible and not checked.
pub fn generate_opaque_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::UpstreamUnavailable(format!("entropy source failed: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub trait TokenStore<P: TokenPayload>: Send + Sync {
    /// Persist a payload under a fresh opaque token.
    fn issue<'a>(&'a self, payload: P, ttl: Duration) -> BoxFuture<'a, Result<String, AuthError>>;

    /// Read-only lookup. Absent and expired are both `None`.
    fn peek<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<P>, AuthError>>;

    /// Atomic delete-then-validate. The delete is unconditional for the
    /// token; expiry and app binding are checked on the deleted row, so
    /// concurrent consumers resolve to exactly one success.
    fn consume<'a>(
        &'a self,
        token: &'a str,
        expected_app: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<P>, AuthError>>;

    /// Forced deletion once the surrounding flow has fully completed.
    fn invalidate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<(), AuthError>>;

    /// Delete expired rows. Garbage collection only; `peek`/`consume`
    /// already enforce expiry.
    fn sweep<'a>(&'a self) -> BoxFuture<'a, Result<u64, AuthError>>;
}

fn validate_row<P: TokenPayload>(
    payload: P,
    expires_at: DateTime<Utc>,
    expected_app: Option<&str>,
    now: DateTime<Utc>,
) -> Option<P> {
    if now > expires_at {
        warn!(kind = P::KIND, "Token rejected: expired");
        return None;
    }
    if let Some(expected) = expected_app {
        if payload.app_id() != expected {
            warn!(
                kind = P::KIND,
                expected, got = payload.app_id(), "Token rejected: app binding mismatch"
            );
            return None;
        }
    }
    Some(payload)
}

/// Database-backed store shared across service instances.
#[derive(Debug, Clone)]
pub struct PgTokenStore<P> {
    pool: PgPool,
    _payload: std::marker::PhantomData<fn() -> P>,
}

impl<P: TokenPayload> PgTokenStore<P> {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _payload: std::marker::PhantomData,
        }
    }
}

impl<P: TokenPayload> TokenStore<P> for PgTokenStore<P> {
    fn issue<'a>(&'a self, payload: P, ttl: Duration) -> BoxFuture<'a, Result<String, AuthError>> {
        Box::pin(async move {
            let token = generate_opaque_token()?;
            let expires_at = Utc::now() + ttl;
            let body = serde_json::to_value(&payload)
                .map_err(|err| AuthError::UpstreamUnavailable(format!("payload encoding: {err}")))?;

            let query = "INSERT INTO one_time_tokens (token, kind, payload, expires_at) VALUES ($1, $2, $3, $4)";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(&token)
                .bind(P::KIND)
                .bind(&body)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(span)
                .await?;

            info!(kind = P::KIND, ttl_seconds = ttl.num_seconds(), "Token issued");
            Ok(token)
        })
    }

    fn peek<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<P>, AuthError>> {
        Box::pin(async move {
            let query =
                "SELECT payload, expires_at FROM one_time_tokens WHERE token = $1 AND kind = $2";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(token)
                .bind(P::KIND)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let payload = decode_payload::<P>(row.try_get("payload")?)?;
            let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
            Ok(validate_row(payload, expires_at, None, Utc::now()))
        })
    }

    fn consume<'a>(
        &'a self,
        token: &'a str,
        expected_app: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<P>, AuthError>> {
        Box::pin(async move {
            // Unconditional delete resolves the race: the first deleter gets
            // the row back, the second sees nothing to delete.
            let query = "DELETE FROM one_time_tokens WHERE token = $1 AND kind = $2 RETURNING payload, expires_at";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(token)
                .bind(P::KIND)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;

            let Some(row) = row else {
                warn!(kind = P::KIND, "Token consumption failed: not found");
                return Ok(None);
            };
            let payload = decode_payload::<P>(row.try_get("payload")?)?;
            let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
            Ok(validate_row(payload, expires_at, expected_app, Utc::now()))
        })
    }

    fn invalidate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let query = "DELETE FROM one_time_tokens WHERE token = $1 AND kind = $2";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(token)
                .bind(P::KIND)
                .execute(&self.pool)
                .instrument(span)
                .await?;
            Ok(())
        })
    }

    fn sweep<'a>(&'a self) -> BoxFuture<'a, Result<u64, AuthError>> {
        Box::pin(async move {
            let query = "DELETE FROM one_time_tokens WHERE kind = $1 AND expires_at < NOW()";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(P::KIND)
                .execute(&self.pool)
                .instrument(span)
                .await?;
            Ok(result.rows_affected())
        })
    }
}

fn decode_payload<P: TokenPayload>(value: serde_json::Value) -> Result<P, AuthError> {
    serde_json::from_value(value)
        .map_err(|err| AuthError::UpstreamUnavailable(format!("payload decoding: {err}")))
}

/// Map-backed store for single-process deployments and tests. A single
/// mutex makes `remove` the atomic race-resolving step, mirroring the
/// database `DELETE ... RETURNING`.
#[derive(Debug, Default)]
pub struct MemoryTokenStore<P> {
    rows: Mutex<HashMap<String, (P, DateTime<Utc>)>>,
}

impl<P: TokenPayload> MemoryTokenStore<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (P, DateTime<Utc>)>>, AuthError> {
        self.rows
            .lock()
            .map_err(|_| AuthError::UpstreamUnavailable("token store poisoned".into()))
    }
}

impl<P: TokenPayload> TokenStore<P> for MemoryTokenStore<P> {
    fn issue<'a>(&'a self, payload: P, ttl: Duration) -> BoxFuture<'a, Result<String, AuthError>> {
        Box::pin(async move {
            let token = generate_opaque_token()?;
            let expires_at = Utc::now() + ttl;
            self.lock()?.insert(token.clone(), (payload, expires_at));
            Ok(token)
        })
    }

    fn peek<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<P>, AuthError>> {
        Box::pin(async move {
            let rows = self.lock()?;
            Ok(rows.get(token).cloned().and_then(|(payload, expires_at)| {
                validate_row(payload, expires_at, None, Utc::now())
            }))
        })
    }

    fn consume<'a>(
        &'a self,
        token: &'a str,
        expected_app: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<P>, AuthError>> {
        Box::pin(async move {
            let removed = self.lock()?.remove(token);
            let Some((payload, expires_at)) = removed else {
                warn!(kind = P::KIND, "Token consumption failed: not found");
                return Ok(None);
            };
            Ok(validate_row(payload, expires_at, expected_app, Utc::now()))
        })
    }

    fn invalidate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            self.lock()?.remove(token);
            Ok(())
        })
    }

    fn sweep<'a>(&'a self) -> BoxFuture<'a, Result<u64, AuthError>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut rows = self.lock()?;
            let before = rows.len();
            rows.retain(|_, (_, expires_at)| *expires_at >= now);
            Ok((before - rows.len()) as u64)
        })
    }
}

/// Periodically delete expired rows for one token class. Failures are
/// logged and retried on the next tick; the host process keeps running.
pub fn spawn_sweeper<P: TokenPayload>(
    store: std::sync::Arc<dyn TokenStore<P>>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.sweep().await {
                Ok(0) => {}
                Ok(deleted) => info!(kind = P::KIND, deleted, "Swept expired tokens"),
                Err(err) => error!(kind = P::KIND, "Token sweep failed: {err}"),
            }
        }
    })
}

/// Issue a registration token for an identity that has not completed
/// registration yet.
pub async fn issue_registration_token(
    store: &dyn TokenStore<RegistrationPayload>,
    employee_name: &str,
    app_id: &str,
    redirect_uri: &str,
    ttl: Duration,
) -> Result<String, AuthError> {
    let payload = RegistrationPayload {
        employee_name: normalize_identifier(employee_name),
        app_id: app_id.to_string(),
        redirect_uri: redirect_uri.to_string(),
    };
    store.issue(payload, ttl).await
}

/// Issue an authorization code after a successful login.
pub async fn issue_auth_code(
    store: &dyn TokenStore<AuthCodePayload>,
    employee_name: &str,
    app_id: &str,
) -> Result<String, AuthError> {
    let payload = AuthCodePayload {
        employee_name: normalize_identifier(employee_name),
        app_id: app_id.to_string(),
    };
    store.issue(payload, AUTH_CODE_TTL).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn code(employee_name: &str, app_id: &str) -> AuthCodePayload {
        AuthCodePayload {
            employee_name: employee_name.to_string(),
            app_id: app_id.to_string(),
        }
    }

    #[test]
    fn opaque_tokens_are_long_and_unique() {
        let first = generate_opaque_token().unwrap();
        let second = generate_opaque_token().unwrap();
        assert_ne!(first, second);
        // 32 bytes, URL-safe without padding.
        assert_eq!(URL_SAFE_NO_PAD.decode(&first).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn consume_succeeds_once() {
        let store = MemoryTokenStore::new();
        let token = issue_auth_code(&store, "jane.doe", "chat_app").await.unwrap();

        let first = store.consume(&token, Some("chat_app")).await.unwrap();
        assert_eq!(first.map(|p| p.employee_name), Some("jane.doe".to_string()));

        let second = store.consume(&token, Some("chat_app")).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn concurrent_consumers_resolve_to_one_success() {
        let store: Arc<MemoryTokenStore<AuthCodePayload>> = Arc::new(MemoryTokenStore::new());
        let token = issue_auth_code(store.as_ref(), "jane.doe", "chat_app")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store.consume(&token, Some("chat_app")).await.unwrap()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn app_binding_mismatch_is_not_found() {
        let store = MemoryTokenStore::new();
        let token = issue_auth_code(&store, "jane.doe", "chat_app").await.unwrap();

        let wrong = store.consume(&token, Some("other_app")).await.unwrap();
        assert!(wrong.is_none());

        // The mismatch still consumed the token: replay with the right app fails too.
        let replay = store.consume(&token, Some("chat_app")).await.unwrap();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_not_found() {
        let store = MemoryTokenStore::new();
        let token = store
            .issue(code("jane.doe", "chat_app"), Duration::seconds(-1))
            .await
            .unwrap();
        assert!(store.peek(&token).await.unwrap().is_none());
        assert!(store.consume(&token, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_valid_until_its_expiry_instant() {
        let store = MemoryTokenStore::new();
        let token = store
            .issue(code("jane.doe", "chat_app"), Duration::seconds(3600))
            .await
            .unwrap();
        assert!(store.peek(&token).await.unwrap().is_some());
        assert!(store.consume(&token, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn registration_token_peeks_many_then_invalidates() {
        let store = MemoryTokenStore::new();
        let token = issue_registration_token(
            &store,
            "  Jane.Doe ",
            "chat_app",
            "https://chat.internal/callback",
            REGISTRATION_TOKEN_TTL,
        )
        .await
        .unwrap();

        // Form resubmission reads the token more than once.
        for _ in 0..3 {
            let payload = store.peek(&token).await.unwrap().unwrap();
            assert_eq!(payload.employee_name, "jane.doe");
        }

        store.invalidate(&token).await.unwrap();
        assert!(store.peek(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let store = MemoryTokenStore::new();
        store
            .issue(code("a", "app"), Duration::seconds(-5))
            .await
            .unwrap();
        let live = store
            .issue(code("b", "app"), Duration::seconds(3600))
            .await
            .unwrap();

        assert_eq!(store.sweep().await.unwrap(), 1);
        assert!(store.peek(&live).await.unwrap().is_some());
    }
}
