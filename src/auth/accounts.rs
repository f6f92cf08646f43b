//! Local credential records for staff who completed registration.
//!
//! Passwords are stored as bcrypt hashes only. Accounts are created once at
//! registration completion and mutated only by password change; directory
//! removal does not cascade here because the directory is outside this
//! system's write authority.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use bcrypt::DEFAULT_COST;
use sqlx::{PgPool, Row};
use tracing::{info, info_span, warn, Instrument};

use super::directory::normalize_identifier;
use super::error::AuthError;
use super::BoxFuture;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, DEFAULT_COST)
        .map_err(|err| AuthError::UpstreamUnavailable(format!("password hashing failed: {err}")))
}

/// Constant-time-verifying comparison against a stored hash.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Burn one bcrypt verification against a fixed hash so "unknown identifier"
/// and "wrong password" take the same time on the login path.
pub fn burn_dummy_verification(password: &str) {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    let hash = DUMMY_HASH
        .get_or_init(|| bcrypt::hash("__portiko_dummy__", DEFAULT_COST).unwrap_or_default());
    let _ = bcrypt::verify(password, hash);
}

pub trait AccountStore: Send + Sync {
    /// Stored password hash for an identifier, or `None` when unregistered.
    fn password_hash<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>>;

    /// Create the local account. Fails with `InvalidCredential` when the
    /// identifier is already registered.
    fn create<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>>;

    /// Replace the stored hash, bumping `updated_at`.
    fn update_hash<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>>;
}

/// Create an account from a plaintext password, enforcing the hash step here
/// so callers cannot accidentally persist plaintext.
pub async fn register_account(
    store: &dyn AccountStore,
    employee_name: &str,
    password: &str,
) -> Result<(), AuthError> {
    let employee_name = normalize_identifier(employee_name);
    let hash = hash_password(password)?;
    store.create(&employee_name, &hash).await?;
    info!("Account created for {employee_name}");
    Ok(())
}

/// Verify the old password and store the new one.
pub async fn change_password(
    store: &dyn AccountStore,
    employee_name: &str,
    old_password: &str,
    new_password: &str,
) -> Result<(), AuthError> {
    let employee_name = normalize_identifier(employee_name);
    let Some(current) = store.password_hash(&employee_name).await? else {
        return Err(AuthError::NotFound);
    };
    if !verify_password(old_password, &current) {
        warn!("Change password failed for {employee_name}: wrong old password");
        return Err(AuthError::InvalidCredential);
    }
    let hash = hash_password(new_password)?;
    store.update_hash(&employee_name, &hash).await?;
    info!("Password changed for {employee_name}");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AccountStore for PgAccountStore {
    fn password_hash<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>> {
        Box::pin(async move {
            let query = "SELECT password_hash FROM user_accounts WHERE employee_name = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(normalize_identifier(employee_name))
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;
            row.map(|row| row.try_get("password_hash").map_err(AuthError::from))
                .transpose()
        })
    }

    fn create<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let query = "INSERT INTO user_accounts (employee_name, password_hash) VALUES ($1, $2)";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(normalize_identifier(employee_name))
                .bind(password_hash)
                .execute(&self.pool)
                .instrument(span)
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        AuthError::InvalidCredential
                    } else {
                        AuthError::from(err)
                    }
                })?;
            Ok(())
        })
    }

    fn update_hash<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let query =
                "UPDATE user_accounts SET password_hash = $2, updated_at = NOW() WHERE employee_name = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(normalize_identifier(employee_name))
                .bind(password_hash)
                .execute(&self.pool)
                .instrument(span)
                .await?;
            if result.rows_affected() == 0 {
                return Err(AuthError::NotFound);
            }
            Ok(())
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Map-backed account store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, String>>,
}

impl AccountStore for MemoryAccountStore {
    fn password_hash<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>> {
        Box::pin(async move {
            let accounts = self
                .accounts
                .lock()
                .map_err(|_| AuthError::UpstreamUnavailable("account store poisoned".into()))?;
            Ok(accounts.get(&normalize_identifier(employee_name)).cloned())
        })
    }

    fn create<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let mut accounts = self
                .accounts
                .lock()
                .map_err(|_| AuthError::UpstreamUnavailable("account store poisoned".into()))?;
            let key = normalize_identifier(employee_name);
            if accounts.contains_key(&key) {
                return Err(AuthError::InvalidCredential);
            }
            accounts.insert(key, password_hash.to_string());
            Ok(())
        })
    }

    fn update_hash<'a>(
        &'a self,
        employee_name: &'a str,
        password_hash: &'a str,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let mut accounts = self
                .accounts
                .lock()
                .map_err(|_| AuthError::UpstreamUnavailable("account store poisoned".into()))?;
            match accounts.get_mut(&normalize_identifier(employee_name)) {
                Some(entry) => {
                    *entry = password_hash.to_string();
                    Ok(())
                }
                None => Err(AuthError::NotFound),
            }
        })
    }
}
