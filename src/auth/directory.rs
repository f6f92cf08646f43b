//! Read-only lookup against the external staff directory.
//!
//! The directory is the source of truth for who is currently employed.
//! Lookups are never cached: a record fetched during a previous login must
//! not let a terminated employee keep authenticating. A lookup failure is an
//! upstream error, never "not found".

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info_span, Instrument};
use utoipa::ToSchema;

use super::error::AuthError;
use super::BoxFuture;

/// One entry of the staff directory. Owned entirely by the directory;
/// this system never creates, mutates, or deletes records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StaffRecord {
    pub employee_name: String,
    pub name: String,
    pub dept_code: String,
    pub level: i32,
    /// Phone extension, when listed.
    #[serde(default)]
    pub ext: Option<String>,
}

/// Normalize an identifier before every lookup, grant, revoke, or store key.
#[must_use]
pub fn normalize_identifier(name: &str) -> String {
    name.trim().to_lowercase()
}

pub trait Directory: Send + Sync {
    /// Look up a normalized identifier. `Ok(None)` means the directory is
    /// reachable and the identifier does not exist.
    fn find_staff<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<StaffRecord>, AuthError>>;
}

/// Directory backed by a read-only database schema.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Directory for PgDirectory {
    fn find_staff<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<StaffRecord>, AuthError>> {
        Box::pin(async move {
            let employee_name = normalize_identifier(employee_name);
            let query = "SELECT staff_id, name, dept_code, level, ext FROM staff WHERE staff_id = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(&employee_name)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            Ok(Some(StaffRecord {
                employee_name: row.try_get("staff_id")?,
                name: row.try_get("name")?,
                dept_code: row.try_get("dept_code")?,
                level: row.try_get("level")?,
                ext: row.try_get("ext")?,
            }))
        })
    }
}

/// Map-backed directory for single-process deployments and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    staff: std::collections::HashMap<String, StaffRecord>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = StaffRecord>) -> Self {
        Self {
            staff: records
                .into_iter()
                .map(|record| (normalize_identifier(&record.employee_name), record))
                .collect(),
        }
    }
}

impl Directory for MemoryDirectory {
    fn find_staff<'a>(
        &'a self,
        employee_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<StaffRecord>, AuthError>> {
        Box::pin(async move {
            Ok(self
                .staff
                .get(&normalize_identifier(employee_name))
                .cloned())
        })
    }
}
