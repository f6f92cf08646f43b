//! Access rules and per-user grants.
//!
//! Default access is rule-based: an app admits departments and a minimum
//! staff level, and the staff level maps to a scope set. A per-user grant
//! overrides the rules entirely and carries its own scopes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info, info_span, Instrument};
use utoipa::ToSchema;

use super::directory::StaffRecord;
use super::error::AuthError;
use super::BoxFuture;
use crate::registry::AppRegistration;

/// Fixed scope vocabulary. Anything else submitted in a grant is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
}

impl Scope {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Scopes implied by a staff level. Unknown levels degrade to read-only.
#[must_use]
pub fn level_scopes(level: i32) -> Vec<Scope> {
    match level {
        1 => vec![Scope::Read],
        2 => vec![Scope::Read, Scope::Write],
        3 => vec![Scope::Read, Scope::Write, Scope::Admin],
        _ => vec![Scope::Read],
    }
}

/// Keep only recognized scopes; an empty result falls back to read-only
/// so a grant never produces a token with no scopes at all.
#[must_use]
pub fn filter_scopes<I, S>(requested: I) -> Vec<Scope>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut scopes: Vec<Scope> = requested
        .into_iter()
        .filter_map(|s| Scope::parse(s.as_ref()))
        .collect();
    scopes.sort_unstable();
    scopes.dedup();
    if scopes.is_empty() {
        scopes.push(Scope::Read);
    }
    scopes
}

/// A stored per-user override for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PermissionGrant {
    pub employee_name: String,
    pub app_id: String,
    pub scopes: Vec<Scope>,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

/// Outcome of resolving one staff member against one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub scopes: Vec<Scope>,
}

impl AccessDecision {
    fn allowed(scopes: Vec<Scope>) -> Self {
        Self {
            allowed: true,
            reason: None,
            scopes,
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            scopes: Vec::new(),
        }
    }
}

pub trait GrantStore: Send + Sync {
    fn find<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PermissionGrant>, AuthError>>;

    /// Insert or replace; re-granting keeps a single row with the latest
    /// grantor and timestamp.
    fn upsert<'a>(&'a self, grant: PermissionGrant) -> BoxFuture<'a, Result<(), AuthError>>;

    /// Returns whether a grant existed.
    fn revoke<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>>;

    fn list<'a>(
        &'a self,
        employee_name: Option<&'a str>,
        app_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PermissionGrant>, AuthError>>;
}

#[derive(Debug, Clone)]
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn grant_from_row(row: &sqlx::postgres::PgRow) -> Result<PermissionGrant, AuthError> {
    let scopes: serde_json::Value = row.try_get("scopes")?;
    let scopes: Vec<String> = serde_json::from_value(scopes)
        .map_err(|err| AuthError::UpstreamUnavailable(format!("grant scopes decoding: {err}")))?;
    Ok(PermissionGrant {
        employee_name: row.try_get("employee_name")?,
        app_id: row.try_get("app_id")?,
        scopes: filter_scopes(scopes),
        granted_by: row.try_get("granted_by")?,
        granted_at: row.try_get("granted_at")?,
    })
}

impl GrantStore for PgGrantStore {
    fn find<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PermissionGrant>, AuthError>> {
        Box::pin(async move {
            let query = "SELECT employee_name, app_id, scopes, granted_by, granted_at \
                         FROM user_app_permissions WHERE employee_name = $1 AND app_id = $2";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(employee_name)
                .bind(app_id)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;
            row.as_ref().map(grant_from_row).transpose()
        })
    }

    fn upsert<'a>(&'a self, grant: PermissionGrant) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            let scopes = serde_json::to_value(&grant.scopes).map_err(|err| {
                AuthError::UpstreamUnavailable(format!("grant scopes encoding: {err}"))
            })?;
            let query = "INSERT INTO user_app_permissions \
                         (employee_name, app_id, scopes, granted_by, granted_at) \
                         VALUES ($1, $2, $3, $4, $5) \
                         ON CONFLICT (employee_name, app_id) \
                         DO UPDATE SET scopes = $3, granted_by = $4, granted_at = $5";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(&grant.employee_name)
                .bind(&grant.app_id)
                .bind(&scopes)
                .bind(&grant.granted_by)
                .bind(grant.granted_at)
                .execute(&self.pool)
                .instrument(span)
                .await?;
            info!(
                employee_name = grant.employee_name,
                app_id = grant.app_id,
                granted_by = grant.granted_by,
                "Permission grant stored"
            );
            Ok(())
        })
    }

    fn revoke<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            let query =
                "DELETE FROM user_app_permissions WHERE employee_name = $1 AND app_id = $2";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(employee_name)
                .bind(app_id)
                .execute(&self.pool)
                .instrument(span)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list<'a>(
        &'a self,
        employee_name: Option<&'a str>,
        app_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PermissionGrant>, AuthError>> {
        Box::pin(async move {
            let query = "SELECT employee_name, app_id, scopes, granted_by, granted_at \
                         FROM user_app_permissions \
                         WHERE ($1::TEXT IS NULL OR employee_name = $1) \
                         AND ($2::TEXT IS NULL OR app_id = $2) \
                         ORDER BY granted_at DESC";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let rows = sqlx::query(query)
                .bind(employee_name)
                .bind(app_id)
                .fetch_all(&self.pool)
                .instrument(span)
                .await?;
            rows.iter().map(grant_from_row).collect()
        })
    }
}

/// Map-backed store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    rows: Mutex<HashMap<(String, String), PermissionGrant>>,
}

impl MemoryGrantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), PermissionGrant>>, AuthError>
    {
        self.rows
            .lock()
            .map_err(|_| AuthError::UpstreamUnavailable("grant store poisoned".into()))
    }
}

impl GrantStore for MemoryGrantStore {
    fn find<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PermissionGrant>, AuthError>> {
        Box::pin(async move {
            let rows = self.lock()?;
            Ok(rows
                .get(&(employee_name.to_string(), app_id.to_string()))
                .cloned())
        })
    }

    fn upsert<'a>(&'a self, grant: PermissionGrant) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            self.lock()?.insert(
                (grant.employee_name.clone(), grant.app_id.clone()),
                grant,
            );
            Ok(())
        })
    }

    fn revoke<'a>(
        &'a self,
        employee_name: &'a str,
        app_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>> {
        Box::pin(async move {
            Ok(self
                .lock()?
                .remove(&(employee_name.to_string(), app_id.to_string()))
                .is_some())
        })
    }

    fn list<'a>(
        &'a self,
        employee_name: Option<&'a str>,
        app_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PermissionGrant>, AuthError>> {
        Box::pin(async move {
            let rows = self.lock()?;
            let mut grants: Vec<PermissionGrant> = rows
                .values()
                .filter(|g| employee_name.map_or(true, |e| g.employee_name == e))
                .filter(|g| app_id.map_or(true, |a| g.app_id == a))
                .cloned()
                .collect();
            grants.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
            Ok(grants)
        })
    }
}

/// Rule evaluation with grant override.
pub struct PermissionResolver<'a> {
    grants: &'a dyn GrantStore,
}

impl<'a> PermissionResolver<'a> {
    #[must_use]
    pub const fn new(grants: &'a dyn GrantStore) -> Self {
        Self { grants }
    }

    /// A grant wins unconditionally with its own scopes; otherwise the
    /// app's department and level rules apply.
    pub async fn resolve(
        &self,
        staff: &StaffRecord,
        app: &AppRegistration,
    ) -> Result<AccessDecision, AuthError> {
        if let Some(grant) = self.grants.find(&staff.employee_name, &app.app_id).await? {
            info!(
                employee_name = staff.employee_name,
                app_id = app.app_id,
                "Access allowed by explicit grant"
            );
            return Ok(AccessDecision::allowed(grant.scopes));
        }

        if !app.allowed_depts.is_empty() && !app.allowed_depts.contains(&staff.dept_code) {
            return Ok(AccessDecision::denied(format!(
                "department {} is not admitted to {}",
                staff.dept_code, app.name
            )));
        }
        if staff.level < app.min_level {
            return Ok(AccessDecision::denied(format!(
                "staff level {} is below the minimum {} for {}",
                staff.level, app.min_level, app.name
            )));
        }
        Ok(AccessDecision::allowed(level_scopes(staff.level)))
    }

    /// Apps this staff member can reach, via rules or personal grants.
    pub async fn accessible_apps(
        &self,
        staff: &StaffRecord,
        apps: &[AppRegistration],
    ) -> Result<Vec<String>, AuthError> {
        let mut accessible = Vec::new();
        for app in apps {
            if self.resolve(staff, app).await?.allowed {
                accessible.push(app.app_id.clone());
            }
        }
        accessible.sort_unstable();
        Ok(accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staff(dept_code: &str, level: i32) -> StaffRecord {
        StaffRecord {
            employee_name: "jane.doe".into(),
            name: "Jane Doe".into(),
            dept_code: dept_code.into(),
            level,
            ext: None,
        }
    }

    fn app(allowed_depts: &[&str], min_level: i32) -> AppRegistration {
        AppRegistration {
            app_id: "chat_app".into(),
            name: "Chat".into(),
            client_secret_hash: String::new(),
            redirect_uri: "https://chat.internal/cb".into(),
            allowed_depts: allowed_depts.iter().map(|s| s.to_string()).collect(),
            min_level,
        }
    }

    fn grant(scopes: Vec<Scope>) -> PermissionGrant {
        PermissionGrant {
            employee_name: "jane.doe".into(),
            app_id: "chat_app".into(),
            scopes,
            granted_by: "root.admin".into(),
            granted_at: Utc::now(),
        }
    }

    #[test]
    fn level_scope_map() {
        assert_eq!(level_scopes(1), vec![Scope::Read]);
        assert_eq!(level_scopes(2), vec![Scope::Read, Scope::Write]);
        assert_eq!(level_scopes(3), vec![Scope::Read, Scope::Write, Scope::Admin]);
        assert_eq!(level_scopes(0), vec![Scope::Read]);
        assert_eq!(level_scopes(99), vec![Scope::Read]);
    }

    #[test]
    fn filter_drops_unknown_and_falls_back_to_read() {
        assert_eq!(
            filter_scopes(["write", "bogus", "ADMIN", "write"]),
            vec![Scope::Write, Scope::Admin]
        );
        assert_eq!(filter_scopes(["bogus", "worse"]), vec![Scope::Read]);
        assert_eq!(filter_scopes(Vec::<String>::new()), vec![Scope::Read]);
    }

    #[tokio::test]
    async fn rules_allow_matching_dept_and_level() {
        let store = MemoryGrantStore::new();
        let resolver = PermissionResolver::new(&store);

        let decision = resolver.resolve(&staff("ENG", 2), &app(&["ENG"], 2)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.scopes, vec![Scope::Read, Scope::Write]);
    }

    #[tokio::test]
    async fn rules_deny_wrong_dept_then_wrong_level() {
        let store = MemoryGrantStore::new();
        let resolver = PermissionResolver::new(&store);

        let dept = resolver.resolve(&staff("HR", 3), &app(&["ENG"], 1)).await.unwrap();
        assert!(!dept.allowed);
        assert!(dept.reason.unwrap().contains("department"));

        let level = resolver.resolve(&staff("ENG", 1), &app(&["ENG"], 2)).await.unwrap();
        assert!(!level.allowed);
        assert!(level.reason.unwrap().contains("level"));
    }

    #[tokio::test]
    async fn empty_dept_list_admits_everyone() {
        let store = MemoryGrantStore::new();
        let resolver = PermissionResolver::new(&store);
        let decision = resolver.resolve(&staff("HR", 1), &app(&[], 0)).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn grant_overrides_denying_rules() {
        let store = MemoryGrantStore::new();
        store.upsert(grant(vec![Scope::Read, Scope::Admin])).await.unwrap();
        let resolver = PermissionResolver::new(&store);

        // Level 1 against min_level 3 would be denied without the grant.
        let decision = resolver.resolve(&staff("HR", 1), &app(&["ENG"], 3)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.scopes, vec![Scope::Read, Scope::Admin]);
    }

    #[tokio::test]
    async fn regrant_keeps_single_row_with_latest_grantor() {
        let store = MemoryGrantStore::new();
        store.upsert(grant(vec![Scope::Read])).await.unwrap();
        let mut second = grant(vec![Scope::Read, Scope::Write]);
        second.granted_by = "other.admin".into();
        store.upsert(second).await.unwrap();

        let grants = store.list(Some("jane.doe"), None).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].granted_by, "other.admin");
        assert_eq!(grants[0].scopes, vec![Scope::Read, Scope::Write]);
    }

    #[tokio::test]
    async fn revoke_reports_whether_row_existed() {
        let store = MemoryGrantStore::new();
        store.upsert(grant(vec![Scope::Read])).await.unwrap();
        assert!(store.revoke("jane.doe", "chat_app").await.unwrap());
        assert!(!store.revoke("jane.doe", "chat_app").await.unwrap());
    }

    #[tokio::test]
    async fn accessible_apps_unions_rules_and_grants() {
        let store = MemoryGrantStore::new();
        let mut granted = grant(vec![Scope::Read]);
        granted.app_id = "restricted_app".into();
        store.upsert(granted).await.unwrap();
        let resolver = PermissionResolver::new(&store);

        let mut open = app(&[], 0);
        open.app_id = "open_app".into();
        let mut restricted = app(&["ENG"], 3);
        restricted.app_id = "restricted_app".into();
        let mut closed = app(&["ENG"], 3);
        closed.app_id = "closed_app".into();

        let apps = resolver
            .accessible_apps(&staff("HR", 1), &[open, restricted, closed])
            .await
            .unwrap();
        assert_eq!(apps, vec!["open_app", "restricted_app"]);
    }
}
