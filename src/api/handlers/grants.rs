use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use super::{audit, error_response, require_admin, source_ip, BrokerState};
use crate::auth::directory::normalize_identifier;
use crate::auth::onetime::{issue_registration_token, ADMIN_REGISTRATION_TOKEN_TTL};
use crate::auth::permissions::{filter_scopes, PermissionGrant};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct GrantRequest {
    employee_name: String,
    app_id: String,
    scopes: Vec<String>,
}

#[utoipa::path(
    post,
    path= "/v1/admin/grants",
    responses (
        (status = 200, description = "Grant stored", body = [PermissionGrant]),
        (status = 400, description = "Unknown application or identity"),
        (status = 401, description = "Missing or invalid admin token"),
    ),
    tag= "admin"
)]
#[instrument(skip(state, payload))]
pub async fn grant(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<GrantRequest>>,
) -> impl IntoResponse {
    let admin = match require_admin(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    // Granting against an unknown app or identity is almost always a
    // typo; reject instead of storing a dead row.
    match state.registry.find(&request.app_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Unknown application"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Registry lookup failed: {err}");
            return error_response(&err);
        }
    }
    let employee_name = normalize_identifier(&request.employee_name);
    match state.directory.find_staff(&employee_name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Unknown identity"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Directory lookup failed: {err}");
            return error_response(&err);
        }
    }

    let grant = PermissionGrant {
        employee_name,
        app_id: request.app_id.clone(),
        scopes: filter_scopes(&request.scopes),
        granted_by: admin.sub.clone(),
        granted_at: Utc::now(),
    };
    if let Err(err) = state.grants.upsert(grant.clone()).await {
        error!("Grant upsert failed: {err}");
        return error_response(&err);
    }

    let source = source_ip(&headers);
    audit(
        &state,
        &admin.sub,
        "grant",
        &format!("{}/{}", grant.employee_name, grant.app_id),
        json!({"scopes": grant.scopes}),
        &source,
    )
    .await;
    info!(
        admin = admin.sub,
        employee_name = grant.employee_name,
        app_id = grant.app_id,
        "Grant stored"
    );
    (StatusCode::OK, Json(grant)).into_response()
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokeRequest {
    employee_name: String,
    app_id: String,
}

#[utoipa::path(
    delete,
    path= "/v1/admin/grants",
    responses (
        (status = 200, description = "Grant revoked"),
        (status = 404, description = "No grant for this identity and application"),
        (status = 401, description = "Missing or invalid admin token"),
    ),
    tag= "admin"
)]
#[instrument(skip(state, payload))]
pub async fn revoke(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<RevokeRequest>>,
) -> impl IntoResponse {
    let admin = match require_admin(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    let employee_name = normalize_identifier(&request.employee_name);
    let removed = match state.grants.revoke(&employee_name, &request.app_id).await {
        Ok(removed) => removed,
        Err(err) => {
            error!("Grant revoke failed: {err}");
            return error_response(&err);
        }
    };
    if !removed {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "No such grant"})),
        )
            .into_response();
    }

    let source = source_ip(&headers);
    audit(
        &state,
        &admin.sub,
        "revoke",
        &format!("{employee_name}/{}", request.app_id),
        json!({}),
        &source,
    )
    .await;
    info!(
        admin = admin.sub,
        employee_name,
        app_id = request.app_id,
        "Grant revoked"
    );
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct GrantFilter {
    employee_name: Option<String>,
    app_id: Option<String>,
}

#[utoipa::path(
    get,
    path= "/v1/admin/grants",
    params(
        ("employee_name" = Option<String>, Query, description = "Filter by identity"),
        ("app_id" = Option<String>, Query, description = "Filter by application"),
    ),
    responses (
        (status = 200, description = "Matching grants", body = [Vec<PermissionGrant>]),
        (status = 401, description = "Missing or invalid admin token"),
    ),
    tag= "admin"
)]
pub async fn list(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    filter: Query<GrantFilter>,
) -> impl IntoResponse {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state
        .grants
        .list(filter.employee_name.as_deref(), filter.app_id.as_deref())
        .await
    {
        Ok(grants) => (StatusCode::OK, Json(grants)).into_response(),
        Err(err) => {
            error!("Grant listing failed: {err}");
            error_response(&err)
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegistrationLinkRequest {
    employee_name: String,
    app_id: String,
}

#[utoipa::path(
    post,
    path= "/v1/admin/registration-link",
    responses (
        (status = 200, description = "One-day registration token for the applicant"),
        (status = 400, description = "Unknown application or identity"),
        (status = 401, description = "Missing or invalid admin token"),
    ),
    tag= "admin"
)]
#[instrument(skip(state, payload))]
pub async fn registration_link(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<RegistrationLinkRequest>>,
) -> impl IntoResponse {
    let admin = match require_admin(&state, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    let app = match state.registry.find(&request.app_id) {
        Ok(Some(app)) => app,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Unknown application"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Registry lookup failed: {err}");
            return error_response(&err);
        }
    };
    let employee_name = normalize_identifier(&request.employee_name);
    match state.directory.find_staff(&employee_name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(employee_name, "Registration link for unknown identity");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": "Unknown identity"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Directory lookup failed: {err}");
            return error_response(&err);
        }
    }

    let token = match issue_registration_token(
        state.registration_tokens.as_ref(),
        &employee_name,
        &app.app_id,
        &app.redirect_uri,
        ADMIN_REGISTRATION_TOKEN_TTL,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Registration token issuance failed: {err}");
            return error_response(&err);
        }
    };

    let source = source_ip(&headers);
    audit(
        &state,
        &admin.sub,
        "registration_link",
        &format!("{employee_name}/{}", app.app_id),
        json!({}),
        &source,
    )
    .await;
    (
        StatusCode::OK,
        Json(json!({"registration_token": token, "expires_in": ADMIN_REGISTRATION_TOKEN_TTL.num_seconds()})),
    )
        .into_response()
}
