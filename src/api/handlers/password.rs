use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use super::{bearer_token, error_response, source_ip, BrokerState};
use crate::auth::accounts::{change_password, MIN_PASSWORD_LENGTH};
use crate::auth::error::AuthError;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordChange {
    old_password: String,
    new_password: String,
}

#[utoipa::path(
    post,
    path= "/v1/auth/password/change",
    responses (
        (status = 200, description = "Password updated"),
        (status = 400, description = "Policy violation or old password reuse"),
        (status = 401, description = "Missing/invalid bearer token or wrong old password"),
    ),
    tag= "auth"
)]
#[instrument(skip(state, payload))]
pub async fn change(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<PasswordChange>>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Missing bearer token"})),
        )
            .into_response();
    };
    // Any app-audience token proves the holder's identity; the subject is
    // what matters here.
    let claims = match state.verifier.verify(token, None) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("Password change rejected: {err}");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Invalid token"})),
            )
                .into_response();
        }
    };
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    if request.new_password == request.old_password {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "New password must differ from the old one"})),
        )
            .into_response();
    }
    if request.new_password.len() < MIN_PASSWORD_LENGTH {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": format!("Password must be at least {MIN_PASSWORD_LENGTH} characters")})),
        )
            .into_response();
    }

    match change_password(
        state.accounts.as_ref(),
        &claims.sub,
        &request.old_password,
        &request.new_password,
    )
    .await
    {
        Ok(()) => {
            info!(employee_name = claims.sub, "Password changed");
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Err(err @ (AuthError::InvalidCredential | AuthError::NotFound)) => {
            warn!(employee_name = claims.sub, "Password change rejected");
            error_response(&err)
        }
        Err(err) => {
            error!("Password change failed: {err}");
            error_response(&err)
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ForgotPassword {
    employee_name: String,
}

#[utoipa::path(
    post,
    path= "/v1/auth/password/forgot",
    responses (
        (status = 200, description = "Request accepted; admins notified when the identity exists"),
        (status = 429, description = "Too many attempts from this source"),
        (status = 503, description = "Admin notification could not be delivered"),
    ),
    tag= "auth"
)]
#[instrument(skip(state, payload))]
pub async fn forgot(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<ForgotPassword>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };
    let source = source_ip(&headers);

    // Same sliding window as logins; this endpoint is also a probe target.
    state.rate_limiter.record(&source);
    if !state.rate_limiter.check(&source) {
        warn!(source, "Forgot-password rejected: rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"detail": "Too many attempts, please try again in 5 minutes."})),
        )
            .into_response();
    }

    let accepted = (
        StatusCode::OK,
        Json(json!({"status": "ok", "detail": "If the account exists, administrators were notified"})),
    );

    let staff = match state.directory.find_staff(&request.employee_name).await {
        Ok(Some(staff)) => staff,
        // Identical response for unknown identifiers; no enumeration.
        Ok(None) => {
            warn!(
                employee_name = request.employee_name,
                source, "Forgot-password for unknown identifier"
            );
            return accepted.into_response();
        }
        Err(err) => {
            error!("Directory lookup failed: {err}");
            return error_response(&err);
        }
    };

    match state.notifier.forgot_password(&staff).await {
        Ok(true) => {
            info!(employee_name = staff.employee_name, "Admins notified of password reset");
            accepted.into_response()
        }
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "Admins could not be notified, please try again"})),
        )
            .into_response(),
        Err(err) => {
            error!("Admin notification failed: {err}");
            error_response(&err)
        }
    }
}
