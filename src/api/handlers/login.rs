use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use utoipa::ToSchema;

use super::{error_response, source_ip, BrokerState};
use crate::auth::authenticator::{Authenticator, Decision};
use crate::auth::error::AuthError;
use crate::auth::onetime::{
    issue_auth_code, issue_registration_token, REGISTRATION_TOKEN_TTL,
};
use crate::auth::permissions::PermissionResolver;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    employee_name: String,
    password: String,
    app_id: String,
    redirect_uri: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginOk {
    status: String,
    code: String,
    redirect_uri: String,
}

#[utoipa::path(
    post,
    path= "/v1/auth/login",
    responses (
        (status = 200, description = "Authorization code issued, or registration required", body = [LoginOk]),
        (status = 400, description = "Unknown application or redirect URI mismatch"),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Access rules deny this application"),
        (status = 429, description = "Too many attempts from this source"),
    ),
    tag= "auth"
)]
#[instrument(skip(state, payload))]
pub async fn login(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };
    let source = source_ip(&headers);

    // Every attempt counts against the window, including probes with a
    // bad application id, and before any bcrypt work.
    state.rate_limiter.record(&source);
    if !state.rate_limiter.check(&source) {
        warn!(source, "Login rejected: rate limited");
        return error_response(&AuthError::RateLimited);
    }

    let app = match state.registry.find(&request.app_id) {
        Ok(Some(app)) => app,
        Ok(None) => {
            warn!(app_id = request.app_id, "Login rejected: unknown application");
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
    if app.redirect_uri != request.redirect_uri {
        warn!(
            app_id = request.app_id,
            "Login rejected: redirect URI mismatch"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Redirect URI mismatch"})),
        )
            .into_response();
    }

    let authenticator = Authenticator::new(state.directory.as_ref(), state.accounts.as_ref());
    let decision = match authenticator
        .login(&request.employee_name, &request.password, &source)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            error!("Login attempt failed: {err}");
            return error_response(&err);
        }
    };

    let staff = match decision {
        Decision::Rejected(err) => return error_response(&err),
        Decision::NeedsRegistration(staff) => {
            let token = match issue_registration_token(
                state.registration_tokens.as_ref(),
                &staff.employee_name,
                &app.app_id,
                &request.redirect_uri,
                REGISTRATION_TOKEN_TTL,
            )
            .await
            {
                Ok(token) => token,
                Err(err) => {
                    error!("Registration token issuance failed: {err}");
                    return error_response(&err);
                }
            };
            debug!(employee_name = staff.employee_name, "Registration required");
            return (
                StatusCode::OK,
                Json(json!({
                    "status": "needs_registration",
                    "registration_token": token,
                })),
            )
                .into_response();
        }
        Decision::Accepted(staff) => staff,
    };

    let resolver = PermissionResolver::new(state.grants.as_ref());
    match resolver.resolve(&staff, &app).await {
        Ok(decision) if decision.allowed => {}
        Ok(decision) => {
            let reason = decision.reason.unwrap_or_else(|| "Access denied".to_string());
            warn!(
                employee_name = staff.employee_name,
                app_id = app.app_id,
                reason,
                "Login rejected: access rules"
            );
            return (StatusCode::FORBIDDEN, Json(json!({"detail": reason}))).into_response();
        }
        Err(err) => {
            error!("Permission resolution failed: {err}");
            return error_response(&err);
        }
    }

    match issue_auth_code(state.auth_codes.as_ref(), &staff.employee_name, &app.app_id).await {
        Ok(code) => (
            StatusCode::OK,
            Json(LoginOk {
                status: "ok".to_string(),
                code,
                redirect_uri: request.redirect_uri,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Authorization code issuance failed: {err}");
            error_response(&err)
        }
    }
}
