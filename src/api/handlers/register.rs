use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, instrument, warn};
use utoipa::ToSchema;

use super::{error_response, BrokerState};
use crate::auth::accounts::{register_account, MIN_PASSWORD_LENGTH};
use crate::auth::error::AuthError;
use crate::auth::onetime::RegistrationPayload;

#[derive(ToSchema, Deserialize, Debug)]
pub struct RegistrationQuery {
    token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegistrationContext {
    employee_name: String,
    app_id: String,
    app_name: String,
}

#[utoipa::path(
    get,
    path= "/v1/auth/register",
    params(("token" = String, Query, description = "Registration token")),
    responses (
        (status = 200, description = "Token is valid, registration may proceed", body = [RegistrationContext]),
        (status = 401, description = "Token is unknown or expired"),
    ),
    tag= "register"
)]
pub async fn registration_context(
    state: Extension<Arc<BrokerState>>,
    query: Query<RegistrationQuery>,
) -> impl IntoResponse {
    let payload = match state.registration_tokens.peek(&query.token).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return error_response(&AuthError::Expired),
        Err(err) => {
            error!("Registration token lookup failed: {err}");
            return error_response(&err);
        }
    };

    let app_name = match state.registry.find(&payload.app_id) {
        Ok(Some(app)) => app.name,
        Ok(None) | Err(_) => payload.app_id.clone(),
    };

    (
        StatusCode::OK,
        Json(RegistrationContext {
            employee_name: payload.employee_name,
            app_id: payload.app_id,
            app_name,
        }),
    )
        .into_response()
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    token: String,
    /// Phone extension as listed in the staff directory.
    ext: String,
    dept_code: String,
}

#[utoipa::path(
    post,
    path= "/v1/auth/register-request",
    responses (
        (status = 200, description = "Identity verified, admins notified"),
        (status = 400, description = "Directory details do not match"),
        (status = 401, description = "Token is unknown or expired"),
        (status = 503, description = "Admin notification could not be delivered"),
    ),
    tag= "register"
)]
#[instrument(skip(state, payload))]
pub async fn register_request(
    state: Extension<Arc<BrokerState>>,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    let token_payload = match state.registration_tokens.peek(&request.token).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return error_response(&AuthError::Expired),
        Err(err) => {
            error!("Registration token lookup failed: {err}");
            return error_response(&err);
        }
    };

    // The applicant proves they are the directory person by repeating
    // details only visible inside the company.
    let staff = match state
        .directory
        .find_staff(&token_payload.employee_name)
        .await
    {
        Ok(Some(staff)) => staff,
        Ok(None) => {
            warn!(
                employee_name = token_payload.employee_name,
                "Registration request for identity no longer in directory"
            );
            return error_response(&AuthError::NotFound);
        }
        Err(err) => {
            error!("Directory lookup failed: {err}");
            return error_response(&err);
        }
    };
    let ext_matches = staff
        .ext
        .as_deref()
        .is_some_and(|ext| ext == request.ext.trim());
    if !ext_matches || staff.dept_code != request.dept_code.trim() {
        warn!(
            employee_name = staff.employee_name,
            "Registration request rejected: directory details mismatch"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Directory details do not match"})),
        )
            .into_response();
    }

    let app_name = match state.registry.find(&token_payload.app_id) {
        Ok(Some(app)) => app.name,
        Ok(None) | Err(_) => token_payload.app_id.clone(),
    };
    match state.notifier.registration_request(&staff, &app_name).await {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"detail": "Admins could not be notified, please try again"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Admin notification failed: {err}");
            return error_response(&err);
        }
    }

    // The token stays alive: the same link carries the applicant through
    // password setup, and only account creation invalidates it.
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "detail": "Your request was sent to the administrators"})),
    )
        .into_response()
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterFinish {
    token: String,
    password: String,
    confirm_password: String,
}

#[utoipa::path(
    post,
    path= "/v1/auth/register",
    responses (
        (status = 201, description = "Account created"),
        (status = 400, description = "Password policy violation"),
        (status = 401, description = "Token is unknown or expired"),
        (status = 409, description = "Account already exists"),
    ),
    tag= "register"
)]
#[instrument(skip(state, payload))]
pub async fn register(
    state: Extension<Arc<BrokerState>>,
    payload: Option<Json<RegisterFinish>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };

    let token_payload: RegistrationPayload =
        match state.registration_tokens.peek(&request.token).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return error_response(&AuthError::Expired),
            Err(err) => {
                error!("Registration token lookup failed: {err}");
                return error_response(&err);
            }
        };

    if request.password != request.confirm_password {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Passwords do not match"})),
        )
            .into_response();
    }
    if request.password.len() < MIN_PASSWORD_LENGTH {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": format!("Password must be at least {MIN_PASSWORD_LENGTH} characters")})),
        )
            .into_response();
    }

    match register_account(
        state.accounts.as_ref(),
        &token_payload.employee_name,
        &request.password,
    )
    .await
    {
        Ok(()) => {}
        Err(AuthError::InvalidCredential) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"detail": "Account already exists"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Account creation failed: {err}");
            return error_response(&err);
        }
    }

    if let Err(err) = state.registration_tokens.invalidate(&request.token).await {
        error!("Registration token invalidation failed: {err}");
    }

    (
        StatusCode::CREATED,
        Json(json!({"status": "ok", "detail": "Account created, you can now sign in"})),
    )
        .into_response()
}
