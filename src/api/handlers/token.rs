use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use super::{audit, error_response, source_ip, BrokerState};
use crate::auth::accounts::verify_password;
use crate::auth::permissions::PermissionResolver;
use crate::token::{AdminScope, ACCESS_TOKEN_TTL_SECONDS};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenExchange {
    code: String,
    app_id: String,
    client_secret: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
}

#[utoipa::path(
    post,
    path= "/v1/auth/token",
    responses (
        (status = 200, description = "Signed access token", body = [TokenResponse]),
        (status = 400, description = "Code invalid, consumed, expired, or staff gone"),
        (status = 401, description = "Client authentication failed"),
    ),
    tag= "auth"
)]
#[instrument(skip(state, payload))]
pub async fn token(
    state: Extension<Arc<BrokerState>>,
    payload: Option<Json<TokenExchange>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    };

    // Client authentication first: a caller that cannot prove it is the
    // registered app learns nothing about the code.
    let app = match state.registry.find(&request.app_id) {
        Ok(Some(app)) => app,
        Ok(None) => {
            warn!(app_id = request.app_id, "Token exchange: unknown client");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_client"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Registry lookup failed: {err}");
            return error_response(&err);
        }
    };
    if !app.verify_client_secret(&request.client_secret) {
        warn!(app_id = request.app_id, "Token exchange: bad client secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid_client"})),
        )
            .into_response();
    }

    let code_payload = match state
        .auth_codes
        .consume(&request.code, Some(&request.app_id))
        .await
    {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            warn!(app_id = request.app_id, "Token exchange: invalid grant");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Authorization code consumption failed: {err}");
            return error_response(&err);
        }
    };

    // Re-verify the identity: the staff member may have left between the
    // login and the exchange.
    let staff = match state.directory.find_staff(&code_payload.employee_name).await {
        Ok(Some(staff)) => staff,
        Ok(None) => {
            warn!(
                employee_name = code_payload.employee_name,
                "Token exchange: staff no longer in directory"
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "staff_not_found"})),
            )
                .into_response();
        }
        Err(err) => {
            error!("Directory lookup failed: {err}");
            return error_response(&err);
        }
    };

    // Scopes are resolved at exchange time so a grant or rule change
    // after login is reflected in the token.
    let resolver = PermissionResolver::new(state.grants.as_ref());
    let decision = match resolver.resolve(&staff, &app).await {
        Ok(decision) => decision,
        Err(err) => {
            error!("Permission resolution failed: {err}");
            return error_response(&err);
        }
    };
    if !decision.allowed {
        warn!(
            employee_name = staff.employee_name,
            app_id = app.app_id,
            "Token exchange: access revoked since login"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response();
    }

    match state.issuer.issue(&staff, &app.app_id, decision.scopes) {
        Ok(access_token) => {
            info!(
                employee_name = staff.employee_name,
                app_id = app.app_id,
                "Access token issued"
            );
            (
                StatusCode::OK,
                Json(TokenResponse {
                    access_token,
                    token_type: "bearer".to_string(),
                    expires_in: ACCESS_TOKEN_TTL_SECONDS,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("Token signing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Token signing failed"})),
            )
                .into_response()
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AdminLogin {
    username: String,
    password: String,
}

#[utoipa::path(
    post,
    path= "/v1/admin/token",
    responses (
        (status = 200, description = "Short-lived admin token", body = [TokenResponse]),
        (status = 401, description = "Invalid admin credentials"),
        (status = 429, description = "Too many attempts from this source"),
    ),
    tag= "admin"
)]
#[instrument(skip(state, payload))]
pub async fn admin_token(
    state: Extension<Arc<BrokerState>>,
    headers: HeaderMap,
    payload: Option<Json<AdminLogin>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Missing payload"})),
        )
            .into_response();
    };
    let source = source_ip(&headers);

    state.rate_limiter.record(&source);
    if !state.rate_limiter.check(&source) {
        warn!(source, "Admin login rejected: rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"detail": "Too many attempts, please try again in 5 minutes."})),
        )
            .into_response();
    }

    let credentials_ok = request.username == state.admin.username
        && verify_password(&request.password, state.admin.password_hash.expose_secret());
    if !credentials_ok {
        warn!(source, "Admin login rejected: bad credentials");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid admin credentials"})),
        )
            .into_response();
    }

    match state
        .issuer
        .issue_admin(&request.username, AdminScope::SuperAdmin)
    {
        Ok(access_token) => {
            audit(
                &state,
                &request.username,
                "admin_token",
                "portiko-admin",
                json!({}),
                &source,
            )
            .await;
            info!(admin = request.username, "Admin token issued");
            (
                StatusCode::OK,
                Json(TokenResponse {
                    access_token,
                    token_type: "bearer".to_string(),
                    expires_in: crate::token::ADMIN_TOKEN_TTL_SECONDS,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("Admin token signing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Token signing failed"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::testing::{broker_state, register_jane};
    use crate::auth::onetime::issue_auth_code;
    use crate::token::ADMIN_AUDIENCE;
    use axum::body::to_bytes;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn exchange(code: &str, secret: &str) -> Option<Json<TokenExchange>> {
        Some(Json(TokenExchange {
            code: code.into(),
            app_id: "chat_app".into(),
            client_secret: secret.into(),
        }))
    }

    #[tokio::test]
    async fn exchange_returns_bearer_token_with_twelve_hour_ttl() {
        let state = broker_state("portiko-token-ok");
        register_jane(&state, "hunter22").await;
        let code = issue_auth_code(state.auth_codes.as_ref(), "jane.doe", "chat_app")
            .await
            .unwrap();

        let response = token(Extension(state.clone()), exchange(&code, "s3cret"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["expires_in"], 43_200);

        let claims = state
            .verifier
            .verify(body["access_token"].as_str().unwrap(), Some("chat_app"))
            .unwrap();
        assert_eq!(claims.sub, "jane.doe");
        assert_eq!(claims.dept, "ENG");
    }

    #[tokio::test]
    async fn bad_client_secret_is_invalid_client_and_keeps_the_code() {
        let state = broker_state("portiko-token-client");
        let code = issue_auth_code(state.auth_codes.as_ref(), "jane.doe", "chat_app")
            .await
            .unwrap();

        let response = token(Extension(state.clone()), exchange(&code, "wrong"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await, json!({"error": "invalid_client"}));

        // Client auth failed before consumption; the code is still live.
        assert!(state.auth_codes.peek(&code).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replayed_code_is_invalid_grant() {
        let state = broker_state("portiko-token-replay");
        let code = issue_auth_code(state.auth_codes.as_ref(), "jane.doe", "chat_app")
            .await
            .unwrap();

        let first = token(Extension(state.clone()), exchange(&code, "s3cret"))
            .await
            .into_response();
        assert_eq!(first.status(), StatusCode::OK);

        let replay = token(Extension(state), exchange(&code, "s3cret"))
            .await
            .into_response();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(replay).await, json!({"error": "invalid_grant"}));
    }

    #[tokio::test]
    async fn departed_staff_is_staff_not_found() {
        use crate::api::handlers::testing::broker_state_with;

        let state = broker_state_with("portiko-token-departed", vec![]);
        let code = issue_auth_code(state.auth_codes.as_ref(), "jane.doe", "chat_app")
            .await
            .unwrap();

        let response = token(Extension(state), exchange(&code, "s3cret"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "staff_not_found"}));
    }

    #[tokio::test]
    async fn admin_login_issues_admin_audience_token() {
        let state = broker_state("portiko-token-admin");
        let response = admin_token(
            Extension(state.clone()),
            HeaderMap::new(),
            Some(Json(AdminLogin {
                username: "root.admin".into(),
                password: "admin-pass".into(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let claims = state
            .verifier
            .verify(body["access_token"].as_str().unwrap(), Some(ADMIN_AUDIENCE))
            .unwrap();
        assert_eq!(claims.sub, "root.admin");
        assert!(claims.scopes.iter().any(|s| s == "super_admin"));

        let wrong = admin_token(
            Extension(state),
            HeaderMap::new(),
            Some(Json(AdminLogin {
                username: "root.admin".into(),
                password: "wrong".into(),
            })),
        )
        .await
        .into_response();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }
}
