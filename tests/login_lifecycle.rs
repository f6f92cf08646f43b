//! End-to-end lifecycle through the HTTP router with in-memory stores:
//! first login forces registration, the one-time registration token
//! drives identity proof and password setup, and the authorization code
//! is exchanged exactly once for a signed access token.

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use portiko::api::handlers::{AdminCredentials, BrokerState};
use portiko::api::router;
use portiko::auth::accounts::MemoryAccountStore;
use portiko::auth::directory::{MemoryDirectory, StaffRecord};
use portiko::auth::onetime::MemoryTokenStore;
use portiko::auth::permissions::MemoryGrantStore;
use portiko::auth::rate_limit::NoopRateLimiter;
use portiko::notify::RecordingNotifier;
use portiko::registry::AppRegistry;
use portiko::token::{TokenIssuer, TokenVerifier, ACCESS_TOKEN_TTL_SECONDS};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt;

const PRIVATE_KEY: &str = include_str!("fixtures/rsa_private.pem");
const PUBLIC_KEY: &str = include_str!("fixtures/rsa_public.pem");

const PASSWORD: &str = "correct horse battery";

fn registry_file() -> Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join("portiko-it-lifecycle");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("apps.json");
    let secret_hash = bcrypt::hash("s3cret", 4)?;
    let body = json!([{
        "app_id": "chat_app",
        "name": "Chat",
        "client_secret_hash": secret_hash,
        "redirect_uri": "https://chat.internal/callback",
        "allowed_depts": ["ENG"],
        "min_level": 2,
    }]);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(body.to_string().as_bytes())?;
    Ok(path)
}

fn app() -> Result<(Router, TokenVerifier)> {
    let state = Arc::new(BrokerState {
        directory: Arc::new(MemoryDirectory::new([StaffRecord {
            employee_name: "jane.doe".into(),
            name: "Jane Doe".into(),
            dept_code: "ENG".into(),
            level: 2,
            ext: Some("4821".into()),
        }])),
        accounts: Arc::new(MemoryAccountStore::default()),
        rate_limiter: Arc::new(NoopRateLimiter),
        registration_tokens: Arc::new(MemoryTokenStore::new()),
        auth_codes: Arc::new(MemoryTokenStore::new()),
        grants: Arc::new(MemoryGrantStore::new()),
        registry: AppRegistry::open(registry_file()?)?,
        issuer: TokenIssuer::from_rsa_pem(PRIVATE_KEY.as_bytes())?,
        verifier: TokenVerifier::from_rsa_pem(PUBLIC_KEY.as_bytes())?,
        notifier: Arc::new(RecordingNotifier::default()),
        pool: None,
        admin: AdminCredentials {
            username: "root.admin".into(),
            password_hash: SecretString::from(bcrypt::hash("admin-pass", 4)?),
        },
    });
    let verifier = TokenVerifier::from_rsa_pem(PUBLIC_KEY.as_bytes())?;
    Ok((router(state), verifier))
}

async fn post_json(app: &Router, uri: &str, body: Value) -> Result<Response> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?;
    app.clone()
        .oneshot(request)
        .await
        .context("request failed")
}

async fn get(app: &Router, uri: &str) -> Result<Response> {
    let request = Request::builder().uri(uri).body(Body::empty())?;
    app.clone()
        .oneshot(request)
        .await
        .context("request failed")
}

async fn json_body(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    serde_json::from_slice(&bytes).context("response body was not JSON")
}

#[tokio::test]
async fn first_login_registration_and_token_exchange() -> Result<()> {
    let (app, verifier) = app()?;

    let login = json!({
        "employee_name": "Jane.Doe",
        "password": PASSWORD,
        "app_id": "chat_app",
        "redirect_uri": "https://chat.internal/callback",
    });

    // No local account yet: the broker asks for registration instead of
    // rejecting the credentials.
    let response = post_json(&app, "/v1/auth/login", login.clone()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "needs_registration");
    let token = body["registration_token"]
        .as_str()
        .context("missing registration token")?
        .to_string();

    // The token resolves to a registration context for the UI.
    let response = get(&app, &format!("/v1/auth/register?token={token}")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let context = json_body(response).await?;
    assert_eq!(context["employee_name"], "jane.doe");
    assert_eq!(context["app_name"], "Chat");

    // Identity proof against the directory, then password setup.
    let response = post_json(
        &app,
        "/v1/auth/register-request",
        json!({"token": token, "ext": "4821", "dept_code": "ENG"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post_json(
        &app,
        "/v1/auth/register",
        json!({"token": token, "password": PASSWORD, "confirm_password": PASSWORD}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    // The registration token is single-use.
    let response = get(&app, &format!("/v1/auth/register?token={token}")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Second login succeeds and yields an authorization code.
    let response = post_json(&app, "/v1/auth/login", login).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["redirect_uri"], "https://chat.internal/callback");
    let code = body["code"]
        .as_str()
        .context("missing authorization code")?
        .to_string();

    // Server-to-server exchange for the signed access token.
    let exchange = json!({
        "code": code,
        "app_id": "chat_app",
        "client_secret": "s3cret",
    });
    let response = post_json(&app, "/v1/auth/token", exchange.clone()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], ACCESS_TOKEN_TTL_SECONDS);

    let access_token = body["access_token"]
        .as_str()
        .context("missing access token")?;
    let claims = verifier.verify(access_token, Some("chat_app"))?;
    assert_eq!(claims.sub, "jane.doe");
    assert_eq!(claims.name, "Jane Doe");
    assert_eq!(claims.dept, "ENG");
    assert_eq!(claims.scopes, vec!["read", "write"]);
    assert!(claims.admin_scope().is_none());

    // The code was consumed by the first exchange.
    let response = post_json(&app, "/v1/auth/token", exchange).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await?;
    assert_eq!(body["error"], "invalid_grant");

    Ok(())
}

#[tokio::test]
async fn wrong_client_secret_never_reaches_the_code() -> Result<()> {
    let (app, _) = app()?;

    let response = post_json(
        &app,
        "/v1/auth/token",
        json!({"code": "whatever", "app_id": "chat_app", "client_secret": "nope"}),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["error"], "invalid_client");
    Ok(())
}

#[tokio::test]
async fn openapi_document_is_served() -> Result<()> {
    let (app, _) = app()?;

    let response = get(&app, "/openapi.json").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert!(body["openapi"].as_str().is_some());
    assert!(body["paths"]["/v1/auth/token"].is_object());
    Ok(())
}
