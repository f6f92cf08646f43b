use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
    Extension, Router,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::auth::accounts::PgAccountStore;
use crate::auth::directory::PgDirectory;
use crate::auth::onetime::{
    spawn_sweeper, AuthCodePayload, PgTokenStore, RegistrationPayload, TokenStore, SWEEP_INTERVAL,
};
use crate::auth::permissions::PgGrantStore;
use crate::auth::rate_limit::MemoryRateLimiter;
use crate::notify::WebhookNotifier;
use crate::registry::AppRegistry;
use crate::token::{TokenIssuer, TokenVerifier};

pub mod handlers;
mod openapi;

pub use handlers::{AdminCredentials, BrokerState};
pub use openapi::openapi;

/// Everything `portiko start` resolved from flags and environment.
pub struct ServerConfig {
    pub port: u16,
    /// Broker database (accounts, tokens, grants, audit).
    pub dsn: String,
    /// Read-only staff directory database.
    pub directory_dsn: String,
    pub registry_path: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub webhook_url: String,
    pub admin_user: String,
    pub admin_password_hash: SecretString,
}

/// Build the application router over the shared state.
#[must_use]
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::openapi()) }),
        )
        .route("/v1/auth/login", post(handlers::login::login))
        .route(
            "/v1/auth/register",
            get(handlers::register::registration_context).post(handlers::register::register),
        )
        .route(
            "/v1/auth/register-request",
            post(handlers::register::register_request),
        )
        .route("/v1/auth/token", post(handlers::token::token))
        .route(
            "/v1/auth/password/change",
            post(handlers::password::change),
        )
        .route(
            "/v1/auth/password/forgot",
            post(handlers::password::forgot),
        )
        .route("/v1/admin/token", post(handlers::token::admin_token))
        .route(
            "/v1/admin/grants",
            post(handlers::grants::grant)
                .get(handlers::grants::list)
                .delete(handlers::grants::revoke),
        )
        .route(
            "/v1/admin/registration-link",
            post(handlers::grants::registration_link),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to broker database")?;

    // The directory is owned elsewhere; a small read-only pool is enough.
    let directory_pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.directory_dsn)
        .await
        .context("Failed to connect to staff directory")?;

    let issuer = TokenIssuer::from_pem_file(&config.private_key_path)
        .context("Failed to load signing key")?;
    let verifier = TokenVerifier::from_pem_file(&config.public_key_path)
        .context("Failed to load verification key")?;
    let registry =
        AppRegistry::open(&config.registry_path).context("Failed to load app registry")?;
    let notifier =
        Arc::new(WebhookNotifier::new(config.webhook_url).context("Failed to build notifier")?);

    let registration_tokens: Arc<dyn TokenStore<RegistrationPayload>> =
        Arc::new(PgTokenStore::new(pool.clone()));
    let auth_codes: Arc<dyn TokenStore<AuthCodePayload>> =
        Arc::new(PgTokenStore::new(pool.clone()));
    spawn_sweeper(Arc::clone(&registration_tokens), SWEEP_INTERVAL);
    spawn_sweeper(Arc::clone(&auth_codes), SWEEP_INTERVAL);

    let state = Arc::new(BrokerState {
        directory: Arc::new(PgDirectory::new(directory_pool)),
        accounts: Arc::new(PgAccountStore::new(pool.clone())),
        rate_limiter: Arc::new(MemoryRateLimiter::default()),
        registration_tokens,
        auth_codes,
        grants: Arc::new(PgGrantStore::new(pool.clone())),
        registry,
        issuer,
        verifier,
        notifier,
        pool: Some(pool),
        admin: AdminCredentials {
            username: config.admin_user,
            password_hash: config.admin_password_hash,
        },
    });

    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
