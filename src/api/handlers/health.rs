use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use std::sync::Arc;
use tracing::{error, info_span, Instrument};
use utoipa::ToSchema;

use super::BrokerState;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    name: String,
    version: String,
    database: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Broker database is reachable", body = [Health]),
        (status = 503, description = "Broker database is unreachable", body = [Health])
    ),
    tag= "health"
)]
pub async fn health(state: Extension<Arc<BrokerState>>) -> impl IntoResponse {
    let database = match &state.pool {
        Some(pool) => {
            let acquire_span = info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            );
            match pool.acquire().instrument(acquire_span).await {
                Ok(mut conn) => {
                    let ping_span =
                        info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
                    match conn.ping().instrument(ping_span).await {
                        Ok(()) => Ok(()),
                        Err(error) => {
                            error!("Failed to ping database: {}", error);
                            Err(())
                        }
                    }
                }
                Err(error) => {
                    error!("Failed to acquire database connection: {}", error);
                    Err(())
                }
            }
        }
        None => Ok(()),
    };

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) =
        format!("{}:{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")).parse()
    {
        headers.insert("X-App", value);
    }

    let status = if database.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, headers, Json(health))
}
