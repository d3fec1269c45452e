//! Health endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::api::server::AppState;
use crate::api::types::{HealthResponse, HealthServices};

/// `GET /api/health`: 200 when the primary store answers, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "database health probe failed");
            "error"
        }
    };

    let redis = if state.tokens.configured() {
        "ok"
    } else {
        "unconfigured"
    };
    let litellm = if state.llm.backend() == "litellm" {
        "ok"
    } else {
        "unconfigured"
    };

    let status = if database != "ok" {
        "error"
    } else if redis != "ok" || litellm != "ok" {
        "degraded"
    } else {
        "ok"
    };

    let body = HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        services: HealthServices {
            database: database.to_string(),
            redis: redis.to_string(),
            litellm: litellm.to_string(),
        },
    };

    if database == "ok" {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
