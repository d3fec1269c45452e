//! Cost report routes

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::api::types::CostsQuery;

/// `GET /api/costs`: cost view by default, observability view on demand.
pub async fn get_costs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CostsQuery>,
) -> Result<Response, ApiError> {
    match query.view.as_deref() {
        Some("observability") => Ok(Json(state.costs.observability_report()).into_response()),
        None | Some("cost") => Ok(Json(state.costs.cost_report()).into_response()),
        Some(other) => Err(ApiError::validation(format!(
            "unknown view {other:?}; expected \"cost\" or \"observability\""
        ))),
    }
}

/// `POST /api/costs/reset`: admin tier.
pub async fn reset_costs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.costs.reset();
    tracing::info!("cost ledger reset");
    Json(serde_json::json!({ "reset": true }))
}
