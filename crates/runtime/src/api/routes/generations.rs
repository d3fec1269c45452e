//! Generation logging, feedback and outcome routes

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::middleware::UserContext;
use crate::api::server::AppState;
use crate::api::types::{
    GenerationListQuery, GenerationResponse, OutcomeRequest, StatsQuery,
};
use crate::generations::{FeedbackInput, GenerationInput, GenerationStats};
use crate::types::{GenerationId, OutcomeType};

/// `POST /api/generations`
pub async fn log_generation(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Json(mut input): Json<GenerationInput>,
) -> Result<(StatusCode, Json<GenerationResponse>), ApiError> {
    if input.prompt_text.is_empty() || input.response_text.is_empty() {
        return Err(ApiError::validation(
            "prompt_text and response_text are required",
        ));
    }
    if input.task_type.trim().is_empty() {
        return Err(ApiError::validation("task_type is required"));
    }
    // JWT callers are pinned to their own identity.
    if let Some(pinned) = context.effective_user_id(Some(&input.user_id)) {
        input.user_id = pinned;
    }

    let generation = state.generations.log(input).await?;
    Ok((StatusCode::CREATED, Json(generation.into())))
}

/// `GET /api/generations`
pub async fn list_generations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GenerationListQuery>,
) -> Result<Json<Vec<GenerationResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);
    let generations = state
        .generations
        .list(query.user_id.as_deref(), limit, offset)
        .await?;
    Ok(Json(generations.into_iter().map(Into::into).collect()))
}

/// `GET /api/generations/stats`
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<GenerationStats>, ApiError> {
    let user_id = context
        .effective_user_id(query.user_id.as_deref())
        .ok_or_else(|| ApiError::validation("userId is required"))?;
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let stats = state.generations.stats(&user_id, days).await?;
    Ok(Json(stats))
}

/// `PATCH /api/feedback/:generationId`
pub async fn attach_feedback(
    State(state): State<Arc<AppState>>,
    Path(generation_id): Path<String>,
    Json(feedback): Json<FeedbackInput>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let id: GenerationId = generation_id
        .parse()
        .map_err(|_| ApiError::validation("invalid generation id"))?;
    let generation = state.generations.attach_feedback(id, feedback).await?;
    Ok(Json(generation.into()))
}

/// `POST /api/feedback/:generationId/outcome`
pub async fn record_outcome(
    State(state): State<Arc<AppState>>,
    Path(generation_id): Path<String>,
    Json(request): Json<OutcomeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id: GenerationId = generation_id
        .parse()
        .map_err(|_| ApiError::validation("invalid generation id"))?;
    let outcome_type: OutcomeType = request
        .outcome_type
        .parse()
        .map_err(|e: String| ApiError::validation(e))?;

    let outcome = state
        .generations
        .record_outcome(id, outcome_type, request.outcome_value)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "outcomeId": outcome.id.to_string(),
            "generationId": outcome.generation_id.to_string(),
            "outcomeType": outcome.outcome_type.to_string(),
            "outcomeValue": outcome.outcome_value,
        })),
    ))
}
