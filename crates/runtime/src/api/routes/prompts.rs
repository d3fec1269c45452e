//! Prompt management routes

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::middleware::UserContext;
use crate::api::server::AppState;
use crate::api::types::{
    ActivePromptResponse, CreatePromptRequest, EvalScoreRequest, PromoteResponse,
    PromptVersionResponse, TrafficRequest,
};
use crate::types::PromptVersionId;

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// `GET /api/prompts/:name/active`
pub async fn get_active(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Path(name): Path<String>,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<ActivePromptResponse>, ApiError> {
    let user_id = context
        .effective_user_id(query.user_id.as_deref())
        .unwrap_or_else(|| "anonymous".to_string());

    let selected = state.prompts.get_active(&name, &user_id).await?;
    Ok(Json(ActivePromptResponse {
        version: selected.version.into(),
        selection_source: format!("{:?}", selected.source).to_lowercase(),
    }))
}

/// `GET /api/prompts/:name/versions`
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<PromptVersionResponse>>, ApiError> {
    let versions = state.prompts.versions(&name).await?;
    Ok(Json(versions.into_iter().map(Into::into).collect()))
}

/// `POST /api/prompts`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreatePromptRequest>,
) -> Result<(StatusCode, Json<PromptVersionResponse>), ApiError> {
    for (field, value) in [
        ("prompt_name", &request.prompt_name),
        ("content", &request.content),
        ("author", &request.author),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::validation(format!("{field} is required")));
        }
    }

    let version = state
        .prompts
        .create(&request.prompt_name, &request.content, &request.author)
        .await?;
    Ok((StatusCode::CREATED, Json(version.into())))
}

/// `PATCH /api/prompts/:id/traffic`
pub async fn set_traffic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TrafficRequest>,
) -> Result<Json<PromptVersionResponse>, ApiError> {
    let id: PromptVersionId = id
        .parse()
        .map_err(|_| ApiError::validation("invalid prompt version id"))?;
    let version = state.prompts.set_traffic(id, request.active_pct).await?;
    Ok(Json(version.into()))
}

/// `PATCH /api/prompts/:id/eval`
pub async fn set_eval_score(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<EvalScoreRequest>,
) -> Result<StatusCode, ApiError> {
    let id: PromptVersionId = id
        .parse()
        .map_err(|_| ApiError::validation("invalid prompt version id"))?;
    state.prompts.set_eval_score(id, request.eval_score).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub version: String,
}

/// `POST /api/prompts/:name/promote`: advance one version along the ladder.
pub async fn promote(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<PromoteRequest>,
) -> Result<Json<PromoteResponse>, ApiError> {
    let versions = state.prompts.versions(&name).await?;
    let candidate = versions
        .into_iter()
        .find(|v| v.version == request.version)
        .ok_or_else(|| {
            ApiError::not_found(format!("version {} of prompt {name}", request.version))
        })?;

    let receipt = state.prompts.promote(candidate.id).await?;
    Ok(Json(PromoteResponse {
        previous_pct: receipt.previous_pct,
        new_pct: receipt.new_pct,
        next_step: receipt.next_step,
    }))
}
