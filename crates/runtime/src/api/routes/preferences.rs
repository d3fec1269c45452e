//! User preference and few-shot routes

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::api::types::{
    CreateFewShotRequest, FewShotQuery, PreferenceResponse, SetPreferenceRequest,
};
use crate::preferences::InferenceReport;
use crate::types::{CuratedBy, FewShotEntry, PreferenceSource, UserPreference};

/// `GET /api/preferences/:userId`
pub async fn list_preferences(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<PreferenceResponse>>, ApiError> {
    let preferences = state.store.list_preferences(&user_id).await
        .map_err(crate::types::RuntimeError::from)?;
    Ok(Json(preferences.into_iter().map(Into::into).collect()))
}

/// `GET /api/preferences/:userId/:key`
pub async fn get_preference(
    State(state): State<Arc<AppState>>,
    Path((user_id, key)): Path<(String, String)>,
) -> Result<Json<PreferenceResponse>, ApiError> {
    let preference = state
        .store
        .get_preference(&user_id, &key)
        .await
        .map_err(crate::types::RuntimeError::from)?
        .ok_or_else(|| ApiError::not_found(format!("preference {key} for {user_id}")))?;
    Ok(Json(preference.into()))
}

/// `POST /api/preferences/:userId`: explicit write, full body.
pub async fn create_preference(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<SetPreferenceRequest>,
) -> Result<(StatusCode, Json<PreferenceResponse>), ApiError> {
    let key = request
        .preference_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::validation("preference_key is required"))?;

    let preference = write_explicit(&state, &user_id, key, request.preference_value).await?;
    Ok((StatusCode::CREATED, Json(preference.into())))
}

/// `PATCH /api/preferences/:userId/:key`: explicit write, keyed path.
pub async fn update_preference(
    State(state): State<Arc<AppState>>,
    Path((user_id, key)): Path<(String, String)>,
    Json(request): Json<SetPreferenceRequest>,
) -> Result<Json<PreferenceResponse>, ApiError> {
    let preference = write_explicit(&state, &user_id, &key, request.preference_value).await?;
    Ok(Json(preference.into()))
}

async fn write_explicit(
    state: &AppState,
    user_id: &str,
    key: &str,
    value: serde_json::Value,
) -> Result<UserPreference, ApiError> {
    let now = Utc::now();
    let preference = UserPreference {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        preference_key: key.to_string(),
        preference_value: value,
        source: PreferenceSource::Explicit,
        confidence: 1.0,
        created_at: now,
        updated_at: now,
    };
    state
        .store
        .upsert_preference(&preference, false)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    Ok(preference)
}

/// `DELETE /api/preferences/:userId/:key`
pub async fn delete_preference(
    State(state): State<Arc<AppState>>,
    Path((user_id, key)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .store
        .delete_preference(&user_id, &key)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "preference {key} for {user_id}"
        )));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// `POST /api/preferences/:userId/infer`
pub async fn infer_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<InferenceReport>, ApiError> {
    let report = state.preferences.infer_for_user(&user_id).await?;
    Ok(Json(report))
}

/// `POST /api/preferences/infer-all`: admin tier.
pub async fn infer_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InferenceReport>>, ApiError> {
    let reports = state.preferences.infer_all().await?;
    Ok(Json(reports))
}

/// `POST /api/fewshot`
pub async fn create_few_shot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateFewShotRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.task_type.trim().is_empty()
        || request.input_text.is_empty()
        || request.output_text.is_empty()
    {
        return Err(ApiError::validation(
            "task_type, input_text and output_text are required",
        ));
    }

    // Auto-curated entries must point at an accepted generation.
    let (curated_by, source_generation_id) = match &request.source_generation_id {
        Some(raw) => {
            let id = raw
                .parse()
                .map_err(|_| ApiError::validation("invalid source_generation_id"))?;
            let generation = state
                .generations
                .get(id)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("generation {raw}")))?;
            if generation.user_feedback != Some(crate::types::UserFeedback::Accepted) {
                return Err(ApiError::validation(
                    "source generation has not been accepted",
                ));
            }
            (CuratedBy::Auto, Some(id))
        }
        None => (CuratedBy::Manual, None),
    };

    let entry = FewShotEntry {
        id: Uuid::new_v4(),
        task_type: request.task_type,
        input_text: request.input_text,
        output_text: request.output_text,
        quality_score: request.quality_score.unwrap_or(0.5),
        source_generation_id,
        curated_by,
        is_active: true,
        metadata: HashMap::new(),
        created_at: Utc::now(),
    };
    state
        .store
        .insert_few_shot(&entry)
        .await
        .map_err(crate::types::RuntimeError::from)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": entry.id.to_string(),
            "taskType": entry.task_type,
            "curatedBy": entry.curated_by.to_string(),
        })),
    ))
}

/// `GET /api/fewshot`
pub async fn list_few_shot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FewShotQuery>,
) -> Result<Json<Vec<FewShotEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let entries = state
        .store
        .list_few_shot(query.task_type.as_deref(), limit)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    Ok(Json(entries))
}
