//! Provider adapter routes
//!
//! Every route resolves its capability under the availability policy first:
//! open mode answers `200 {enabled:false}` for unconfigured providers,
//! strict mode answers 503.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::middleware::UserContext;
use crate::api::server::AppState;
use crate::api::types::{
    AddMemoryRequest, DisabledResponse, ExecuteActionRequest, FineTuneLogRequest,
    FineTuneTriggerRequest, GuardrailSummary, MemorySearchQuery, TranscribeResponse,
};
use crate::guardrails::ScanConfig;
use crate::providers::Unavailable;
use crate::types::RuntimeError;

/// Render the unconfigured disposition.
fn unavailable_response(unavailable: Unavailable) -> Response {
    match unavailable {
        Unavailable::Disabled { reason } => (
            StatusCode::OK,
            Json(DisabledResponse {
                enabled: false,
                reason,
            }),
        )
            .into_response(),
        Unavailable::Refused { name, reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": format!("provider {name} is not configured"),
                "code": "provider_unavailable",
                "reason": reason,
            })),
        )
            .into_response(),
    }
}

// ── Memory ────────────────────────────────────────────────────────────

/// `POST /api/memory`
pub async fn add_memory(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Json(request): Json<AddMemoryRequest>,
) -> Result<Response, ApiError> {
    let memory = match state.memory.resolve(state.config.providers.mode, "memory") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    if request.content.trim().is_empty() {
        return Err(ApiError::validation("content is required"));
    }
    let user_id = context
        .effective_user_id(request.user_id.as_deref())
        .ok_or_else(|| ApiError::validation("user_id is required"))?;

    let record = memory
        .add(&user_id, &request.content)
        .await
        .map_err(RuntimeError::from)?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// `GET /api/memory/search`
pub async fn search_memory(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Query(query): Query<MemorySearchQuery>,
) -> Result<Response, ApiError> {
    let memory = match state.memory.resolve(state.config.providers.mode, "memory") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    let q = query
        .q
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::validation("q is required"))?;
    let user_id = context
        .effective_user_id(query.user_id.as_deref())
        .ok_or_else(|| ApiError::validation("userId is required"))?;
    let limit = query.limit.unwrap_or(10).clamp(1, 50);

    let records = memory
        .search(&user_id, q, limit)
        .await
        .map_err(RuntimeError::from)?;
    Ok(Json(records).into_response())
}

/// `GET /api/memory/:userId`
pub async fn get_all_memories(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let memory = match state.memory.resolve(state.config.providers.mode, "memory") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    let records = memory.get_all(&user_id).await.map_err(RuntimeError::from)?;
    Ok(Json(records).into_response())
}

/// `DELETE /api/memory/:id`
pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(memory_id): Path<String>,
) -> Result<Response, ApiError> {
    let memory = match state.memory.resolve(state.config.providers.mode, "memory") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    let deleted = memory
        .delete(&memory_id)
        .await
        .map_err(RuntimeError::from)?;
    if !deleted {
        return Err(ApiError::not_found(format!("memory {memory_id}")));
    }
    Ok(Json(serde_json::json!({ "deleted": true })).into_response())
}

// ── Tool execution ────────────────────────────────────────────────────

/// `GET /api/composio/actions`
pub async fn list_actions(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let tools = match state.tools.resolve(state.config.providers.mode, "composio") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    let actions = tools.list_actions().await.map_err(RuntimeError::from)?;
    Ok(Json(actions).into_response())
}

/// `POST /api/composio/execute`
pub async fn execute_action(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteActionRequest>,
) -> Result<Response, ApiError> {
    let tools = match state.tools.resolve(state.config.providers.mode, "composio") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    if request.action.trim().is_empty() {
        return Err(ApiError::validation("action is required"));
    }
    let result = tools
        .execute(&request.action, request.params)
        .await
        .map_err(RuntimeError::from)?;
    Ok(Json(result).into_response())
}

// ── Fine-tuning ───────────────────────────────────────────────────────

/// `POST /api/openpipe/log`
pub async fn log_fine_tune_calls(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FineTuneLogRequest>,
) -> Result<Response, ApiError> {
    let finetune = match state.finetune.resolve(state.config.providers.mode, "openpipe") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    if request.calls.is_empty() {
        return Err(ApiError::validation("calls must not be empty"));
    }
    let count = finetune
        .log(request.calls)
        .await
        .map_err(RuntimeError::from)?;
    Ok(Json(serde_json::json!({ "logged": count })).into_response())
}

/// `POST /api/openpipe/finetune`
pub async fn trigger_fine_tune(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FineTuneTriggerRequest>,
) -> Result<Response, ApiError> {
    let finetune = match state.finetune.resolve(state.config.providers.mode, "openpipe") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    if request.base_model.trim().is_empty() {
        return Err(ApiError::validation("base_model is required"));
    }
    let status = finetune
        .trigger(&request.base_model)
        .await
        .map_err(RuntimeError::from)?;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

/// `GET /api/openpipe/finetune/:jobId`
pub async fn fine_tune_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let finetune = match state.finetune.resolve(state.config.providers.mode, "openpipe") {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    let status = finetune.status(&job_id).await.map_err(RuntimeError::from)?;
    Ok(Json(status).into_response())
}

// ── Transcription ─────────────────────────────────────────────────────

/// `POST /api/transcribe`: binary audio body; the transcript passes the
/// output guardrails before leaving.
pub async fn transcribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let transcriber = match state
        .transcriber
        .resolve(state.config.providers.mode, "transcription")
    {
        Ok(handle) => handle,
        Err(unavailable) => return Ok(unavailable_response(unavailable)),
    };
    if body.is_empty() {
        return Err(ApiError::validation("empty body"));
    }
    let mime_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/wav");
    if !mime_type.starts_with("audio/") {
        return Err(ApiError::validation(format!(
            "expected an audio content type, got {mime_type}"
        )));
    }

    let text = transcriber
        .transcribe(&body, mime_type)
        .await
        .map_err(RuntimeError::from)?;

    let scan_config = ScanConfig {
        failure_mode: state.config.guardrails.failure_mode,
        ..ScanConfig::default()
    };
    let scan = state.guardrails.scan_output(&text, &scan_config).await;
    if !scan.passed {
        state
            .events
            .emit(
                crate::telemetry::TelemetryEvent::new("guardrail_blocked")
                    .with("route", "/api/transcribe")
                    .with(
                        "categories",
                        scan.findings
                            .iter()
                            .map(|f| f.category.clone())
                            .collect::<Vec<_>>(),
                    ),
            )
            .await;
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "guardrail_blocked",
            "transcript blocked by output guardrails",
        )
        .with_details(serde_json::json!({ "findings": scan.findings })));
    }

    Ok(Json(TranscribeResponse {
        text,
        guardrails: GuardrailSummary {
            passed: scan.passed,
            scanners_run: scan.scanners_run,
            scan_time_ms: scan.scan_time_ms,
        },
    })
    .into_response())
}
