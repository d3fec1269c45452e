//! Document ingestion and embedding search routes

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use std::sync::Arc;
use std::time::Instant;

use crate::api::error::ApiError;
use crate::api::middleware::UserContext;
use crate::api::server::AppState;
use crate::api::types::{
    CreateDocumentRequest, CreateDocumentResponse, DuplicateDocumentResponse, EmbedRequest,
    EmbedResponse, IngestResponse, SearchHitResponse, SearchQuery,
};
use crate::guardrails::ScanConfig;
use crate::ingest::{IngestOutcome, IngestReceipt, IngestRequest, RawInput};
use crate::llm::estimate_tokens;
use crate::types::{BudgetError, ChunkStrategy, RuntimeError, VectorError};
use crate::vector::KnnOptions;

fn caller_user_id(context: &UserContext) -> String {
    context
        .effective_user_id(None)
        .unwrap_or_else(|| "anonymous".to_string())
}

fn receipt_response(receipt: IngestReceipt) -> (StatusCode, Json<CreateDocumentResponse>) {
    let status = if receipt.embeddings_generated {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };
    (
        status,
        Json(CreateDocumentResponse {
            document_id: receipt.document_id.to_string(),
            chunks_created: receipt.chunks_created,
            embeddings_generated: receipt.embeddings_generated,
            embedding_model_id: receipt.embedding_model_id,
            content_hash: receipt.content_hash,
        }),
    )
}

/// `POST /api/documents`
pub async fn create_document(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<Response, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::validation("content is required"));
    }

    let ingest_request = IngestRequest {
        input: RawInput {
            mime_type: request.mime_type.clone(),
            body: request.content.into_bytes(),
            source_url: request.source_url,
            title: request.title,
        },
        user_id: caller_user_id(&context),
        chunk_strategy: request.chunk_strategy,
        model_override: request.model_id,
        task_type: request.task_type,
        valid_until: request.valid_until,
        source_updated_at: request.source_updated_at,
        entity_id_fields: request.entity_id_fields,
    };

    match state.ingest.ingest(ingest_request).await? {
        IngestOutcome::Duplicate { document_id } => Ok((
            StatusCode::OK,
            Json(DuplicateDocumentResponse {
                duplicate: true,
                document_id: document_id.to_string(),
            }),
        )
            .into_response()),
        IngestOutcome::Created(receipt) => Ok(receipt_response(receipt).into_response()),
    }
}

/// `POST /api/documents/upload`: binary body, admin tier.
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::validation("empty body"));
    }
    let mime_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let title = headers
        .get("x-document-title")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ingest_request = IngestRequest {
        input: RawInput {
            mime_type,
            body: body.to_vec(),
            source_url: None,
            title,
        },
        user_id: caller_user_id(&context),
        chunk_strategy: ChunkStrategy::Semantic,
        model_override: None,
        task_type: None,
        valid_until: None,
        source_updated_at: None,
        entity_id_fields: Vec::new(),
    };

    match state.ingest.ingest(ingest_request).await? {
        IngestOutcome::Duplicate { document_id } => Ok((
            StatusCode::OK,
            Json(DuplicateDocumentResponse {
                duplicate: true,
                document_id: document_id.to_string(),
            }),
        )
            .into_response()),
        IngestOutcome::Created(receipt) => Ok(receipt_response(receipt).into_response()),
    }
}

/// `POST /api/ingest`: returns `{documentId, queued}`; 207 on partial
/// failure (document persisted, embeddings pending).
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::validation("empty body"));
    }
    let mime_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();
    let title = headers
        .get("x-document-title")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ingest_request = IngestRequest {
        input: RawInput {
            mime_type,
            body: body.to_vec(),
            source_url: None,
            title,
        },
        user_id: caller_user_id(&context),
        chunk_strategy: ChunkStrategy::Semantic,
        model_override: None,
        task_type: None,
        valid_until: None,
        source_updated_at: None,
        entity_id_fields: Vec::new(),
    };

    match state.ingest.ingest(ingest_request).await? {
        IngestOutcome::Duplicate { document_id } => Ok((
            StatusCode::OK,
            Json(IngestResponse {
                document_id: document_id.to_string(),
                queued: false,
            }),
        )
            .into_response()),
        IngestOutcome::Created(receipt) => {
            let status = if receipt.embeddings_generated {
                StatusCode::CREATED
            } else {
                StatusCode::MULTI_STATUS
            };
            Ok((
                status,
                Json(IngestResponse {
                    document_id: receipt.document_id.to_string(),
                    queued: receipt.queued,
                }),
            )
                .into_response())
        }
    }
}

/// `GET /api/embeddings/search`: model scoping is checked before any store
/// or provider call.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHitResponse>>, ApiError> {
    let model_id = query
        .model_id
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::from(RuntimeError::from(VectorError::MissingModelId)))?;
    let q = query
        .q
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::validation("q is required"))?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    // The query string is embedded, so it spends token budget too.
    let user_id = caller_user_id(&context);
    let estimate = estimate_tokens(q);
    let decision = state.tokens.check(&user_id, estimate).await;
    if !decision.allowed {
        return Err(RuntimeError::from(BudgetError::TokensExceeded {
            limit: decision.limit,
            used: decision.limit - decision.remaining,
            remaining: decision.remaining,
        })
        .into());
    }

    let started = Instant::now();
    let embedded = state.llm.embed_batch(model_id, &[q.to_string()]).await;
    state.costs.record_call(
        "search",
        model_id,
        estimate as u32,
        0,
        started.elapsed().as_millis() as u64,
        embedded.is_ok(),
    );
    let query_vector = embedded
        .map_err(RuntimeError::from)?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_failure",
            "embedder returned no vector",
        ))?;

    let hits = state
        .vectors
        .knn(
            model_id,
            &query_vector,
            limit,
            KnnOptions {
                freshness_filter: !query.include_expired,
                freshness_weight: query.freshness_weight,
            },
        )
        .await
        .map_err(RuntimeError::from)?;

    // Outbound guardrail scan over the response payload.
    let serialized = serde_json::to_string(
        &hits
            .iter()
            .map(|h| &h.metadata)
            .collect::<Vec<_>>(),
    )
    .unwrap_or_default();
    let scan = state
        .guardrails
        .scan_output(&serialized, &ScanConfig::default())
        .await;
    if !scan.passed {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "guardrail_blocked",
            "search results blocked by output guardrails",
        )
        .with_details(serde_json::json!({ "findings": scan.findings })));
    }

    Ok(Json(
        hits.into_iter()
            .map(|hit| SearchHitResponse {
                embedding_id: hit.embedding_id.to_string(),
                source_type: hit.source_type.to_string(),
                source_id: hit.source_id.to_string(),
                similarity: hit.similarity,
                metadata: serde_json::to_value(hit.metadata).unwrap_or_default(),
            })
            .collect(),
    ))
}

/// `POST /api/embeddings`: embed a text without persisting a document.
pub async fn create_embedding(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<UserContext>,
    Json(request): Json<EmbedRequest>,
) -> Result<(StatusCode, Json<EmbedResponse>), ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::validation("content is required"));
    }

    let user_id = caller_user_id(&context);
    let estimate = estimate_tokens(&request.content);
    let decision = state.tokens.check(&user_id, estimate).await;
    if !decision.allowed {
        return Err(RuntimeError::from(BudgetError::TokensExceeded {
            limit: decision.limit,
            used: decision.limit - decision.remaining,
            remaining: decision.remaining,
        })
        .into());
    }

    let model = state.router.embedding_model(
        request.model_id.as_deref(),
        &request.content,
        request.task_type.as_deref(),
    );

    let started = Instant::now();
    let embedded = state.llm.embed_batch(&model, &[request.content]).await;
    state.costs.record_call(
        "embed",
        &model,
        estimate as u32,
        0,
        started.elapsed().as_millis() as u64,
        embedded.is_ok(),
    );
    let vector = embedded
        .map_err(RuntimeError::from)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_failure",
                "embedder returned no vector",
            )
        })?;

    Ok((
        StatusCode::CREATED,
        Json(EmbedResponse {
            model_id: model,
            dimensions: vector.len(),
            embedding: vector,
        }),
    ))
}
