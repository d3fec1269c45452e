//! HTTP error mapping
//!
//! Reduces the runtime error taxonomy to the wire contract. Anything not
//! explicitly mapped becomes a generic 500 with no internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::types::{
    AuthError, BudgetError, IngestError, LlmError, PromptError, ProviderError, RuntimeError,
    StorageError,
};

/// Wire error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An error ready for the wire.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                code: code.to_string(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.body.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(error: RuntimeError) -> Self {
        match &error {
            RuntimeError::Auth(auth) => match auth {
                AuthError::MissingCredentials => {
                    ApiError::new(StatusCode::UNAUTHORIZED, "auth_missing", auth.to_string())
                }
                AuthError::InvalidCredentials(_) => {
                    ApiError::new(StatusCode::UNAUTHORIZED, "auth_invalid", auth.to_string())
                }
                AuthError::AdminRequired | AuthError::ScopeViolation => ApiError::new(
                    StatusCode::FORBIDDEN,
                    "authorization_denied",
                    auth.to_string(),
                ),
                AuthError::BotVerificationFailed(_) => ApiError::new(
                    StatusCode::FORBIDDEN,
                    "bot_verification_failed",
                    auth.to_string(),
                ),
            },

            RuntimeError::Budget(budget) => match budget {
                BudgetError::TokensExceeded {
                    limit,
                    used,
                    remaining,
                } => ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "budget_exceeded_tokens",
                    budget.to_string(),
                )
                .with_details(serde_json::json!({
                    "limit": limit,
                    "used": used,
                    "remaining": remaining,
                })),
                BudgetError::CostExceeded {
                    total_cost_usd,
                    max_cost_usd,
                } => ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "budget_exceeded_cost",
                    budget.to_string(),
                )
                .with_details(serde_json::json!({
                    "totalCostUsd": total_cost_usd,
                    "maxCostUsd": max_cost_usd,
                })),
            },

            RuntimeError::Validation(message) => ApiError::validation(message.clone()),

            RuntimeError::NotFound(message) => ApiError::not_found(message.clone()),

            RuntimeError::Storage(storage) => match storage {
                StorageError::DocumentNotFound(_)
                | StorageError::PromptVersionNotFound(_)
                | StorageError::GenerationNotFound(_) => ApiError::not_found(storage.to_string()),
                _ => internal(),
            },

            RuntimeError::Vector(vector) => match vector {
                crate::types::VectorError::MissingModelId => {
                    ApiError::validation("modelId is required")
                }
                crate::types::VectorError::DimensionMismatch { .. } => {
                    ApiError::validation(vector.to_string())
                }
                crate::types::VectorError::Backend(_) => internal(),
            },

            RuntimeError::Ingest(ingest) => match ingest {
                IngestError::EmptyBody => ApiError::validation("empty body"),
                IngestError::UnsupportedType(mime) => ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "unsupported_type",
                    format!("unsupported media type: {mime}"),
                ),
                IngestError::AdapterFailed { .. } | IngestError::EmbeddingFailed(_) => {
                    ApiError::new(
                        StatusCode::BAD_GATEWAY,
                        "upstream_failure",
                        "upstream ingestion dependency failed",
                    )
                }
            },

            RuntimeError::Prompt(prompt) => match prompt {
                PromptError::NoActiveVersion(_) => ApiError::not_found(prompt.to_string()),
                PromptError::AllocationOverflow { .. }
                | PromptError::AlreadyAtTop
                | PromptError::QualityGateFailed { .. }
                | PromptError::InvalidVersion(_) => ApiError::validation(prompt.to_string()),
            },

            RuntimeError::Guardrail(guardrail) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "guardrail_blocked",
                guardrail.to_string(),
            ),

            RuntimeError::Provider(provider) => match provider {
                ProviderError::Unconfigured { .. } => ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "provider_unavailable",
                    provider.to_string(),
                ),
                ProviderError::RequestFailed { .. } => ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_failure",
                    "provider request failed",
                ),
                ProviderError::ClientError { name, status, .. } => ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_failure",
                    format!("provider {name} rejected the request ({status})"),
                ),
            },

            RuntimeError::Llm(llm) => match llm {
                LlmError::NotConfigured => ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "provider_unavailable",
                    llm.to_string(),
                ),
                _ => ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_failure",
                    "LLM provider call failed",
                ),
            },

            RuntimeError::Job(_) | RuntimeError::Configuration(_) | RuntimeError::Internal(_) => {
                tracing::error!(error = %error, "unhandled error at handler boundary");
                internal()
            }
        }
    }
}

fn internal() -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VectorError;

    #[test]
    fn auth_errors_map_to_401_and_403() {
        let e: ApiError = RuntimeError::from(AuthError::MissingCredentials).into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);
        assert_eq!(e.body.code, "auth_missing");

        let e: ApiError = RuntimeError::from(AuthError::AdminRequired).into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);

        let e: ApiError =
            RuntimeError::from(AuthError::BotVerificationFailed("nope".into())).into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.body.code, "bot_verification_failed");
    }

    #[test]
    fn budget_errors_carry_snapshots() {
        let e: ApiError = RuntimeError::from(BudgetError::TokensExceeded {
            limit: 100,
            used: 99,
            remaining: 1,
        })
        .into();
        assert_eq!(e.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(e.body.code, "budget_exceeded_tokens");
        assert_eq!(e.body.details.unwrap()["remaining"], 1);
    }

    #[test]
    fn missing_model_id_is_a_400() {
        let e: ApiError = RuntimeError::from(VectorError::MissingModelId).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unsupported_type_is_a_422() {
        let e: ApiError = RuntimeError::from(IngestError::UnsupportedType("video/mp4".into())).into();
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn storage_internals_do_not_leak() {
        let e: ApiError =
            RuntimeError::from(StorageError::Sqlite("secret path /db".into())).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!e.body.error.contains("/db"));
    }
}
