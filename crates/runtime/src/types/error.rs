//! Error types for the Tessera runtime

use thiserror::Error;

use super::{DocumentId, GenerationId, JobId, PromptVersionId};

/// Main runtime error type
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Guardrail error: {0}")]
    Guardrail(#[from] GuardrailError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Authentication and authorization errors
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Admin access required")]
    AdminRequired,

    #[error("Access to resource owned by another user denied")]
    ScopeViolation,

    #[error("Bot verification failed: {0}")]
    BotVerificationFailed(String),
}

/// Budget gate errors. Each carries the snapshot the caller surfaces in the
/// 429 response.
#[derive(Error, Debug, Clone)]
pub enum BudgetError {
    #[error("Daily token budget exceeded: {used}/{limit} tokens used")]
    TokensExceeded { limit: u64, used: u64, remaining: u64 },

    #[error("Process cost budget exceeded: ${total_cost_usd:.4} >= ${max_cost_usd:.2}")]
    CostExceeded {
        total_cost_usd: f64,
        max_cost_usd: f64,
    },
}

/// Relational store errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Prompt version not found: {0}")]
    PromptVersionNotFound(PromptVersionId),

    #[error("Generation not found: {0}")]
    GenerationNotFound(GenerationId),
}

/// Vector store errors
#[derive(Error, Debug, Clone)]
pub enum VectorError {
    #[error("Vector store backend error: {0}")]
    Backend(String),

    #[error("Query missing model id")]
    MissingModelId,

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Ingestion pipeline errors
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("Empty document body")]
    EmptyBody,

    #[error("Unsupported media type: {0}")]
    UnsupportedType(String),

    #[error("Adapter failed for {mime_type}: {reason}")]
    AdapterFailed { mime_type: String, reason: String },

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),
}

/// Job queue errors
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("Job store error: {0}")]
    Store(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Queue unavailable")]
    QueueUnavailable,
}

/// Prompt engine errors
#[derive(Error, Debug, Clone)]
pub enum PromptError {
    #[error("No active version for prompt: {0}")]
    NoActiveVersion(String),

    #[error("Traffic allocation for {prompt_name} would sum to {sum} (> 100)")]
    AllocationOverflow { prompt_name: String, sum: u32 },

    #[error("Version already fully promoted")]
    AlreadyAtTop,

    #[error("Quality gate failed: eval score {actual:?} < {required}")]
    QualityGateFailed { actual: Option<f64>, required: f64 },

    #[error("Invalid semver version string: {0}")]
    InvalidVersion(String),
}

/// Guardrail scanner errors
#[derive(Error, Debug, Clone)]
pub enum GuardrailError {
    #[error("Output blocked by guardrails: {finding_count} finding(s)")]
    Blocked { finding_count: usize },

    #[error("Scanner unavailable: {0}")]
    ScannerUnavailable(String),
}

/// Provider adapter errors
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider {name} is not configured")]
    Unconfigured { name: String },

    #[error("Provider {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Provider {name} returned client error {status}: {reason}")]
    ClientError {
        name: String,
        status: u16,
        reason: String,
    },
}

/// LLM client errors
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM returned {status}: {body}")]
    ApiError { status: u16, body: String },

    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),

    #[error("LLM client not configured")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_error_message_includes_snapshot() {
        let err = BudgetError::TokensExceeded {
            limit: 100_000,
            used: 100_000,
            remaining: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("100000/100000"));
    }

    #[test]
    fn subsystem_errors_convert_to_runtime_error() {
        let err: RuntimeError = AuthError::MissingCredentials.into();
        assert!(matches!(err, RuntimeError::Auth(_)));

        let err: RuntimeError = VectorError::MissingModelId.into();
        assert!(matches!(err, RuntimeError::Vector(_)));
    }
}
