//! Wire types for the HTTP API
//!
//! Request bodies use the field names the deployment contract fixes
//! (snake_case); response payloads are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChunkStrategy, Generation, PromptVersion, UserPreference};

// ── Health ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    pub services: HealthServices,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthServices {
    pub database: String,
    pub redis: String,
    pub litellm: String,
}

// ── Prompts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePromptRequest {
    pub prompt_name: String,
    pub content: String,
    pub author: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficRequest {
    pub active_pct: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalScoreRequest {
    pub eval_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVersionResponse {
    pub id: String,
    pub prompt_name: String,
    pub version: String,
    pub content: String,
    pub content_hash: String,
    pub eval_score: Option<f64>,
    pub active_pct: u8,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

impl From<PromptVersion> for PromptVersionResponse {
    fn from(v: PromptVersion) -> Self {
        Self {
            id: v.id.to_string(),
            prompt_name: v.prompt_name,
            version: v.version,
            content: v.content,
            content_hash: v.content_hash,
            eval_score: v.eval_score,
            active_pct: v.active_pct,
            author: v.author,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromptResponse {
    #[serde(flatten)]
    pub version: PromptVersionResponse,
    pub selection_source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteResponse {
    pub previous_pct: u8,
    pub new_pct: u8,
    pub next_step: Option<u8>,
}

// ── Documents & ingestion ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: Option<String>,
    pub content: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    pub source_url: Option<String>,
    #[serde(default)]
    pub chunk_strategy: ChunkStrategy,
    pub model_id: Option<String>,
    pub task_type: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity_id_fields: Vec<String>,
}

fn default_mime() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentResponse {
    pub document_id: String,
    pub chunks_created: usize,
    pub embeddings_generated: bool,
    pub embedding_model_id: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateDocumentResponse {
    pub duplicate: bool,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub document_id: String,
    pub queued: bool,
}

// ── Embeddings & search ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    #[serde(rename = "modelId")]
    pub model_id: Option<String>,
    pub limit: Option<usize>,
    /// Apply the staleness curve to ranking scores.
    #[serde(rename = "freshnessWeight", default)]
    pub freshness_weight: bool,
    /// Include expired documents (freshness filter off).
    #[serde(rename = "includeExpired", default)]
    pub include_expired: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHitResponse {
    pub embedding_id: String,
    pub source_type: String,
    pub source_id: String,
    pub similarity: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedRequest {
    pub content: String,
    pub model_id: Option<String>,
    pub task_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedResponse {
    pub model_id: String,
    pub dimensions: usize,
    pub embedding: Vec<f32>,
}

// ── Generations & feedback ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationListQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeRequest {
    pub outcome_type: String,
    pub outcome_value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub prompt_hash: String,
    pub prompt_version: Option<String>,
    pub task_type: String,
    pub input_tokens: u32,
    pub response_hash: String,
    pub output_tokens: u32,
    pub model: String,
    pub model_version: Option<String>,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub user_feedback: Option<String>,
    pub feedback_at: Option<DateTime<Utc>>,
    pub thumbs: Option<i8>,
    pub quality_score: Option<f64>,
    pub hallucination: bool,
    pub guardrail_triggered: Vec<String>,
}

impl From<Generation> for GenerationResponse {
    fn from(g: Generation) -> Self {
        Self {
            id: g.id.to_string(),
            created_at: g.created_at,
            user_id: g.user_id,
            session_id: g.session_id,
            prompt_hash: g.prompt_hash,
            prompt_version: g.prompt_version,
            task_type: g.task_type,
            input_tokens: g.input_tokens,
            response_hash: g.response_hash,
            output_tokens: g.output_tokens,
            model: g.model,
            model_version: g.model_version,
            latency_ms: g.latency_ms,
            cost_usd: g.cost_usd,
            user_feedback: g.user_feedback.map(|f| f.to_string()),
            feedback_at: g.feedback_at,
            thumbs: g.thumbs,
            quality_score: g.quality_score,
            hallucination: g.hallucination,
            guardrail_triggered: g.guardrail_triggered,
        }
    }
}

// ── Preferences ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SetPreferenceRequest {
    pub preference_key: Option<String>,
    pub preference_value: serde_json::Value,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceResponse {
    pub user_id: String,
    pub preference_key: String,
    pub preference_value: serde_json::Value,
    pub source: String,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<UserPreference> for PreferenceResponse {
    fn from(p: UserPreference) -> Self {
        Self {
            user_id: p.user_id,
            preference_key: p.preference_key,
            preference_value: p.preference_value,
            source: p.source.to_string(),
            confidence: p.confidence,
            updated_at: p.updated_at,
        }
    }
}

// ── Few-shot entries ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFewShotRequest {
    pub task_type: String,
    pub input_text: String,
    pub output_text: String,
    pub quality_score: Option<f64>,
    pub source_generation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FewShotQuery {
    #[serde(rename = "taskType")]
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

// ── Provider adapters ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DisabledResponse {
    pub enabled: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddMemoryRequest {
    pub user_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemorySearchQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub q: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FineTuneLogRequest {
    pub calls: Vec<crate::providers::openpipe::CapturedCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FineTuneTriggerRequest {
    pub base_model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeResponse {
    pub text: String,
    pub guardrails: GuardrailSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailSummary {
    pub passed: bool,
    pub scanners_run: Vec<String>,
    pub scan_time_ms: u64,
}

// ── Costs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CostsQuery {
    pub view: Option<String>,
}
