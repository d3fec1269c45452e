//! Core types and data structures for the Tessera runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Unique identifier for ingested documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for embedding rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingId(pub Uuid);

impl EmbeddingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EmbeddingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EmbeddingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for prompt versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptVersionId(pub Uuid);

impl PromptVersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PromptVersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PromptVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PromptVersionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for logged generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(pub Uuid);

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GenerationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for queued jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a document's content originally came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Document,
    Web,
    Csv,
    Image,
    Audio,
    Api,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceType::Document => "document",
            SourceType::Web => "web",
            SourceType::Csv => "csv",
            SourceType::Image => "image",
            SourceType::Audio => "audio",
            SourceType::Api => "api",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(SourceType::Document),
            "web" => Ok(SourceType::Web),
            "csv" => Ok(SourceType::Csv),
            "image" => Ok(SourceType::Image),
            "audio" => Ok(SourceType::Audio),
            "api" => Ok(SourceType::Api),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// How a document is split into chunks before embedding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStrategy {
    #[default]
    Fixed,
    SlidingWindow,
    PerEntity,
    Semantic,
}

impl std::fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::SlidingWindow => "sliding-window",
            ChunkStrategy::PerEntity => "per-entity",
            ChunkStrategy::Semantic => "semantic",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(ChunkStrategy::Fixed),
            "sliding-window" => Ok(ChunkStrategy::SlidingWindow),
            "per-entity" => Ok(ChunkStrategy::PerEntity),
            "semantic" => Ok(ChunkStrategy::Semantic),
            other => Err(format!("unknown chunk strategy: {other}")),
        }
    }
}

/// Enrichment state attached to a document by background workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Enriched,
    Failed,
    Skipped,
}

impl std::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Failed => "failed",
            EnrichmentStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "enriched" => Ok(EnrichmentStatus::Enriched),
            "failed" => Ok(EnrichmentStatus::Failed),
            "skipped" => Ok(EnrichmentStatus::Skipped),
            other => Err(format!("unknown enrichment status: {other}")),
        }
    }
}

/// An ingested document.
///
/// Created by ingestion, mutated only by the chunk/embed/enrich/freshness
/// workers, never deleted by the runtime. The invariant
/// `(chunk_count > 0) ↔ (embedding_model_id != None)` holds after every
/// successful embed; a failed embed clears both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub mime_type: String,
    /// Hex SHA-256 of the canonical text. Unique by policy: a duplicate
    /// ingest short-circuits to the existing document id.
    pub content_hash: String,
    pub chunk_count: u32,
    pub embedding_model_id: Option<String>,
    pub raw_content: Option<String>,
    pub chunk_strategy: ChunkStrategy,
    pub ingested_at: DateTime<Utc>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub enrichment_status: EnrichmentStatus,
}

/// A single embedded chunk.
///
/// Owned by its document: re-embedding deletes and replaces all rows for the
/// document. Vectors with different `model_id` values must never be compared
/// in one similarity query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub id: EmbeddingId,
    pub source_type: SourceType,
    pub source_id: DocumentId,
    /// Hex SHA-256 of the chunk text.
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A versioned prompt. Append-only: `active_pct` and `eval_score` are the only
/// mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: PromptVersionId,
    pub prompt_name: String,
    /// Semver string, e.g. `v1.2.0`.
    pub version: String,
    pub content: String,
    pub content_hash: String,
    pub eval_score: Option<f64>,
    /// Share of traffic in [0, 100]. The sum over all versions of one prompt
    /// name never exceeds 100.
    pub active_pct: u8,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// User feedback recorded against a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserFeedback {
    Accepted,
    Rejected,
    Edited,
    Regenerated,
    Ignored,
}

impl std::fmt::Display for UserFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserFeedback::Accepted => "accepted",
            UserFeedback::Rejected => "rejected",
            UserFeedback::Edited => "edited",
            UserFeedback::Regenerated => "regenerated",
            UserFeedback::Ignored => "ignored",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UserFeedback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(UserFeedback::Accepted),
            "rejected" => Ok(UserFeedback::Rejected),
            "edited" => Ok(UserFeedback::Edited),
            "regenerated" => Ok(UserFeedback::Regenerated),
            "ignored" => Ok(UserFeedback::Ignored),
            other => Err(format!("unknown feedback value: {other}")),
        }
    }
}

/// An immutable record of one LLM call.
///
/// Append-only except for the feedback block; `feedback_at` is stamped once
/// on first feedback and never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
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
    pub user_feedback: Option<UserFeedback>,
    pub feedback_at: Option<DateTime<Utc>>,
    /// -1, 0 or 1.
    pub thumbs: Option<i8>,
    pub user_edit_diff: Option<String>,
    pub quality_score: Option<f64>,
    pub hallucination: bool,
    pub guardrail_triggered: Vec<String>,
}

/// Business outcome attributed to a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Conversion,
    TaskCompleted,
    Abandoned,
}

impl std::fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeType::Conversion => "conversion",
            OutcomeType::TaskCompleted => "task_completed",
            OutcomeType::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutcomeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversion" => Ok(OutcomeType::Conversion),
            "task_completed" => Ok(OutcomeType::TaskCompleted),
            "abandoned" => Ok(OutcomeType::Abandoned),
            other => Err(format!("unknown outcome type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub generation_id: GenerationId,
    pub user_id: String,
    pub outcome_type: OutcomeType,
    pub outcome_value: f64,
    pub created_at: DateTime<Utc>,
}

/// Provenance of a stored user preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceSource {
    Explicit,
    Inferred,
    Default,
}

impl std::fmt::Display for PreferenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreferenceSource::Explicit => "explicit",
            PreferenceSource::Inferred => "inferred",
            PreferenceSource::Default => "default",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PreferenceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(PreferenceSource::Explicit),
            "inferred" => Ok(PreferenceSource::Inferred),
            "default" => Ok(PreferenceSource::Default),
            other => Err(format!("unknown preference source: {other}")),
        }
    }
}

/// A single user preference. `(user_id, preference_key)` is unique; inference
/// never overwrites a row whose source is `Explicit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub id: Uuid,
    pub user_id: String,
    pub preference_key: String,
    pub preference_value: serde_json::Value,
    pub source: PreferenceSource,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a few-shot entry entered the library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CuratedBy {
    Auto,
    Manual,
}

impl std::fmt::Display for CuratedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CuratedBy::Auto => "auto",
            CuratedBy::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CuratedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CuratedBy::Auto),
            "manual" => Ok(CuratedBy::Manual),
            other => Err(format!("unknown curation source: {other}")),
        }
    }
}

/// A curated input/output exemplar for few-shot prompting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotEntry {
    pub id: Uuid,
    pub task_type: String,
    pub input_text: String,
    pub output_text: String,
    pub quality_score: f64,
    pub source_generation_id: Option<GenerationId>,
    pub curated_by: CuratedBy,
    pub is_active: bool,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_round_trips() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_type_round_trips() {
        for s in ["document", "web", "csv", "image", "audio", "api"] {
            let parsed: SourceType = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("video".parse::<SourceType>().is_err());
    }

    #[test]
    fn chunk_strategy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ChunkStrategy::SlidingWindow).unwrap();
        assert_eq!(json, "\"sliding-window\"");
        let back: ChunkStrategy = serde_json::from_str("\"per-entity\"").unwrap();
        assert_eq!(back, ChunkStrategy::PerEntity);
    }

    #[test]
    fn feedback_enum_rejects_unknown() {
        assert!("meh".parse::<UserFeedback>().is_err());
        assert_eq!(
            "accepted".parse::<UserFeedback>().unwrap(),
            UserFeedback::Accepted
        );
    }
}
