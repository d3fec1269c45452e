//! Generation logging, feedback attachment and outcomes
//!
//! Every LLM call is recorded as an immutable row; only the feedback block
//! mutates, and `feedback_at` is stamped exactly once. Accepted responses
//! with a top thumb rating are flagged as few-shot candidates.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::SqliteStore;
use crate::telemetry::{EventSink, TelemetryEvent};
use crate::types::{
    Generation, GenerationId, Outcome, OutcomeType, RuntimeError, StorageError, UserFeedback,
};

/// Input for logging one call. Raw texts are hashed, never stored.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationInput {
    pub user_id: String,
    pub session_id: Option<String>,
    pub prompt_text: String,
    pub response_text: String,
    pub prompt_version: Option<String>,
    pub task_type: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
    pub model_version: Option<String>,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub hallucination: bool,
    #[serde(default)]
    pub guardrail_triggered: Vec<String>,
}

/// Feedback attachment; at least one field must be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackInput {
    pub user_feedback: Option<UserFeedback>,
    pub thumbs: Option<i8>,
    pub user_edit_diff: Option<String>,
}

/// Windowed totals and averages for one user.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub user_id: String,
    pub days: u32,
    pub total_generations: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_latency_ms: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub edited: u64,
    pub regenerated: u64,
    pub acceptance_rate: f64,
}

/// Generation log service.
pub struct GenerationService {
    store: Arc<SqliteStore>,
    events: Arc<dyn EventSink>,
}

impl GenerationService {
    pub fn new(store: Arc<SqliteStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Insert an immutable call record.
    pub async fn log(&self, input: GenerationInput) -> Result<Generation, RuntimeError> {
        let generation = Generation {
            id: GenerationId::new(),
            created_at: Utc::now(),
            user_id: input.user_id,
            session_id: input.session_id,
            prompt_hash: hex::encode(Sha256::digest(input.prompt_text.as_bytes())),
            prompt_version: input.prompt_version,
            task_type: input.task_type,
            input_tokens: input.input_tokens,
            response_hash: hex::encode(Sha256::digest(input.response_text.as_bytes())),
            output_tokens: input.output_tokens,
            model: input.model,
            model_version: input.model_version,
            latency_ms: input.latency_ms,
            cost_usd: input.cost_usd,
            user_feedback: None,
            feedback_at: None,
            thumbs: None,
            user_edit_diff: None,
            quality_score: input.quality_score,
            hallucination: input.hallucination,
            guardrail_triggered: input.guardrail_triggered,
        };
        self.store.insert_generation(&generation).await?;
        Ok(generation)
    }

    /// Attach feedback. Validates field presence and the thumbs range, and
    /// emits a few-shot-candidate event for accepted top-rated responses.
    pub async fn attach_feedback(
        &self,
        id: GenerationId,
        feedback: FeedbackInput,
    ) -> Result<Generation, RuntimeError> {
        if feedback.user_feedback.is_none()
            && feedback.thumbs.is_none()
            && feedback.user_edit_diff.is_none()
        {
            return Err(RuntimeError::Validation(
                "at least one feedback field is required".to_string(),
            ));
        }
        if let Some(thumbs) = feedback.thumbs {
            if !(-1..=1).contains(&thumbs) {
                return Err(RuntimeError::Validation(format!(
                    "thumbs {thumbs} out of range [-1, 1]"
                )));
            }
        }

        let generation = self
            .store
            .attach_feedback(
                id,
                feedback.user_feedback,
                feedback.thumbs,
                feedback.user_edit_diff.as_deref(),
            )
            .await?;

        if generation.user_feedback == Some(UserFeedback::Accepted)
            && generation.thumbs == Some(1)
        {
            self.events
                .emit(
                    TelemetryEvent::new("few_shot_candidate")
                        .with("generation_id", generation.id.to_string())
                        .with("task_type", generation.task_type.clone()),
                )
                .await;
        }

        Ok(generation)
    }

    /// Attribute a business outcome to a generation. The generation must
    /// exist.
    pub async fn record_outcome(
        &self,
        generation_id: GenerationId,
        outcome_type: OutcomeType,
        outcome_value: f64,
    ) -> Result<Outcome, RuntimeError> {
        let generation = self
            .store
            .get_generation(generation_id)
            .await?
            .ok_or(StorageError::GenerationNotFound(generation_id))?;

        let outcome = Outcome {
            id: Uuid::new_v4(),
            generation_id,
            user_id: generation.user_id,
            outcome_type,
            outcome_value,
            created_at: Utc::now(),
        };
        self.store.insert_outcome(&outcome).await?;
        Ok(outcome)
    }

    /// Windowed totals and averages.
    pub async fn stats(&self, user_id: &str, days: u32) -> Result<GenerationStats, RuntimeError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let generations = self.store.generations_since(user_id, since).await?;

        let total = generations.len() as u64;
        let mut stats = GenerationStats {
            user_id: user_id.to_string(),
            days,
            total_generations: total,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            avg_latency_ms: 0.0,
            accepted: 0,
            rejected: 0,
            edited: 0,
            regenerated: 0,
            acceptance_rate: 0.0,
        };

        let mut latency_sum = 0u64;
        let mut feedback_count = 0u64;
        for generation in &generations {
            stats.total_input_tokens += u64::from(generation.input_tokens);
            stats.total_output_tokens += u64::from(generation.output_tokens);
            stats.total_cost_usd += generation.cost_usd;
            latency_sum += generation.latency_ms;
            match generation.user_feedback {
                Some(UserFeedback::Accepted) => {
                    stats.accepted += 1;
                    feedback_count += 1;
                }
                Some(UserFeedback::Rejected) => {
                    stats.rejected += 1;
                    feedback_count += 1;
                }
                Some(UserFeedback::Edited) => {
                    stats.edited += 1;
                    feedback_count += 1;
                }
                Some(UserFeedback::Regenerated) => {
                    stats.regenerated += 1;
                    feedback_count += 1;
                }
                Some(UserFeedback::Ignored) => feedback_count += 1,
                None => {}
            }
        }

        if total > 0 {
            stats.avg_latency_ms = latency_sum as f64 / total as f64;
        }
        if feedback_count > 0 {
            stats.acceptance_rate = stats.accepted as f64 / feedback_count as f64;
        }
        Ok(stats)
    }

    pub async fn list(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>, RuntimeError> {
        Ok(self.store.list_generations(user_id, limit, offset).await?)
    }

    pub async fn get(&self, id: GenerationId) -> Result<Option<Generation>, RuntimeError> {
        Ok(self.store.get_generation(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::JsonlSink;
    use crate::telemetry::TracingSink;

    fn input(user: &str) -> GenerationInput {
        GenerationInput {
            user_id: user.to_string(),
            session_id: None,
            prompt_text: "write a haiku".to_string(),
            response_text: "an old silent pond".to_string(),
            prompt_version: Some("v1.0.0".to_string()),
            task_type: "creative".to_string(),
            input_tokens: 10,
            output_tokens: 12,
            model: "gpt-4o-mini".to_string(),
            model_version: None,
            latency_ms: 420,
            cost_usd: 0.0001,
            quality_score: None,
            hallucination: false,
            guardrail_triggered: Vec::new(),
        }
    }

    fn service(store: Arc<SqliteStore>) -> GenerationService {
        GenerationService::new(store, Arc::new(TracingSink))
    }

    #[tokio::test]
    async fn log_hashes_texts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = service(store);
        let generation = service.log(input("u1")).await.unwrap();
        assert_eq!(generation.prompt_hash.len(), 64);
        assert_eq!(generation.response_hash.len(), 64);
        assert_eq!(
            generation.prompt_hash,
            hex::encode(Sha256::digest(b"write a haiku"))
        );
        assert!(generation.user_feedback.is_none());
    }

    #[tokio::test]
    async fn feedback_requires_a_field_and_valid_thumbs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = service(store);
        let generation = service.log(input("u1")).await.unwrap();

        let err = service
            .attach_feedback(generation.id, FeedbackInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));

        let err = service
            .attach_feedback(
                generation.id,
                FeedbackInput {
                    thumbs: Some(2),
                    ..FeedbackInput::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));

        let updated = service
            .attach_feedback(
                generation.id,
                FeedbackInput {
                    user_feedback: Some(UserFeedback::Accepted),
                    ..FeedbackInput::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.user_feedback, Some(UserFeedback::Accepted));
        assert!(updated.feedback_at.is_some());
    }

    #[tokio::test]
    async fn accepted_top_rated_emits_few_shot_candidate() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let service =
            GenerationService::new(store, Arc::new(JsonlSink::new(events_path.clone())));

        let generation = service.log(input("u1")).await.unwrap();
        service
            .attach_feedback(
                generation.id,
                FeedbackInput {
                    user_feedback: Some(UserFeedback::Accepted),
                    thumbs: Some(1),
                    user_edit_diff: None,
                },
            )
            .await
            .unwrap();

        let content = std::fs::read_to_string(&events_path).unwrap();
        assert!(content.contains("few_shot_candidate"));
    }

    #[tokio::test]
    async fn outcome_requires_existing_generation() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = service(store);

        let err = service
            .record_outcome(GenerationId::new(), OutcomeType::Conversion, 10.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Storage(StorageError::GenerationNotFound(_))
        ));

        let generation = service.log(input("u1")).await.unwrap();
        let outcome = service
            .record_outcome(generation.id, OutcomeType::TaskCompleted, 1.0)
            .await
            .unwrap();
        assert_eq!(outcome.user_id, "u1");
        assert_eq!(outcome.outcome_type, OutcomeType::TaskCompleted);
    }

    #[tokio::test]
    async fn stats_aggregate_over_window() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = service(store);

        for _ in 0..3 {
            service.log(input("u1")).await.unwrap();
        }
        let generation = service.log(input("u1")).await.unwrap();
        service
            .attach_feedback(
                generation.id,
                FeedbackInput {
                    user_feedback: Some(UserFeedback::Accepted),
                    ..FeedbackInput::default()
                },
            )
            .await
            .unwrap();

        let stats = service.stats("u1", 7).await.unwrap();
        assert_eq!(stats.total_generations, 4);
        assert_eq!(stats.total_input_tokens, 40);
        assert_eq!(stats.accepted, 1);
        assert!((stats.acceptance_rate - 1.0).abs() < f64::EPSILON);
        assert!((stats.avg_latency_ms - 420.0).abs() < f64::EPSILON);

        // Other users see an empty window.
        let stats = service.stats("u2", 7).await.unwrap();
        assert_eq!(stats.total_generations, 0);
    }
}
