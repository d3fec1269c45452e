//! Batch preference inference
//!
//! Rule-based inference over a user's feedback history. Every rule needs a
//! minimum number of supporting signals before it writes, and inferred
//! writes never overwrite an explicit preference.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{PreferenceWrite, SqliteStore};
use crate::types::{
    Generation, PreferenceSource, RuntimeError, UserFeedback, UserPreference,
};

/// Default minimum supporting signals per rule.
pub const MIN_EVIDENCE: usize = 5;

/// One feedback signal distilled from a generation row.
#[derive(Debug, Clone)]
pub struct FeedbackSignal {
    pub user_feedback: Option<UserFeedback>,
    pub thumbs: Option<i8>,
    pub model: String,
    pub task_type: String,
    pub latency_ms: u64,
    pub quality_score: Option<f64>,
    pub user_edit_diff: Option<String>,
}

impl From<&Generation> for FeedbackSignal {
    fn from(generation: &Generation) -> Self {
        Self {
            user_feedback: generation.user_feedback,
            thumbs: generation.thumbs,
            model: generation.model.clone(),
            task_type: generation.task_type.clone(),
            latency_ms: generation.latency_ms,
            quality_score: generation.quality_score,
            user_edit_diff: generation.user_edit_diff.clone(),
        }
    }
}

/// One inferred preference before persistence.
#[derive(Debug, Clone, Serialize)]
pub struct InferredPreference {
    pub key: String,
    pub value: serde_json::Value,
    pub confidence: f64,
}

/// Result of an inference run for one user.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceReport {
    pub user_id: String,
    pub signals: usize,
    pub inferred: Vec<InferredPreference>,
    pub written: usize,
    pub skipped_explicit: usize,
}

/// Preference inference service.
pub struct PreferenceService {
    store: Arc<SqliteStore>,
    min_evidence: usize,
}

impl PreferenceService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            min_evidence: MIN_EVIDENCE,
        }
    }

    pub fn with_min_evidence(mut self, min_evidence: usize) -> Self {
        self.min_evidence = min_evidence;
        self
    }

    /// Infer and persist preferences for one user.
    pub async fn infer_for_user(&self, user_id: &str) -> Result<InferenceReport, RuntimeError> {
        let generations = self.store.feedback_generations(user_id).await?;
        let signals: Vec<FeedbackSignal> = generations.iter().map(FeedbackSignal::from).collect();
        let inferred = infer(&signals, self.min_evidence);

        let mut written = 0usize;
        let mut skipped_explicit = 0usize;
        for preference in &inferred {
            let now = Utc::now();
            let row = UserPreference {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                preference_key: preference.key.clone(),
                preference_value: preference.value.clone(),
                source: PreferenceSource::Inferred,
                confidence: preference.confidence,
                created_at: now,
                updated_at: now,
            };
            match self.store.upsert_preference(&row, true).await? {
                PreferenceWrite::SkippedExplicit => skipped_explicit += 1,
                _ => written += 1,
            }
        }

        Ok(InferenceReport {
            user_id: user_id.to_string(),
            signals: signals.len(),
            inferred,
            written,
            skipped_explicit,
        })
    }

    /// Infer for every user with feedback history.
    pub async fn infer_all(&self) -> Result<Vec<InferenceReport>, RuntimeError> {
        let mut reports = Vec::new();
        for user_id in self.store.feedback_user_ids().await? {
            reports.push(self.infer_for_user(&user_id).await?);
        }
        Ok(reports)
    }
}

/// Pure rule evaluation over a batch of signals.
pub fn infer(signals: &[FeedbackSignal], min_evidence: usize) -> Vec<InferredPreference> {
    let mut out = Vec::new();

    // Rule 1: a dominant model among accepted responses.
    let accepted: Vec<&FeedbackSignal> = signals
        .iter()
        .filter(|s| s.user_feedback == Some(UserFeedback::Accepted))
        .collect();
    if accepted.len() >= min_evidence {
        let mut by_model: HashMap<&str, usize> = HashMap::new();
        for signal in &accepted {
            *by_model.entry(signal.model.as_str()).or_default() += 1;
        }
        if let Some((model, count)) = by_model.into_iter().max_by_key(|(_, c)| *c) {
            if count as f64 / accepted.len() as f64 > 0.60 {
                out.push(InferredPreference {
                    key: "preferred_model".to_string(),
                    value: serde_json::json!(model),
                    confidence: 0.7,
                });
            }
        }
    }

    // Rule 2: edits that mostly delete suggest a taste for brevity.
    let edited: Vec<&FeedbackSignal> = signals
        .iter()
        .filter(|s| s.user_feedback == Some(UserFeedback::Edited))
        .collect();
    if edited.len() >= min_evidence {
        let shrinking = edited
            .iter()
            .filter(|s| {
                s.user_edit_diff
                    .as_deref()
                    .map(|diff| {
                        let (additions, deletions) = diff_counts(diff);
                        deletions > additions
                    })
                    .unwrap_or(false)
            })
            .count();
        if shrinking as f64 / edited.len() as f64 > 0.50 {
            out.push(InferredPreference {
                key: "preferred_length".to_string(),
                value: serde_json::json!("concise"),
                confidence: 0.6,
            });
        }
    }

    // Rule 3: frequent slow regenerations suggest a taste for speed.
    let regenerated: Vec<&FeedbackSignal> = signals
        .iter()
        .filter(|s| s.user_feedback == Some(UserFeedback::Regenerated))
        .collect();
    if regenerated.len() >= min_evidence && !signals.is_empty() {
        let share = regenerated.len() as f64 / signals.len() as f64;
        let mean_latency = regenerated.iter().map(|s| s.latency_ms as f64).sum::<f64>()
            / regenerated.len() as f64;
        if share > 0.40 && mean_latency > 3000.0 {
            out.push(InferredPreference {
                key: "preferred_speed".to_string(),
                value: serde_json::json!("fast"),
                confidence: 0.6,
            });
        }
    }

    // Rule 4: per-task thumbs trending positive.
    let mut thumbed_by_task: HashMap<&str, Vec<i8>> = HashMap::new();
    for signal in signals {
        if let Some(thumbs) = signal.thumbs {
            thumbed_by_task
                .entry(signal.task_type.as_str())
                .or_default()
                .push(thumbs);
        }
    }
    for (task_type, thumbs) in thumbed_by_task {
        if thumbs.len() >= min_evidence {
            let mean = thumbs.iter().map(|&t| f64::from(t)).sum::<f64>() / thumbs.len() as f64;
            if mean > 0.5 {
                out.push(InferredPreference {
                    key: format!("preferred_quality_{task_type}"),
                    value: serde_json::json!("high"),
                    confidence: 0.7,
                });
            }
        }
    }

    out
}

/// Count added and removed lines in a unified diff, ignoring file headers.
fn diff_counts(diff: &str) -> (usize, usize) {
    let mut additions = 0usize;
    let mut deletions = 0usize;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(feedback: UserFeedback, model: &str) -> FeedbackSignal {
        FeedbackSignal {
            user_feedback: Some(feedback),
            thumbs: None,
            model: model.to_string(),
            task_type: "summarize".to_string(),
            latency_ms: 500,
            quality_score: None,
            user_edit_diff: None,
        }
    }

    #[test]
    fn dominant_model_is_inferred() {
        let mut signals = vec![signal(UserFeedback::Accepted, "gpt-4o"); 4];
        signals.push(signal(UserFeedback::Accepted, "claude-3-haiku"));
        let inferred = infer(&signals, 5);
        assert_eq!(inferred.len(), 1);
        assert_eq!(inferred[0].key, "preferred_model");
        assert_eq!(inferred[0].value, serde_json::json!("gpt-4o"));
        assert_eq!(inferred[0].confidence, 0.7);
    }

    #[test]
    fn no_rule_fires_below_min_evidence() {
        let signals = vec![signal(UserFeedback::Accepted, "gpt-4o"); 4];
        assert!(infer(&signals, 5).is_empty());
    }

    #[test]
    fn split_model_acceptance_does_not_infer() {
        let mut signals = vec![signal(UserFeedback::Accepted, "gpt-4o"); 3];
        signals.extend(vec![signal(UserFeedback::Accepted, "claude-3-haiku"); 3]);
        // 50/50 split is under the 60% bar.
        assert!(infer(&signals, 5).is_empty());
    }

    #[test]
    fn shrinking_edits_infer_concise() {
        let mut signals = Vec::new();
        for _ in 0..5 {
            let mut s = signal(UserFeedback::Edited, "gpt-4o");
            s.user_edit_diff = Some("-line one\n-line two\n+shorter".to_string());
            signals.push(s);
        }
        let inferred = infer(&signals, 5);
        assert!(inferred
            .iter()
            .any(|p| p.key == "preferred_length" && p.value == serde_json::json!("concise")));
    }

    #[test]
    fn slow_regenerations_infer_fast() {
        let mut signals = Vec::new();
        for _ in 0..5 {
            let mut s = signal(UserFeedback::Regenerated, "gpt-4o");
            s.latency_ms = 5000;
            signals.push(s);
        }
        for _ in 0..5 {
            signals.push(signal(UserFeedback::Accepted, "gpt-4o"));
        }
        // 50% regenerations at 5s mean latency.
        let inferred = infer(&signals, 5);
        assert!(inferred
            .iter()
            .any(|p| p.key == "preferred_speed" && p.value == serde_json::json!("fast")));
    }

    #[test]
    fn fast_regenerations_do_not_infer() {
        let mut signals = Vec::new();
        for _ in 0..6 {
            let mut s = signal(UserFeedback::Regenerated, "gpt-4o");
            s.latency_ms = 500;
            signals.push(s);
        }
        assert!(infer(&signals, 5)
            .iter()
            .all(|p| p.key != "preferred_speed"));
    }

    #[test]
    fn positive_thumbs_per_task_infer_quality() {
        let mut signals = Vec::new();
        for _ in 0..5 {
            let mut s = signal(UserFeedback::Accepted, "gpt-4o");
            s.thumbs = Some(1);
            s.task_type = "draft".to_string();
            signals.push(s);
        }
        let inferred = infer(&signals, 5);
        assert!(inferred
            .iter()
            .any(|p| p.key == "preferred_quality_draft" && p.value == serde_json::json!("high")));
    }

    #[test]
    fn diff_counting_ignores_headers() {
        let diff = "--- a/file\n+++ b/file\n-gone\n-also gone\n+added";
        assert_eq!(diff_counts(diff), (1, 2));
    }

    #[tokio::test]
    async fn explicit_preferences_survive_inference() {
        use crate::types::{Generation, GenerationId};

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = PreferenceService::new(store.clone()).with_min_evidence(2);

        // Seed an explicit preference.
        let explicit = UserPreference {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            preference_key: "preferred_model".to_string(),
            preference_value: serde_json::json!("claude-3-5-sonnet"),
            source: PreferenceSource::Explicit,
            confidence: 1.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_preference(&explicit, false).await.unwrap();

        // Seed accepted generations dominated by another model.
        for _ in 0..3 {
            let generation = Generation {
                id: GenerationId::new(),
                created_at: Utc::now(),
                user_id: "u1".to_string(),
                session_id: None,
                prompt_hash: "p".repeat(64),
                prompt_version: None,
                task_type: "summarize".to_string(),
                input_tokens: 10,
                response_hash: "r".repeat(64),
                output_tokens: 10,
                model: "gpt-4o".to_string(),
                model_version: None,
                latency_ms: 100,
                cost_usd: 0.0,
                user_feedback: Some(UserFeedback::Accepted),
                feedback_at: Some(Utc::now()),
                thumbs: None,
                user_edit_diff: None,
                quality_score: None,
                hallucination: false,
                guardrail_triggered: Vec::new(),
            };
            store.insert_generation(&generation).await.unwrap();
        }

        let report = service.infer_for_user("u1").await.unwrap();
        assert_eq!(report.skipped_explicit, 1);

        let kept = store
            .get_preference("u1", "preferred_model")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.source, PreferenceSource::Explicit);
        assert_eq!(kept.preference_value, serde_json::json!("claude-3-5-sonnet"));
    }
}
