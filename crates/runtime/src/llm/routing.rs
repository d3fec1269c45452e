//! Heuristic model routing
//!
//! Classifies work into a complexity tier from cheap signals (length,
//! task-type bias, keyword markers) and maps the tier to a model id. A caller
//! override always wins; with routing disabled everything lands on the
//! balanced tier.

use serde::{Deserialize, Serialize};

/// Complexity tier selecting between cost and quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Fast,
    Balanced,
    Quality,
}

/// Keyword markers that push a text toward the quality tier.
const QUALITY_SIGNALS: &[&str] = &[
    "legal",
    "contract",
    "compliance",
    "regulation",
    "financial",
    "medical",
    "diagnosis",
    "architecture",
];

/// Task types with a known complexity bias.
const QUALITY_TASKS: &[&str] = &["analysis", "reasoning", "strategy", "code-review"];
const FAST_TASKS: &[&str] = &["classify", "tag", "extract", "autocomplete"];

/// Maps complexity tiers to concrete model ids.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    enabled: bool,
    fast_embedding: String,
    balanced_embedding: String,
    quality_embedding: String,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_embedding: "text-embedding-3-small".to_string(),
            balanced_embedding: "text-embedding-3-small".to_string(),
            quality_embedding: "text-embedding-3-large".to_string(),
        }
    }
}

impl ModelRouter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Classify a text into a tier.
    pub fn classify(&self, text: &str, task_type: Option<&str>) -> ComplexityTier {
        if !self.enabled {
            return ComplexityTier::Balanced;
        }

        if let Some(task) = task_type {
            if QUALITY_TASKS.contains(&task) {
                return ComplexityTier::Quality;
            }
            if FAST_TASKS.contains(&task) && text.len() < 2_000 {
                return ComplexityTier::Fast;
            }
        }

        let lowered = text.to_lowercase();
        if QUALITY_SIGNALS.iter().any(|s| lowered.contains(s)) {
            return ComplexityTier::Quality;
        }

        match text.len() {
            0..=500 => ComplexityTier::Fast,
            501..=8_000 => ComplexityTier::Balanced,
            _ => ComplexityTier::Quality,
        }
    }

    /// Pick the embedding model: caller override first, else tier mapping.
    pub fn embedding_model(
        &self,
        override_model: Option<&str>,
        text: &str,
        task_type: Option<&str>,
    ) -> String {
        if let Some(model) = override_model {
            if !model.trim().is_empty() {
                return model.to_string();
            }
        }
        let tier = self.classify(text, task_type);
        self.embedding_model_for_tier(tier)
    }

    pub fn embedding_model_for_tier(&self, tier: ComplexityTier) -> String {
        match tier {
            ComplexityTier::Fast => self.fast_embedding.clone(),
            ComplexityTier::Balanced => self.balanced_embedding.clone(),
            ComplexityTier::Quality => self.quality_embedding.clone(),
        }
    }
}
