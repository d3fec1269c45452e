//! Prompt A/B engine
//!
//! Selection is sticky weighted random: a deterministic hash of
//! `(user, prompt)` walks the allocation vector, so a user keeps their
//! variant until traffic changes. Promotion advances along the fixed ladder
//! `[0, 10, 50, 100]` with a quality gate above 10%; reaching 100 zeroes all
//! siblings in the same transaction.

use async_trait::async_trait;
use chrono::Utc;
use semver::Version;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::storage::SqliteStore;
use crate::types::{PromptError, PromptVersion, PromptVersionId, RuntimeError, StorageError};

/// The allowed `active_pct` steps when advancing.
pub const LADDER: [u8; 4] = [0, 10, 50, 100];

/// Minimum eval score required to advance above 10%.
pub const QUALITY_GATE: f64 = 0.70;

/// External feature-flag capability. An explicit variant wins over the
/// weighted assignment.
#[async_trait]
pub trait FlagProvider: Send + Sync {
    /// Version string pinned for this `(user, prompt)`, if any.
    async fn variant_for(&self, user_id: &str, prompt_name: &str) -> Option<String>;
}

/// How the returned version was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionSource {
    Flag,
    Weighted,
    Fallback,
}

/// A selected prompt version.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedPrompt {
    pub version: PromptVersion,
    pub source: SelectionSource,
}

/// Result of a manual promotion.
#[derive(Debug, Clone, Serialize)]
pub struct PromoteReceipt {
    pub previous_pct: u8,
    pub new_pct: u8,
    pub next_step: Option<u8>,
}

/// Input metrics for an automated decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionMetrics {
    pub samples: u64,
    pub accepted: u64,
    pub conversions: u64,
}

/// Thresholds for an automated decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionThresholds {
    pub min_samples: u64,
    pub promote_acceptance: f64,
    pub promote_conversion: f64,
    pub rollback_acceptance: f64,
    pub rollback_conversion: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            min_samples: 50,
            promote_acceptance: 0.6,
            promote_conversion: 0.05,
            rollback_acceptance: 0.3,
            rollback_conversion: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Hold,
    Promote,
    Rollback,
}

/// Output of `decide`.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionDecision {
    pub action: DecisionAction,
    pub reason: String,
    pub acceptance_rate: f64,
    pub conversion_rate: f64,
    pub next_pct: Option<u8>,
}

/// The prompt engine.
pub struct PromptEngine {
    store: Arc<SqliteStore>,
    flags: Option<Arc<dyn FlagProvider>>,
}

impl PromptEngine {
    pub fn new(store: Arc<SqliteStore>, flags: Option<Arc<dyn FlagProvider>>) -> Self {
        Self { store, flags }
    }

    /// Create a new version at 0% traffic with an auto-incremented minor
    /// semver.
    pub async fn create(
        &self,
        prompt_name: &str,
        content: &str,
        author: &str,
    ) -> Result<PromptVersion, RuntimeError> {
        let versions = self.store.versions_for_prompt(prompt_name).await?;
        let next_version = next_minor_version(&versions)?;

        let version = PromptVersion {
            id: PromptVersionId::new(),
            prompt_name: prompt_name.to_string(),
            version: next_version,
            content: content.to_string(),
            content_hash: hex::encode(Sha256::digest(content.as_bytes())),
            eval_score: None,
            active_pct: 0,
            author: author.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_prompt_version(&version).await?;
        tracing::info!(
            prompt = %prompt_name,
            version = %version.version,
            "created prompt version"
        );
        Ok(version)
    }

    /// Select the active version for a `(user, prompt)` pair.
    pub async fn get_active(
        &self,
        prompt_name: &str,
        user_id: &str,
    ) -> Result<SelectedPrompt, RuntimeError> {
        let mut versions = self.store.versions_for_prompt(prompt_name).await?;
        sort_by_semver(&mut versions);

        let active: Vec<&PromptVersion> =
            versions.iter().filter(|v| v.active_pct > 0).collect();
        if active.is_empty() {
            return Err(PromptError::NoActiveVersion(prompt_name.to_string()).into());
        }

        // Explicit flag assignment wins.
        if let Some(flags) = &self.flags {
            if let Some(pinned) = flags.variant_for(user_id, prompt_name).await {
                if let Some(version) = versions.iter().find(|v| v.version == pinned) {
                    return Ok(SelectedPrompt {
                        version: version.clone(),
                        source: SelectionSource::Flag,
                    });
                }
                tracing::warn!(
                    prompt = %prompt_name,
                    pinned = %pinned,
                    "flag pinned an unknown version, falling back to weighted"
                );
            }
        }

        // Sticky weighted assignment over the allocation vector.
        let bucket = assignment_bucket(user_id, prompt_name);
        let mut cumulative = 0u32;
        for version in &active {
            cumulative += u32::from(version.active_pct);
            if u32::from(bucket) < cumulative {
                return Ok(SelectedPrompt {
                    version: (*version).clone(),
                    source: SelectionSource::Weighted,
                });
            }
        }

        // Remaining bucket (Σ < 100) maps to the highest-active version.
        let fallback = active
            .iter()
            .max_by_key(|v| v.active_pct)
            .expect("non-empty active set");
        Ok(SelectedPrompt {
            version: (*fallback).clone(),
            source: SelectionSource::Fallback,
        })
    }

    /// Set one version's traffic share, holding `Σ active_pct <= 100`.
    pub async fn set_traffic(
        &self,
        id: PromptVersionId,
        active_pct: u8,
    ) -> Result<PromptVersion, RuntimeError> {
        if active_pct > 100 {
            return Err(RuntimeError::Validation(format!(
                "active_pct {active_pct} out of range [0, 100]"
            )));
        }
        let version = self
            .store
            .get_prompt_version(id)
            .await?
            .ok_or(StorageError::PromptVersionNotFound(id))?;

        let siblings = self.store.versions_for_prompt(&version.prompt_name).await?;
        let sum: u32 = siblings
            .iter()
            .filter(|v| v.id != id)
            .map(|v| u32::from(v.active_pct))
            .sum::<u32>()
            + u32::from(active_pct);
        if sum > 100 {
            return Err(PromptError::AllocationOverflow {
                prompt_name: version.prompt_name.clone(),
                sum,
            }
            .into());
        }

        self.store.set_active_pct(id, active_pct).await?;
        Ok(PromptVersion {
            active_pct,
            ..version
        })
    }

    /// Record an eval score for a version.
    pub async fn set_eval_score(
        &self,
        id: PromptVersionId,
        eval_score: f64,
    ) -> Result<(), RuntimeError> {
        if !(0.0..=1.0).contains(&eval_score) {
            return Err(RuntimeError::Validation(format!(
                "eval_score {eval_score} out of range [0, 1]"
            )));
        }
        self.store.set_eval_score(id, eval_score).await?;
        Ok(())
    }

    /// Advance a version to the next ladder step.
    pub async fn promote(&self, id: PromptVersionId) -> Result<PromoteReceipt, RuntimeError> {
        let version = self
            .store
            .get_prompt_version(id)
            .await?
            .ok_or(StorageError::PromptVersionNotFound(id))?;

        let target = next_ladder_step(version.active_pct).ok_or(PromptError::AlreadyAtTop)?;

        if target > 10 && version.eval_score.unwrap_or(0.0) < QUALITY_GATE {
            return Err(PromptError::QualityGateFailed {
                actual: version.eval_score,
                required: QUALITY_GATE,
            }
            .into());
        }

        if target == 100 {
            self.store.promote_exclusive(id, &version.prompt_name).await?;
        } else {
            // Headroom check against the rest of the allocation.
            let siblings = self.store.versions_for_prompt(&version.prompt_name).await?;
            let sum: u32 = siblings
                .iter()
                .filter(|v| v.id != id)
                .map(|v| u32::from(v.active_pct))
                .sum::<u32>()
                + u32::from(target);
            if sum > 100 {
                return Err(PromptError::AllocationOverflow {
                    prompt_name: version.prompt_name.clone(),
                    sum,
                }
                .into());
            }
            self.store.set_active_pct(id, target).await?;
        }

        tracing::info!(
            prompt = %version.prompt_name,
            version = %version.version,
            from = version.active_pct,
            to = target,
            "promoted prompt version"
        );
        Ok(PromoteReceipt {
            previous_pct: version.active_pct,
            new_pct: target,
            next_step: next_ladder_step(target),
        })
    }

    /// All versions of a prompt, semver ascending.
    pub async fn versions(&self, prompt_name: &str) -> Result<Vec<PromptVersion>, RuntimeError> {
        let mut versions = self.store.versions_for_prompt(prompt_name).await?;
        sort_by_semver(&mut versions);
        Ok(versions)
    }
}

/// Automated promote/hold/rollback decision. Pure.
pub fn decide(
    metrics: DecisionMetrics,
    candidate: &PromptVersion,
    thresholds: &DecisionThresholds,
) -> PromotionDecision {
    let acceptance_rate = rate(metrics.accepted, metrics.samples);
    let conversion_rate = rate(metrics.conversions, metrics.samples);

    if metrics.samples < thresholds.min_samples {
        return PromotionDecision {
            action: DecisionAction::Hold,
            reason: "insufficient_samples".to_string(),
            acceptance_rate,
            conversion_rate,
            next_pct: None,
        };
    }

    let below_rollback = acceptance_rate < thresholds.rollback_acceptance
        || conversion_rate < thresholds.rollback_conversion;
    if below_rollback && candidate.active_pct > 0 {
        return PromotionDecision {
            action: DecisionAction::Rollback,
            reason: "below_rollback_thresholds".to_string(),
            acceptance_rate,
            conversion_rate,
            next_pct: Some(0),
        };
    }

    let Some(next_pct) = next_ladder_step(candidate.active_pct) else {
        return PromotionDecision {
            action: DecisionAction::Hold,
            reason: "already_fully_promoted".to_string(),
            acceptance_rate,
            conversion_rate,
            next_pct: None,
        };
    };

    let meets_promotion = acceptance_rate >= thresholds.promote_acceptance
        && conversion_rate >= thresholds.promote_conversion;
    if meets_promotion {
        let gate_ok = next_pct <= 10 || candidate.eval_score.unwrap_or(0.0) >= QUALITY_GATE;
        if gate_ok {
            return PromotionDecision {
                action: DecisionAction::Promote,
                reason: "thresholds_met".to_string(),
                acceptance_rate,
                conversion_rate,
                next_pct: Some(next_pct),
            };
        }
        return PromotionDecision {
            action: DecisionAction::Hold,
            reason: "quality_gate_not_met".to_string(),
            acceptance_rate,
            conversion_rate,
            next_pct: None,
        };
    }

    PromotionDecision {
        action: DecisionAction::Hold,
        reason: "thresholds_not_met".to_string(),
        acceptance_rate,
        conversion_rate,
        next_pct: None,
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// First ladder step strictly above `current`.
pub fn next_ladder_step(current: u8) -> Option<u8> {
    LADDER.into_iter().find(|&step| step > current)
}

/// Deterministic bucket in [0, 100) for `(user, prompt)`.
fn assignment_bucket(user_id: &str, prompt_name: &str) -> u8 {
    let digest = Sha256::digest(format!("{user_id}:{prompt_name}").as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % 100) as u8
}

fn parse_semver(version: &str) -> Result<Version, PromptError> {
    Version::parse(version.trim_start_matches('v'))
        .map_err(|_| PromptError::InvalidVersion(version.to_string()))
}

fn sort_by_semver(versions: &mut [PromptVersion]) {
    versions.sort_by(|a, b| {
        match (parse_semver(&a.version), parse_semver(&b.version)) {
            (Ok(av), Ok(bv)) => av.cmp(&bv),
            _ => a.version.cmp(&b.version),
        }
    });
}

fn next_minor_version(versions: &[PromptVersion]) -> Result<String, PromptError> {
    let mut best: Option<Version> = None;
    for version in versions {
        let parsed = parse_semver(&version.version)?;
        if best.as_ref().is_none_or(|b| parsed > *b) {
            best = Some(parsed);
        }
    }
    Ok(match best {
        Some(latest) => format!("v{}.{}.0", latest.major, latest.minor + 1),
        None => "v1.0.0".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> PromptEngine {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        PromptEngine::new(store, None)
    }

    fn candidate(active_pct: u8, eval_score: Option<f64>) -> PromptVersion {
        PromptVersion {
            id: PromptVersionId::new(),
            prompt_name: "p".to_string(),
            version: "v1.0.0".to_string(),
            content: "c".to_string(),
            content_hash: "h".to_string(),
            eval_score,
            active_pct,
            author: "ops".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_auto_increments_minor_semver() {
        let engine = engine().await;
        let v1 = engine.create("welcome", "hi", "ops").await.unwrap();
        assert_eq!(v1.version, "v1.0.0");
        assert_eq!(v1.active_pct, 0);

        let v2 = engine.create("welcome", "hello", "ops").await.unwrap();
        assert_eq!(v2.version, "v1.1.0");

        let v3 = engine.create("welcome", "hey", "ops").await.unwrap();
        assert_eq!(v3.version, "v1.2.0");
    }

    #[tokio::test]
    async fn no_active_version_is_an_error() {
        let engine = engine().await;
        engine.create("empty", "c", "ops").await.unwrap();
        let err = engine.get_active("empty", "u1").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Prompt(PromptError::NoActiveVersion(_))
        ));
    }

    #[tokio::test]
    async fn selection_is_sticky() {
        let engine = engine().await;
        let a = engine.create("exp", "a", "ops").await.unwrap();
        let b = engine.create("exp", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 30).await.unwrap();
        engine.set_traffic(b.id, 70).await.unwrap();

        let first = engine.get_active("exp", "user-42").await.unwrap();
        for _ in 0..50 {
            let again = engine.get_active("exp", "user-42").await.unwrap();
            assert_eq!(again.version.id, first.version.id);
        }
    }

    #[tokio::test]
    async fn weighted_selection_respects_buckets() {
        let engine = engine().await;
        let a = engine.create("exp", "a", "ops").await.unwrap();
        let b = engine.create("exp", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 30).await.unwrap();
        engine.set_traffic(b.id, 70).await.unwrap();

        // The version chosen must match the user's bucket deterministically.
        for user in ["u1", "u2", "u3", "u4", "u5", "u6", "u7", "u8"] {
            let bucket = assignment_bucket(user, "exp");
            let selected = engine.get_active("exp", user).await.unwrap();
            let expected = if bucket < 30 { a.id } else { b.id };
            assert_eq!(selected.version.id, expected, "user {user} bucket {bucket}");
        }
    }

    #[tokio::test]
    async fn partial_allocation_falls_back_to_highest_active() {
        let engine = engine().await;
        let a = engine.create("exp", "a", "ops").await.unwrap();
        let b = engine.create("exp", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 10).await.unwrap();
        engine.set_traffic(b.id, 20).await.unwrap();

        // Users whose bucket lands beyond 30 resolve to the 20% version.
        let mut fallback_seen = false;
        for i in 0..50 {
            let user = format!("user-{i}");
            let bucket = assignment_bucket(&user, "exp");
            if bucket >= 30 {
                let selected = engine.get_active("exp", &user).await.unwrap();
                assert_eq!(selected.version.id, b.id);
                assert_eq!(selected.source, SelectionSource::Fallback);
                fallback_seen = true;
            }
        }
        assert!(fallback_seen);
    }

    #[tokio::test]
    async fn traffic_sum_over_100_is_rejected() {
        let engine = engine().await;
        let a = engine.create("exp", "a", "ops").await.unwrap();
        let b = engine.create("exp", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 60).await.unwrap();
        let err = engine.set_traffic(b.id, 50).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Prompt(PromptError::AllocationOverflow { sum: 110, .. })
        ));
        assert!(engine.set_traffic(b.id, 40).await.is_ok());
    }

    #[tokio::test]
    async fn traffic_out_of_range_is_rejected() {
        let engine = engine().await;
        let a = engine.create("exp", "a", "ops").await.unwrap();
        let err = engine.set_traffic(a.id, 101).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
    }

    #[tokio::test]
    async fn promotion_ladder_with_quality_gate() {
        let engine = engine().await;
        let v = engine.create("ladder", "c", "ops").await.unwrap();

        // 0 → 10 needs no gate.
        let receipt = engine.promote(v.id).await.unwrap();
        assert_eq!((receipt.previous_pct, receipt.new_pct), (0, 10));

        // 10 → 50 requires the gate.
        let err = engine.promote(v.id).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Prompt(PromptError::QualityGateFailed { .. })
        ));

        engine.set_eval_score(v.id, 0.80).await.unwrap();
        let receipt = engine.promote(v.id).await.unwrap();
        assert_eq!((receipt.previous_pct, receipt.new_pct), (10, 50));

        let receipt = engine.promote(v.id).await.unwrap();
        assert_eq!((receipt.previous_pct, receipt.new_pct), (50, 100));
        assert!(receipt.next_step.is_none());

        // At the top, promote is a 400.
        let err = engine.promote(v.id).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Prompt(PromptError::AlreadyAtTop)
        ));
    }

    #[tokio::test]
    async fn full_promotion_zeroes_siblings() {
        let engine = engine().await;
        let a = engine.create("excl", "a", "ops").await.unwrap();
        let b = engine.create("excl", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 50).await.unwrap();
        engine.set_traffic(b.id, 50).await.unwrap();
        engine.set_eval_score(b.id, 0.9).await.unwrap();

        engine.promote(b.id).await.unwrap(); // 50 → 100
        let versions = engine.versions("excl").await.unwrap();
        let a_after = versions.iter().find(|v| v.id == a.id).unwrap();
        let b_after = versions.iter().find(|v| v.id == b.id).unwrap();
        assert_eq!(a_after.active_pct, 0);
        assert_eq!(b_after.active_pct, 100);
    }

    #[test]
    fn decide_insufficient_samples() {
        let d = decide(
            DecisionMetrics {
                samples: 10,
                accepted: 9,
                conversions: 5,
            },
            &candidate(10, Some(0.9)),
            &DecisionThresholds::default(),
        );
        assert_eq!(d.action, DecisionAction::Hold);
        assert_eq!(d.reason, "insufficient_samples");
    }

    #[test]
    fn decide_rollback_below_thresholds() {
        let d = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 10,
                conversions: 0,
            },
            &candidate(50, Some(0.9)),
            &DecisionThresholds::default(),
        );
        assert_eq!(d.action, DecisionAction::Rollback);
        assert_eq!(d.next_pct, Some(0));
    }

    #[test]
    fn decide_no_rollback_at_zero_traffic() {
        let d = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 10,
                conversions: 0,
            },
            &candidate(0, None),
            &DecisionThresholds::default(),
        );
        assert_ne!(d.action, DecisionAction::Rollback);
    }

    #[test]
    fn decide_already_at_top() {
        let d = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 90,
                conversions: 20,
            },
            &candidate(100, Some(0.9)),
            &DecisionThresholds::default(),
        );
        assert_eq!(d.action, DecisionAction::Hold);
        assert_eq!(d.reason, "already_fully_promoted");
    }

    #[test]
    fn decide_promote_with_gate() {
        let thresholds = DecisionThresholds::default();
        // 10 → 50 passes only with the eval gate.
        let gated = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 80,
                conversions: 10,
            },
            &candidate(10, None),
            &thresholds,
        );
        assert_eq!(gated.action, DecisionAction::Hold);
        assert_eq!(gated.reason, "quality_gate_not_met");

        let promoted = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 80,
                conversions: 10,
            },
            &candidate(10, Some(0.8)),
            &thresholds,
        );
        assert_eq!(promoted.action, DecisionAction::Promote);
        assert_eq!(promoted.next_pct, Some(50));

        // 0 → 10 needs no gate.
        let first_step = decide(
            DecisionMetrics {
                samples: 100,
                accepted: 80,
                conversions: 10,
            },
            &candidate(0, None),
            &thresholds,
        );
        assert_eq!(first_step.action, DecisionAction::Promote);
        assert_eq!(first_step.next_pct, Some(10));
    }

    #[test]
    fn ladder_steps() {
        assert_eq!(next_ladder_step(0), Some(10));
        assert_eq!(next_ladder_step(10), Some(50));
        assert_eq!(next_ladder_step(50), Some(100));
        assert_eq!(next_ladder_step(100), None);
        // Off-ladder values advance to the next step above.
        assert_eq!(next_ladder_step(30), Some(50));
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let a = assignment_bucket("u1", "p1");
        let b = assignment_bucket("u1", "p1");
        assert_eq!(a, b);
        assert!(a < 100);
        assert!(assignment_bucket("u1", "p2") < 100);
    }

    struct PinnedFlag(&'static str);

    #[async_trait]
    impl FlagProvider for PinnedFlag {
        async fn variant_for(&self, _user_id: &str, _prompt_name: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn flag_override_wins_over_weighting() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = PromptEngine::new(store, Some(Arc::new(PinnedFlag("v1.0.0"))));
        let a = engine.create("flagged", "a", "ops").await.unwrap();
        let b = engine.create("flagged", "b", "ops").await.unwrap();
        engine.set_traffic(a.id, 1).await.unwrap();
        engine.set_traffic(b.id, 99).await.unwrap();

        for user in ["u1", "u2", "u3"] {
            let selected = engine.get_active("flagged", user).await.unwrap();
            assert_eq!(selected.version.id, a.id);
            assert_eq!(selected.source, SelectionSource::Flag);
        }
    }
}
