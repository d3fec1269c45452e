//! Document freshness
//!
//! Exposed both as a hard filter (expired documents never surface) and as a
//! ranking multiplier applying a staleness curve to similarity scores.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Freshness classification for the freshness worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessClass {
    Fresh,
    Aging,
    Stale,
    Expired,
}

/// Staleness multiplier for ranking.
///
/// 0.0 once `valid_until` has passed; otherwise 1.0 under 30 days old,
/// 0.9 between 30 and 90 days, 0.8 beyond.
pub fn freshness_multiplier(
    ingested_at: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f32 {
    if let Some(expiry) = valid_until {
        if expiry < now {
            return 0.0;
        }
    }
    let age = now.signed_duration_since(ingested_at);
    if age < Duration::days(30) {
        1.0
    } else if age <= Duration::days(90) {
        0.9
    } else {
        0.8
    }
}

/// Classify a document for the freshness worker's status write.
pub fn classify(
    ingested_at: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> FreshnessClass {
    match freshness_multiplier(ingested_at, valid_until, now) {
        m if m == 0.0 => FreshnessClass::Expired,
        m if m >= 1.0 => FreshnessClass::Fresh,
        m if m >= 0.9 => FreshnessClass::Aging,
        _ => FreshnessClass::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_documents_multiply_to_zero() {
        let now = Utc::now();
        let m = freshness_multiplier(now - Duration::days(1), Some(now - Duration::hours(1)), now);
        assert_eq!(m, 0.0);
    }

    #[test]
    fn staleness_curve() {
        let now = Utc::now();
        assert_eq!(
            freshness_multiplier(now - Duration::days(5), None, now),
            1.0
        );
        assert_eq!(
            freshness_multiplier(now - Duration::days(45), None, now),
            0.9
        );
        assert_eq!(
            freshness_multiplier(now - Duration::days(200), None, now),
            0.8
        );
    }

    #[test]
    fn future_expiry_does_not_expire() {
        let now = Utc::now();
        let m = freshness_multiplier(now - Duration::days(5), Some(now + Duration::days(30)), now);
        assert_eq!(m, 1.0);
    }

    #[test]
    fn classification_matches_curve() {
        let now = Utc::now();
        assert_eq!(
            classify(now - Duration::days(5), None, now),
            FreshnessClass::Fresh
        );
        assert_eq!(
            classify(now - Duration::days(45), None, now),
            FreshnessClass::Aging
        );
        assert_eq!(
            classify(now - Duration::days(120), None, now),
            FreshnessClass::Stale
        );
        assert_eq!(
            classify(now, Some(now - Duration::seconds(1)), now),
            FreshnessClass::Expired
        );
    }
}
