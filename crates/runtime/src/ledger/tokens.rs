//! Per-user daily token budget
//!
//! Counters live in an external store addressed through `IncrBy`/`Get`
//! semantics, keyed `user:{id}:day:{YYYYMMDD}` with a 24h TTL. When no store
//! is configured the gate fails open in development and closed in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Environment;

/// Outcome of a token budget check, surfaced verbatim in 429 responses.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
}

/// Counter store capability (Redis-shaped: `IncrBy` with TTL, `Get`).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `delta` to the counter, creating it with `ttl` when absent.
    /// Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> i64;

    /// Current value, if the key exists and has not expired.
    async fn get(&self, key: &str) -> Option<i64>;
}

/// Process-local counter store with TTL expiry.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: DashMap<String, (i64, Instant)>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| (0, now + ttl));
        // Expired entries restart from zero with a fresh TTL.
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += delta;
        entry.0
    }

    async fn get(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        if entry.1 <= Instant::now() {
            return None;
        }
        Some(entry.0)
    }
}

/// Token budget gate.
pub struct TokenBudget {
    store: Option<Arc<dyn CounterStore>>,
    limit: u64,
    environment: Environment,
}

impl TokenBudget {
    pub fn new(
        store: Option<Arc<dyn CounterStore>>,
        limit: u64,
        environment: Environment,
    ) -> Self {
        Self {
            store,
            limit,
            environment,
        }
    }

    fn day_key(user_id: &str, now: DateTime<Utc>) -> String {
        format!("user:{}:day:{}", user_id, now.format("%Y%m%d"))
    }

    /// Check and consume budget for an estimated token count.
    ///
    /// The increment happens before the comparison so concurrent requests
    /// cannot both slip under the limit; a denied request is refunded.
    pub async fn check(&self, user_id: &str, estimate: u64) -> BudgetDecision {
        self.check_at(user_id, estimate, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        user_id: &str,
        estimate: u64,
        now: DateTime<Utc>,
    ) -> BudgetDecision {
        let Some(store) = &self.store else {
            return if self.environment.is_production() {
                BudgetDecision {
                    allowed: false,
                    limit: self.limit,
                    remaining: 0,
                }
            } else {
                BudgetDecision {
                    allowed: true,
                    limit: self.limit,
                    remaining: self.limit,
                }
            };
        };

        let key = Self::day_key(user_id, now);
        let ttl = Duration::from_secs(24 * 60 * 60);
        let new_value = store.incr_by(&key, estimate as i64, ttl).await;

        if new_value as u64 > self.limit {
            // Refund the rejected estimate.
            store.incr_by(&key, -(estimate as i64), ttl).await;
            let consumed = (new_value - estimate as i64).max(0) as u64;
            BudgetDecision {
                allowed: false,
                limit: self.limit,
                remaining: self.limit.saturating_sub(consumed),
            }
        } else {
            BudgetDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit.saturating_sub(new_value as u64),
            }
        }
    }

    /// Tokens consumed so far today, for snapshots.
    pub async fn consumed_today(&self, user_id: &str) -> u64 {
        let Some(store) = &self.store else { return 0 };
        store
            .get(&Self::day_key(user_id, Utc::now()))
            .await
            .unwrap_or(0)
            .max(0) as u64
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn configured(&self) -> bool {
        self.store.is_some()
    }
}
