//! Process-wide cost ledger
//!
//! Every LLM call lands here. Per-agent aggregates and a capped ring of
//! recent latencies feed two reports: a cost-only view and an observability
//! view (call counts, error rates, p95 latency). `ensure_budget` raises once
//! accumulated spend reaches the configured hard cap, halting further LLM
//! calls until reset.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::types::BudgetError;

const LATENCY_RING_CAP: usize = 100;

/// Per-model pricing in USD per 1k tokens. Unknown models fall back to the
/// `default` row, never to zero.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o".to_string(),
            ModelRate {
                input_per_1k: 0.0025,
                output_per_1k: 0.01,
            },
        );
        rates.insert(
            "gpt-4o-mini".to_string(),
            ModelRate {
                input_per_1k: 0.00015,
                output_per_1k: 0.0006,
            },
        );
        rates.insert(
            "claude-3-5-sonnet".to_string(),
            ModelRate {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        );
        rates.insert(
            "claude-3-haiku".to_string(),
            ModelRate {
                input_per_1k: 0.00025,
                output_per_1k: 0.00125,
            },
        );
        rates.insert(
            "text-embedding-3-small".to_string(),
            ModelRate {
                input_per_1k: 0.00002,
                output_per_1k: 0.0,
            },
        );
        rates.insert(
            "text-embedding-3-large".to_string(),
            ModelRate {
                input_per_1k: 0.00013,
                output_per_1k: 0.0,
            },
        );
        Self {
            rates,
            default_rate: ModelRate {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        }
    }
}

impl PricingTable {
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.default_rate)
    }

    /// Cost of a single call.
    pub fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let rate = self.rate_for(model);
        (f64::from(input_tokens) / 1000.0) * rate.input_per_1k
            + (f64::from(output_tokens) / 1000.0) * rate.output_per_1k
    }
}

#[derive(Debug, Default, Clone)]
struct AgentTotals {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    call_count: u64,
    success_count: u64,
    fail_count: u64,
    latency_samples: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    agents: HashMap<String, AgentTotals>,
    total_cost_usd: f64,
    total_calls: u64,
}

/// Cost-only view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCostReport {
    pub agent: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub call_count: u64,
}

/// Cost-only process report.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub total_cost_usd: f64,
    pub max_cost_usd: f64,
    pub remaining_usd: f64,
    pub total_calls: u64,
    pub agents: Vec<AgentCostReport>,
}

/// Observability view of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentObservability {
    pub agent: String,
    pub call_count: u64,
    pub error_rate: f64,
    pub p95_latency_ms: u64,
}

/// Observability process report.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityReport {
    pub total_calls: u64,
    pub agents: Vec<AgentObservability>,
}

/// Process-local cost ledger. Thread-safe; readers observe values at most one
/// recorded call out of date.
pub struct CostLedger {
    pricing: PricingTable,
    max_cost_usd: f64,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(pricing: PricingTable, max_cost_usd: f64) -> Self {
        Self {
            pricing,
            max_cost_usd,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Record one LLM call and return its computed cost.
    pub fn record_call(
        &self,
        agent: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        latency_ms: u64,
        success: bool,
    ) -> f64 {
        let cost = self.pricing.cost(model, input_tokens, output_tokens);

        let mut state = self.state.lock();
        let totals = state.agents.entry(agent.to_string()).or_default();
        totals.input_tokens += u64::from(input_tokens);
        totals.output_tokens += u64::from(output_tokens);
        totals.cost_usd += cost;
        totals.call_count += 1;
        if success {
            totals.success_count += 1;
        } else {
            totals.fail_count += 1;
        }
        if totals.latency_samples.len() >= LATENCY_RING_CAP {
            totals.latency_samples.pop_front();
        }
        totals.latency_samples.push_back(latency_ms);

        state.total_cost_usd += cost;
        state.total_calls += 1;
        cost
    }

    /// Raise once total spend reaches the hard cap.
    pub fn ensure_budget(&self) -> Result<(), BudgetError> {
        let state = self.state.lock();
        if state.total_cost_usd >= self.max_cost_usd {
            return Err(BudgetError::CostExceeded {
                total_cost_usd: state.total_cost_usd,
                max_cost_usd: self.max_cost_usd,
            });
        }
        Ok(())
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.state.lock().total_cost_usd
    }

    pub fn max_cost_usd(&self) -> f64 {
        self.max_cost_usd
    }

    /// Cost-only report.
    pub fn cost_report(&self) -> CostReport {
        let state = self.state.lock();
        let mut agents: Vec<AgentCostReport> = state
            .agents
            .iter()
            .map(|(name, totals)| AgentCostReport {
                agent: name.clone(),
                input_tokens: totals.input_tokens,
                output_tokens: totals.output_tokens,
                cost_usd: totals.cost_usd,
                call_count: totals.call_count,
            })
            .collect();
        agents.sort_by(|a, b| {
            b.cost_usd
                .partial_cmp(&a.cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        CostReport {
            total_cost_usd: state.total_cost_usd,
            max_cost_usd: self.max_cost_usd,
            remaining_usd: (self.max_cost_usd - state.total_cost_usd).max(0.0),
            total_calls: state.total_calls,
            agents,
        }
    }

    /// Observability report: call counts, error rates, p95 latency.
    pub fn observability_report(&self) -> ObservabilityReport {
        let state = self.state.lock();
        let mut agents: Vec<AgentObservability> = state
            .agents
            .iter()
            .map(|(name, totals)| AgentObservability {
                agent: name.clone(),
                call_count: totals.call_count,
                error_rate: if totals.call_count == 0 {
                    0.0
                } else {
                    totals.fail_count as f64 / totals.call_count as f64
                },
                p95_latency_ms: p95(&totals.latency_samples),
            })
            .collect();
        agents.sort_by(|a, b| b.call_count.cmp(&a.call_count));
        ObservabilityReport {
            total_calls: state.total_calls,
            agents,
        }
    }

    /// Zero all counters (admin endpoint).
    pub fn reset(&self) {
        *self.state.lock() = LedgerState::default();
    }
}

fn p95(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(cap: f64) -> CostLedger {
        CostLedger::new(PricingTable::default(), cap)
    }

    #[test]
    fn cost_matches_pricing_formula() {
        let pricing = PricingTable::default();
        let cost = pricing.cost("gpt-4o-mini", 1000, 2000);
        let expected = 0.00015 + 2.0 * 0.0006;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn unknown_model_uses_default_pricing() {
        let pricing = PricingTable::default();
        let cost = pricing.cost("some-new-model", 1000, 1000);
        assert!(cost > 0.0);
        assert!((cost - (0.003 + 0.015)).abs() < 1e-12);
    }

    #[test]
    fn total_is_sum_of_per_call_costs() {
        let ledger = ledger(10.0);
        let mut expected = 0.0;
        for _ in 0..5 {
            expected += ledger.record_call("ingest", "gpt-4o", 500, 100, 200, true);
        }
        expected += ledger.record_call("chat", "gpt-4o-mini", 100, 50, 80, true);
        assert!((ledger.total_cost_usd() - expected).abs() < 1e-12);
    }

    #[test]
    fn ensure_budget_trips_at_cap() {
        let ledger = ledger(0.001);
        assert!(ledger.ensure_budget().is_ok());
        // Enough tokens on default pricing to cross one tenth of a cent.
        ledger.record_call("chat", "unknown", 1000, 0, 10, true);
        let err = ledger.ensure_budget().unwrap_err();
        assert!(matches!(err, BudgetError::CostExceeded { .. }));

        ledger.reset();
        assert!(ledger.ensure_budget().is_ok());
    }

    #[test]
    fn observability_tracks_error_rate_and_p95() {
        let ledger = ledger(10.0);
        for i in 0..10 {
            ledger.record_call("worker", "gpt-4o-mini", 10, 10, (i + 1) * 100, i != 9);
        }
        let report = ledger.observability_report();
        let worker = report.agents.iter().find(|a| a.agent == "worker").unwrap();
        assert_eq!(worker.call_count, 10);
        assert!((worker.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(worker.p95_latency_ms, 1000);
    }

    #[test]
    fn latency_ring_is_capped() {
        let ledger = ledger(100.0);
        for i in 0..250u64 {
            ledger.record_call("a", "gpt-4o-mini", 1, 1, i, true);
        }
        let state = ledger.state.lock();
        assert_eq!(state.agents["a"].latency_samples.len(), LATENCY_RING_CAP);
        // Oldest samples were evicted.
        assert_eq!(*state.agents["a"].latency_samples.front().unwrap(), 150);
    }

    #[test]
    fn cost_report_orders_by_spend() {
        let ledger = ledger(10.0);
        ledger.record_call("cheap", "gpt-4o-mini", 10, 10, 5, true);
        ledger.record_call("spendy", "gpt-4o", 10_000, 10_000, 5, true);
        let report = ledger.cost_report();
        assert_eq!(report.agents[0].agent, "spendy");
        assert!(report.remaining_usd < 10.0);
    }

    #[test]
    fn concurrent_recording_is_safe() {
        let ledger = std::sync::Arc::new(ledger(1000.0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    l.record_call("t", "gpt-4o-mini", 10, 10, 5, true);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.cost_report().total_calls, 800);
    }
}
