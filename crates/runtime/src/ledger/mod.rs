//! Request-time budget accounting
//!
//! Two ledgers gate every LLM-touching request: a per-user daily token
//! counter backed by an external counter store, and a process-wide cost
//! ledger with a hard dollar cap.

pub mod costs;
pub mod tokens;

pub use costs::{AgentCostReport, CostLedger, CostReport, ObservabilityReport, PricingTable};
pub use tokens::{BudgetDecision, CounterStore, InMemoryCounterStore, TokenBudget};
