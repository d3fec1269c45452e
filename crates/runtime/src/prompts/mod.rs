//! Prompt version selection, traffic experiments and the promotion ladder

pub mod engine;

pub use engine::{
    DecisionAction, DecisionMetrics, DecisionThresholds, FlagProvider, PromotionDecision,
    PromptEngine, PromoteReceipt, SelectedPrompt, SelectionSource, LADDER, QUALITY_GATE,
};
