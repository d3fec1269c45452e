//! Document ingestion
//!
//! Modality adapters normalize input to canonical text; the pipeline
//! deduplicates, chunks, gates on budgets, embeds, persists and schedules
//! follow-up work.

pub mod adapters;
pub mod chunking;
pub mod dedup;
pub mod freshness;
pub mod pipeline;

pub use adapters::{content_hash, IngestedContent, Ingester, IngesterRegistry, RawInput};
pub use pipeline::{IngestOutcome, IngestReceipt, IngestRequest, IngestService};
