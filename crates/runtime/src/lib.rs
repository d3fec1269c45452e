//! Tessera runtime
//!
//! The core of the Tessera LLM application platform: a governed HTTP surface
//! around a multi-stage ingestion and embedding pipeline, a durable job
//! queue, model-scoped vector search, a prompt A/B and promotion engine, and
//! the provider adapters the platform depends on.

pub mod api;
pub mod config;
pub mod extract;
pub mod generations;
pub mod guardrails;
pub mod ingest;
pub mod jobs;
pub mod ledger;
pub mod llm;
pub mod preferences;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod vector;

pub use api::{build_router, serve, AppState};
pub use config::Config;
pub use types::RuntimeError;
