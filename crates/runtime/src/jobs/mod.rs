//! Durable job queue and workers
//!
//! At-least-once delivery over a SQLite-backed store. Every processor is
//! idempotent; embed-family jobs serialize per document.

pub mod store;
pub mod types;
pub mod worker;

pub use store::{JobStore, SqliteJobStore};
pub use types::{Job, JobKind, JobPayload, JobState};
pub use worker::{JobHandler, JobQueue, WorkerPool};
