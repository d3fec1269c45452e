//! Persistence for the platform's relational entities.

pub mod sqlite;

pub use sqlite::{DbHandle, PreferenceWrite, SqliteStore};
