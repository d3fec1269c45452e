//! HTTP API: governor chain, route surface and server assembly

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use middleware::{AuthVerifier, BotVerifier, Identity, Tier, UserContext};
pub use server::{build_router, serve, AppState};
