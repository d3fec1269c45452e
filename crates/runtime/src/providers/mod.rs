//! External provider adapters
//!
//! Each third-party service is modeled as a capability with `Configured` /
//! `Unconfigured` variants. The availability policy decides what an
//! unconfigured capability answers: open mode no-ops with
//! `200 {enabled:false}`, strict mode refuses with 503.

use std::sync::Arc;

use crate::config::ProviderMode;
use crate::types::ProviderError;

pub mod composio;
pub mod docparse;
pub mod memory;
pub mod openpipe;
pub mod scrape;
pub mod transcribe;

pub use composio::{ComposioClient, ToolExecutor};
pub use docparse::{DocumentParser, HttpDocumentParser};
pub use memory::{MemoryClient, MemoryRecord, MemoryStore};
pub use openpipe::{FineTuner, OpenPipeClient};
pub use scrape::{Crawl4AiClient, Scraper};
pub use transcribe::{DeepgramClient, Transcriber};

/// A provider capability: either a live handle or a reason it is absent.
pub enum Capability<T: ?Sized> {
    Configured(Arc<T>),
    Unconfigured { reason: String },
}

impl<T: ?Sized> Capability<T> {
    pub fn unconfigured(reason: impl Into<String>) -> Self {
        Capability::Unconfigured {
            reason: reason.into(),
        }
    }

    pub fn handle(&self) -> Option<&Arc<T>> {
        match self {
            Capability::Configured(handle) => Some(handle),
            Capability::Unconfigured { .. } => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Capability::Configured(_))
    }

    /// Resolve the capability under the availability policy.
    ///
    /// Returns the handle, or the disposition an endpoint should take for the
    /// unconfigured case.
    pub fn resolve(&self, mode: ProviderMode, name: &str) -> Result<&Arc<T>, Unavailable> {
        match self {
            Capability::Configured(handle) => Ok(handle),
            Capability::Unconfigured { reason } => match mode {
                ProviderMode::Open => Err(Unavailable::Disabled {
                    reason: reason.clone(),
                }),
                ProviderMode::Strict => Err(Unavailable::Refused {
                    name: name.to_string(),
                    reason: reason.clone(),
                }),
            },
        }
    }
}

/// Disposition for an unconfigured capability.
#[derive(Debug, Clone)]
pub enum Unavailable {
    /// Open mode: answer `200 {enabled:false, reason}` and no-op.
    Disabled { reason: String },
    /// Strict mode: answer `503 {reason}`.
    Refused { name: String, reason: String },
}

impl From<Unavailable> for ProviderError {
    fn from(value: Unavailable) -> Self {
        match value {
            Unavailable::Disabled { reason } => ProviderError::Unconfigured { name: reason },
            Unavailable::Refused { name, .. } => ProviderError::Unconfigured { name },
        }
    }
}

impl crate::retry::Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RequestFailed { .. } => true,
            ProviderError::ClientError { status, .. } => crate::retry::status_is_retryable(*status),
            ProviderError::Unconfigured { .. } => false,
        }
    }
}

/// Map an HTTP error response to the provider error taxonomy.
pub(crate) async fn error_from_response(
    name: &str,
    response: reqwest::Response,
) -> ProviderError {
    let status = response.status().as_u16();
    let reason = response.text().await.unwrap_or_default();
    if crate::retry::status_is_retryable(status) {
        ProviderError::RequestFailed {
            name: name.to_string(),
            reason: format!("HTTP {status}: {reason}"),
        }
    } else {
        ProviderError::ClientError {
            name: name.to_string(),
            status,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Retryable;

    #[test]
    fn capability_resolution_follows_mode() {
        let capability: Capability<str> = Capability::unconfigured("MEM0_API_KEY not set");

        match capability.resolve(ProviderMode::Open, "memory") {
            Err(Unavailable::Disabled { reason }) => {
                assert!(reason.contains("MEM0_API_KEY"));
            }
            _ => panic!("expected disabled"),
        }

        match capability.resolve(ProviderMode::Strict, "memory") {
            Err(Unavailable::Refused { name, .. }) => assert_eq!(name, "memory"),
            _ => panic!("expected refused"),
        }
    }

    #[test]
    fn configured_capability_resolves() {
        let capability: Capability<String> = Capability::Configured(Arc::new("x".to_string()));
        assert!(capability.resolve(ProviderMode::Strict, "any").is_ok());
        assert!(capability.is_configured());
    }

    #[test]
    fn provider_error_retry_classification() {
        assert!(ProviderError::RequestFailed {
            name: "t".into(),
            reason: "io".into()
        }
        .is_retryable());
        assert!(!ProviderError::ClientError {
            name: "t".into(),
            status: 404,
            reason: String::new()
        }
        .is_retryable());
        assert!(ProviderError::ClientError {
            name: "t".into(),
            status: 429,
            reason: String::new()
        }
        .is_retryable());
    }
}
