//! Configuration management for the Tessera runtime
//!
//! Centralizes environment-variable handling with validation and secure
//! defaults. Production mode fails fast on missing required keys; development
//! mode degrades to fail-open behavior where each subsystem documents it.

use serde::{Deserialize, Serialize};
use std::env;

use crate::types::ConfigError;

/// Deployment environment, driven by `NODE_ENV` (the deployment contract
/// predates this implementation and the variable name is load-bearing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Failure mode for the semantic guardrail scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailFailureMode {
    Open,
    #[default]
    Closed,
}

/// Availability policy for optional provider adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Unconfigured providers answer `200 {enabled:false}` and no-op.
    Open,
    /// Unconfigured providers answer `503`.
    Strict,
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment
    pub environment: Environment,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Primary and counter store configuration
    pub stores: StoreConfig,
    /// LiteLLM proxy configuration
    pub llm: LlmConfig,
    /// Budget configuration
    pub budget: BudgetConfig,
    /// Ingestion configuration
    pub ingest: IngestConfig,
    /// Guardrail configuration
    pub guardrails: GuardrailConfig,
    /// Worker configuration
    pub workers: WorkerConfig,
    /// Provider adapter configuration
    pub providers: ProviderConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// CORS allow-list. Empty in production means no
    /// `Access-Control-Allow-Origin` is emitted; in development `*` is used.
    pub allowed_origins: Vec<String>,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            allowed_origins: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Accepted API keys (`API_KEYS`, CSV)
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,
    /// Admin secret (`ADMIN_API_KEY`)
    #[serde(skip_serializing)]
    pub admin_api_key: Option<String>,
    /// Clerk JWT verification secret (`CLERK_SECRET_KEY`)
    #[serde(skip_serializing)]
    pub clerk_secret_key: Option<String>,
    /// Turnstile bot-verification secret (`TURNSTILE_SECRET_KEY`)
    #[serde(skip_serializing)]
    pub turnstile_secret_key: Option<String>,
}

impl AuthConfig {
    /// Fail-open applies when neither credential source is configured. IDOR
    /// checks are disabled with it.
    pub fn fail_open(&self) -> bool {
        self.api_keys.is_empty() && self.clerk_secret_key.is_none()
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Primary relational store (`DATABASE_URL`). `sqlite://path` or a bare
    /// path; `:memory:` for tests.
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    /// Distributed counter store (`REDIS_URL`). When unset the token budget
    /// falls back to the per-environment policy.
    #[serde(skip_serializing)]
    pub redis_url: Option<String>,
}

/// LiteLLM proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub proxy_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Enable heuristic complexity routing (`ROUTELLM_ENABLED`)
    pub routing_enabled: bool,
}

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Process-wide LLM spend cap in USD (`MAX_COST`)
    pub max_cost_usd: f64,
    /// Per-user daily token limit
    pub daily_token_limit: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 10.0,
            daily_token_limit: 100_000,
        }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub chunk_size_chars: usize,
    pub chunk_overlap_chars: usize,
    /// Cosine similarity threshold for near-duplicate detection
    pub near_dup_threshold: f32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size_chars: 1000,
            chunk_overlap_chars: 100,
            near_dup_threshold: 0.92,
        }
    }
}

/// Guardrail configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailConfig {
    /// Semantic scanner failure mode (`LLAMAGUARD_FAILURE_MODE`)
    pub failure_mode: GuardrailFailureMode,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent jobs per worker pool (`WORKER_CONCURRENCY`)
    pub concurrency: usize,
    /// Retry ceiling before dead-lettering
    pub max_attempts: u32,
    /// Shutdown drain window in seconds
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 5,
            drain_timeout_secs: 30,
        }
    }
}

/// Provider adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Availability policy (`STRATEGY_PROVIDER_MODE`); defaults to open in
    /// development and strict in production.
    pub mode: ProviderMode,
    /// Break-glass flag permitting open mode in production
    pub allow_open_in_production: bool,
    #[serde(skip_serializing)]
    pub deepgram_api_key: Option<String>,
    /// Vision-model id for tiered OCR (`ZEROX_MODEL`)
    pub zerox_model: Option<String>,
    /// Local OCR fallback toggle (`TESSERACT_ENABLED`)
    pub tesseract_enabled: bool,
    /// Document parse / OCR service (`DOCPARSE_URL`)
    pub docparse_url: Option<String>,
    pub crawl4ai_url: Option<String>,
    #[serde(skip_serializing)]
    pub mem0_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub zep_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub openpipe_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub composio_api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Open,
            allow_open_in_production: false,
            deepgram_api_key: None,
            zerox_model: None,
            tesseract_enabled: false,
            docparse_url: None,
            crawl4ai_url: None,
            mem0_api_key: None,
            zep_api_key: None,
            openpipe_api_key: None,
            composio_api_key: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            stores: StoreConfig::default(),
            llm: LlmConfig::default(),
            budget: BudgetConfig::default(),
            ingest: IngestConfig::default(),
            guardrails: GuardrailConfig::default(),
            workers: WorkerConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("could not parse {raw:?}"),
            }),
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_var(key).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `.env` files are honored by the binary before this runs (dotenvy).
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match env_var("NODE_ENV").as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        };

        let server = ServerConfig {
            port: env_parse("PORT")?.unwrap_or(3000),
            host: env_var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            allowed_origins: env_var("ALLOWED_ORIGINS")
                .map(|csv| {
                    csv.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS")?.unwrap_or(30),
        };

        let auth = AuthConfig {
            api_keys: env_var("API_KEYS")
                .map(|csv| {
                    csv.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            admin_api_key: env_var("ADMIN_API_KEY"),
            clerk_secret_key: env_var("CLERK_SECRET_KEY"),
            turnstile_secret_key: env_var("TURNSTILE_SECRET_KEY"),
        };

        let stores = StoreConfig {
            database_url: env_var("DATABASE_URL"),
            redis_url: env_var("REDIS_URL"),
        };

        let llm = LlmConfig {
            proxy_url: env_var("LITELLM_PROXY_URL"),
            api_key: env_var("LITELLM_API_KEY"),
            routing_enabled: env_bool("ROUTELLM_ENABLED"),
        };

        let budget = BudgetConfig {
            max_cost_usd: env_parse("MAX_COST")?.unwrap_or(10.0),
            daily_token_limit: env_parse("DAILY_TOKEN_LIMIT")?.unwrap_or(100_000),
        };

        let ingest = IngestConfig {
            chunk_size_chars: env_parse("CHUNK_SIZE_CHARS")?.unwrap_or(1000),
            chunk_overlap_chars: env_parse("CHUNK_OVERLAP_CHARS")?.unwrap_or(100),
            near_dup_threshold: env_parse("NEAR_DUP_THRESHOLD")?.unwrap_or(0.92),
        };

        let guardrails = GuardrailConfig {
            failure_mode: match env_var("LLAMAGUARD_FAILURE_MODE").as_deref() {
                Some("open") => GuardrailFailureMode::Open,
                _ => GuardrailFailureMode::Closed,
            },
        };

        let workers = WorkerConfig {
            concurrency: env_parse("WORKER_CONCURRENCY")?.unwrap_or(5),
            max_attempts: env_parse("JOB_MAX_ATTEMPTS")?.unwrap_or(5),
            drain_timeout_secs: env_parse("WORKER_DRAIN_TIMEOUT_SECS")?.unwrap_or(30),
        };

        let default_mode = if environment.is_production() {
            ProviderMode::Strict
        } else {
            ProviderMode::Open
        };
        let allow_open_in_production = env_bool("STRATEGY_PROVIDER_ALLOW_OPEN_IN_PRODUCTION");
        let mode = match env_var("STRATEGY_PROVIDER_MODE").as_deref() {
            Some("open") => {
                if environment.is_production() && !allow_open_in_production {
                    tracing::warn!(
                        "STRATEGY_PROVIDER_MODE=open ignored in production without \
                         STRATEGY_PROVIDER_ALLOW_OPEN_IN_PRODUCTION"
                    );
                    ProviderMode::Strict
                } else {
                    ProviderMode::Open
                }
            }
            Some("strict") => ProviderMode::Strict,
            _ => default_mode,
        };

        let providers = ProviderConfig {
            mode,
            allow_open_in_production,
            deepgram_api_key: env_var("DEEPGRAM_API_KEY"),
            zerox_model: env_var("ZEROX_MODEL"),
            tesseract_enabled: env_bool("TESSERACT_ENABLED"),
            docparse_url: env_var("DOCPARSE_URL"),
            crawl4ai_url: env_var("CRAWL4AI_URL"),
            mem0_api_key: env_var("MEM0_API_KEY"),
            zep_api_key: env_var("ZEP_API_KEY"),
            openpipe_api_key: env_var("OPENPIPE_API_KEY"),
            composio_api_key: env_var("COMPOSIO_API_KEY"),
        };

        let config = Self {
            environment,
            server,
            auth,
            stores,
            llm,
            budget,
            ingest,
            guardrails,
            workers,
            providers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration.
    ///
    /// Production requires a primary store and at least one credential
    /// source; development tolerates an empty environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.chunk_overlap_chars >= self.ingest.chunk_size_chars {
            return Err(ConfigError::InvalidValue {
                key: "CHUNK_OVERLAP_CHARS".to_string(),
                reason: "overlap must be smaller than chunk size".to_string(),
            });
        }

        if self.budget.max_cost_usd <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_COST".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if self.environment.is_production() {
            if self.stores.database_url.is_none() {
                return Err(ConfigError::MissingRequired {
                    key: "DATABASE_URL".to_string(),
                });
            }
            if self.auth.fail_open() {
                return Err(ConfigError::MissingRequired {
                    key: "API_KEYS or CLERK_SECRET_KEY".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in &[
            "NODE_ENV",
            "PORT",
            "HOST",
            "ALLOWED_ORIGINS",
            "API_KEYS",
            "ADMIN_API_KEY",
            "CLERK_SECRET_KEY",
            "TURNSTILE_SECRET_KEY",
            "DATABASE_URL",
            "REDIS_URL",
            "LITELLM_PROXY_URL",
            "LITELLM_API_KEY",
            "ROUTELLM_ENABLED",
            "MAX_COST",
            "DAILY_TOKEN_LIMIT",
            "CHUNK_SIZE_CHARS",
            "CHUNK_OVERLAP_CHARS",
            "LLAMAGUARD_FAILURE_MODE",
            "STRATEGY_PROVIDER_MODE",
            "STRATEGY_PROVIDER_ALLOW_OPEN_IN_PRODUCTION",
            "WORKER_CONCURRENCY",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_in_development() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.budget.max_cost_usd, 10.0);
        assert_eq!(config.budget.daily_token_limit, 100_000);
        assert_eq!(config.workers.concurrency, 5);
        assert_eq!(config.providers.mode, ProviderMode::Open);
        assert!(config.auth.fail_open());
    }

    #[test]
    #[serial]
    fn production_requires_database_and_credentials() {
        clear_env();
        env::set_var("NODE_ENV", "production");
        assert!(Config::from_env().is_err());

        env::set_var("DATABASE_URL", "sqlite:///tmp/tessera.db");
        assert!(Config::from_env().is_err());

        env::set_var("API_KEYS", "sk-one,sk-two");
        let config = Config::from_env().unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.auth.api_keys.len(), 2);
        assert_eq!(config.providers.mode, ProviderMode::Strict);
        clear_env();
    }

    #[test]
    #[serial]
    fn provider_open_mode_needs_break_glass_in_production() {
        clear_env();
        env::set_var("NODE_ENV", "production");
        env::set_var("DATABASE_URL", "sqlite://:memory:");
        env::set_var("API_KEYS", "sk-one");
        env::set_var("STRATEGY_PROVIDER_MODE", "open");

        let config = Config::from_env().unwrap();
        assert_eq!(config.providers.mode, ProviderMode::Strict);

        env::set_var("STRATEGY_PROVIDER_ALLOW_OPEN_IN_PRODUCTION", "true");
        let config = Config::from_env().unwrap();
        assert_eq!(config.providers.mode, ProviderMode::Open);
        clear_env();
    }

    #[test]
    #[serial]
    fn chunk_overlap_must_be_smaller_than_size() {
        clear_env();
        env::set_var("CHUNK_SIZE_CHARS", "100");
        env::set_var("CHUNK_OVERLAP_CHARS", "100");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn origins_csv_parses() {
        clear_env();
        env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        clear_env();
    }
}
