//! HTTP server assembly
//!
//! Wires the stores, services and provider capabilities into one shared
//! state, builds the router with the governor chain, and serves with
//! graceful shutdown. Background workers run alongside the listener and
//! drain on the same signal.

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::middleware::{
    deadline_middleware, governor_middleware, rate_limit_middleware, AuthVerifier, BotVerifier,
};
use super::routes;
use crate::config::{Config, Environment};
use crate::generations::GenerationService;
use crate::guardrails::GuardrailScanner;
use crate::ingest::{IngestService, IngesterRegistry};
use crate::jobs::{JobQueue, SqliteJobStore, WorkerPool};
use crate::ledger::{CostLedger, InMemoryCounterStore, PricingTable, TokenBudget};
use crate::llm::{create_llm_client, LlmClient, ModelRouter};
use crate::preferences::PreferenceService;
use crate::prompts::PromptEngine;
use crate::providers::{
    Capability, ComposioClient, Crawl4AiClient, DeepgramClient, DocumentParser, FineTuner,
    HttpDocumentParser, MemoryClient, MemoryStore, OpenPipeClient, Scraper, ToolExecutor,
    Transcriber,
};
use crate::storage::SqliteStore;
use crate::telemetry::{EventSink, TracingSink};
use crate::types::RuntimeError;
use crate::vector::{SqliteVectorStore, VectorStore};

/// Shared application state behind the router.
pub struct AppState {
    pub config: Config,
    pub start_time: Instant,
    pub store: Arc<SqliteStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LlmClient>,
    pub router: ModelRouter,
    pub ingest: Arc<IngestService>,
    pub prompts: Arc<PromptEngine>,
    pub preferences: Arc<PreferenceService>,
    pub generations: Arc<GenerationService>,
    pub guardrails: Arc<GuardrailScanner>,
    pub tokens: Arc<TokenBudget>,
    pub costs: Arc<CostLedger>,
    pub queue: Arc<JobQueue>,
    pub auth: AuthVerifier,
    pub bot: BotVerifier,
    pub memory: Capability<dyn MemoryStore>,
    pub tools: Capability<dyn ToolExecutor>,
    pub finetune: Capability<dyn FineTuner>,
    pub transcriber: Capability<dyn Transcriber>,
    pub events: Arc<dyn EventSink>,
}

impl AppState {
    /// Build the full dependency graph from configuration.
    pub fn from_config(config: Config) -> Result<Arc<Self>, RuntimeError> {
        let store = match &config.stores.database_url {
            Some(url) => Arc::new(SqliteStore::from_url(url)?),
            None => {
                tracing::warn!("DATABASE_URL not set, using an in-memory store");
                Arc::new(SqliteStore::open_in_memory()?)
            }
        };
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.handle()));

        let llm = create_llm_client(&config.llm);
        let router = ModelRouter::new(config.llm.routing_enabled);

        let counter_store = config
            .stores
            .redis_url
            .as_ref()
            .map(|_| Arc::new(InMemoryCounterStore::new()) as Arc<dyn crate::ledger::CounterStore>);
        let tokens = Arc::new(TokenBudget::new(
            counter_store,
            config.budget.daily_token_limit,
            config.environment,
        ));
        let costs = Arc::new(CostLedger::new(
            PricingTable::default(),
            config.budget.max_cost_usd,
        ));

        let job_store = Arc::new(SqliteJobStore::new(store.handle()));
        let queue = Arc::new(JobQueue::new(
            Some(job_store as Arc<dyn crate::jobs::JobStore>),
            config.workers.max_attempts,
        ));

        let events: Arc<dyn EventSink> = Arc::new(TracingSink);

        // Provider capabilities under the availability policy.
        let parser: Option<Arc<dyn DocumentParser>> = config.providers.docparse_url.clone().map(
            |url| {
                Arc::new(HttpDocumentParser::new(
                    url,
                    config.providers.zerox_model.clone(),
                    config.providers.tesseract_enabled,
                )) as Arc<dyn DocumentParser>
            },
        );
        let transcriber_handle: Option<Arc<dyn Transcriber>> = config
            .providers
            .deepgram_api_key
            .clone()
            .map(|key| Arc::new(DeepgramClient::new(key)) as Arc<dyn Transcriber>);
        let scraper: Option<Arc<dyn Scraper>> = config
            .providers
            .crawl4ai_url
            .clone()
            .map(|url| Arc::new(Crawl4AiClient::new(url)) as Arc<dyn Scraper>);

        let memory = match (
            config.providers.mem0_api_key.clone(),
            config.providers.zep_api_key.clone(),
        ) {
            (Some(key), _) => {
                Capability::Configured(Arc::new(MemoryClient::mem0(key)) as Arc<dyn MemoryStore>)
            }
            (None, Some(key)) => {
                Capability::Configured(Arc::new(MemoryClient::zep(key)) as Arc<dyn MemoryStore>)
            }
            (None, None) => Capability::unconfigured("MEM0_API_KEY / ZEP_API_KEY not set"),
        };
        let tools = match config.providers.composio_api_key.clone() {
            Some(key) => {
                Capability::Configured(Arc::new(ComposioClient::new(key)) as Arc<dyn ToolExecutor>)
            }
            None => Capability::unconfigured("COMPOSIO_API_KEY not set"),
        };
        let finetune = match config.providers.openpipe_api_key.clone() {
            Some(key) => {
                Capability::Configured(Arc::new(OpenPipeClient::new(key)) as Arc<dyn FineTuner>)
            }
            None => Capability::unconfigured("OPENPIPE_API_KEY not set"),
        };
        let transcriber = match transcriber_handle.clone() {
            Some(handle) => Capability::Configured(handle),
            None => Capability::unconfigured("DEEPGRAM_API_KEY not set"),
        };

        let registry = IngesterRegistry::new(parser, transcriber_handle, scraper);
        let ingest = Arc::new(IngestService::new(
            store.clone(),
            vectors.clone(),
            llm.clone(),
            router.clone(),
            registry,
            tokens.clone(),
            costs.clone(),
            queue.clone(),
            events.clone(),
            config.ingest.clone(),
        ));

        let prompts = Arc::new(PromptEngine::new(store.clone(), None));
        let preferences = Arc::new(PreferenceService::new(store.clone()));
        let generations = Arc::new(GenerationService::new(store.clone(), events.clone()));
        let guardrails = Arc::new(GuardrailScanner::new(Some(llm.clone())));

        let auth = AuthVerifier::new(&config.auth);
        let bot = BotVerifier::new(
            config.auth.turnstile_secret_key.clone(),
            config.environment == Environment::Production,
        );

        Ok(Arc::new(Self {
            start_time: Instant::now(),
            store,
            vectors,
            llm,
            router,
            ingest,
            prompts,
            preferences,
            generations,
            guardrails,
            tokens,
            costs,
            queue,
            auth,
            bot,
            memory,
            tools,
            finetune,
            transcriber,
            events,
            config,
        }))
    }

    /// Spawn the worker pool bound to the shutdown signal.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let job_store = self.queue.store()?;
        let pool = WorkerPool::new(
            job_store,
            self.ingest.clone(),
            self.events.clone(),
            self.config.workers.clone(),
        );
        Some(tokio::spawn(async move { pool.run(shutdown).await }))
    }
}

/// Build the router with the full governor chain.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);

    let mut router = Router::new()
        .route("/api/health", get(routes::health::health))
        // Prompts
        .route("/api/prompts", post(routes::prompts::create))
        .route("/api/prompts/:name/active", get(routes::prompts::get_active))
        .route(
            "/api/prompts/:name/versions",
            get(routes::prompts::list_versions),
        )
        .route("/api/prompts/:name/promote", post(routes::prompts::promote))
        .route("/api/prompts/:name/traffic", patch(routes::prompts::set_traffic))
        .route("/api/prompts/:name/eval", patch(routes::prompts::set_eval_score))
        // Documents & embeddings
        .route("/api/documents", post(routes::documents::create_document))
        .route(
            "/api/documents/upload",
            post(routes::documents::upload_document),
        )
        .route("/api/ingest", post(routes::documents::ingest))
        .route(
            "/api/embeddings",
            post(routes::documents::create_embedding),
        )
        .route("/api/embeddings/search", get(routes::documents::search))
        // Generations & feedback
        .route(
            "/api/generations",
            get(routes::generations::list_generations).post(routes::generations::log_generation),
        )
        .route("/api/generations/stats", get(routes::generations::stats))
        .route(
            "/api/feedback/:id",
            patch(routes::generations::attach_feedback),
        )
        .route(
            "/api/feedback/:id/outcome",
            post(routes::generations::record_outcome),
        )
        // Preferences & few-shot
        .route(
            "/api/preferences/infer-all",
            post(routes::preferences::infer_all),
        )
        .route(
            "/api/preferences/:id",
            get(routes::preferences::list_preferences).post(routes::preferences::create_preference),
        )
        .route(
            "/api/preferences/:id/infer",
            post(routes::preferences::infer_for_user),
        )
        .route(
            "/api/preferences/:id/:key",
            get(routes::preferences::get_preference)
                .patch(routes::preferences::update_preference)
                .delete(routes::preferences::delete_preference),
        )
        .route(
            "/api/fewshot",
            get(routes::preferences::list_few_shot).post(routes::preferences::create_few_shot),
        )
        // Memory
        .route("/api/memory", post(routes::providers::add_memory))
        .route("/api/memory/search", get(routes::providers::search_memory))
        .route(
            "/api/memory/:id",
            get(routes::providers::get_all_memories).delete(routes::providers::delete_memory),
        )
        // Tools
        .route("/api/composio/actions", get(routes::providers::list_actions))
        .route(
            "/api/composio/execute",
            post(routes::providers::execute_action),
        )
        // Fine-tuning
        .route(
            "/api/openpipe/log",
            post(routes::providers::log_fine_tune_calls),
        )
        .route(
            "/api/openpipe/finetune",
            post(routes::providers::trigger_fine_tune),
        )
        .route(
            "/api/openpipe/finetune/:id",
            get(routes::providers::fine_tune_status),
        )
        // Transcription
        .route("/api/transcribe", post(routes::providers::transcribe))
        // Costs
        .route("/api/costs", get(routes::costs::get_costs))
        .route("/api/costs/reset", post(routes::costs::reset_costs))
        .fallback(not_found)
        .layer(from_fn_with_state(state.clone(), governor_middleware))
        .layer(from_fn_with_state(state.clone(), deadline_middleware))
        .layer(from_fn(rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    router
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "route not found", "code": "not_found" })),
    )
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::HeaderName::from_static("x-api-key"),
        header::HeaderName::from_static("x-admin-key"),
        header::HeaderName::from_static("x-turnstile-token"),
        header::HeaderName::from_static("x-document-title"),
    ];

    if !config.server.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = config
            .server
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        return Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(methods)
                .allow_headers(headers),
        );
    }

    if config.environment.is_production() {
        // No allow-list in production: no Access-Control-Allow-Origin at all.
        None
    } else {
        Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(methods)
                .allow_headers(headers),
        )
    }
}

/// Serve until the shutdown signal flips. Exit code semantics live in the
/// binary: clean shutdown returns `Ok`.
pub async fn serve(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Result<(), RuntimeError> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RuntimeError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "HTTP server listening");

    let worker_handle = state.spawn_workers(shutdown.clone());

    let mut signal = shutdown.clone();
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = signal.changed().await;
    })
    .await
    .map_err(|e| RuntimeError::Internal(format!("server error: {e}")))?;

    if let Some(handle) = worker_handle {
        // The worker pool observes the same signal and drains itself.
        let _ = handle.await;
    }
    Ok(())
}
