//! Ingestion pipeline
//!
//! Synchronous path: adapter → hash dedup → chunk → token budget gate →
//! batched embed → persist document + rows → enqueue follow-ups. An embed
//! failure is recovered locally: the document persists with zero chunks,
//! flagged `partialFailure`, and a retry job is enqueued.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::adapters::{IngestedContent, IngesterRegistry, RawInput};
use super::chunking::chunk_text;
use super::dedup::{dedupe_records, near_duplicate_check};
use super::freshness;
use crate::config::IngestConfig;
use crate::extract::extract_json;
use crate::jobs::{JobHandler, JobPayload, JobQueue};
use crate::ledger::{CostLedger, TokenBudget};
use crate::llm::{estimate_tokens, LlmClient, ModelRouter};
use crate::storage::SqliteStore;
use crate::telemetry::{EventSink, TelemetryEvent};
use crate::types::{
    BudgetError, ChunkStrategy, Document, DocumentId, EmbeddingId, EmbeddingRow,
    EnrichmentStatus, IngestError, JobError, RuntimeError,
};
use crate::vector::VectorStore;

/// One ingestion request after transport decoding.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub input: RawInput,
    pub user_id: String,
    pub chunk_strategy: ChunkStrategy,
    pub model_override: Option<String>,
    pub task_type: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Identifier fields for entity-level dedup of structured sources.
    pub entity_id_fields: Vec<String>,
}

/// Receipt for a newly persisted document.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReceipt {
    pub document_id: DocumentId,
    pub chunks_created: usize,
    pub embeddings_generated: bool,
    pub embedding_model_id: Option<String>,
    pub content_hash: String,
    /// Whether every follow-up job landed in the queue.
    pub queued: bool,
}

/// Outcome of the synchronous path.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Byte-identical content already ingested.
    Duplicate { document_id: DocumentId },
    Created(IngestReceipt),
}

/// The ingestion pipeline and its background job processors.
pub struct IngestService {
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    router: ModelRouter,
    registry: IngesterRegistry,
    tokens: Arc<TokenBudget>,
    costs: Arc<CostLedger>,
    queue: Arc<JobQueue>,
    events: Arc<dyn EventSink>,
    config: IngestConfig,
}

impl IngestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        router: ModelRouter,
        registry: IngesterRegistry,
        tokens: Arc<TokenBudget>,
        costs: Arc<CostLedger>,
        queue: Arc<JobQueue>,
        events: Arc<dyn EventSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            llm,
            router,
            registry,
            tokens,
            costs,
            queue,
            events,
            config,
        }
    }

    /// Full synchronous ingestion.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, RuntimeError> {
        let content = self
            .registry
            .ingest(&request.input)
            .await?
            .ok_or_else(|| IngestError::UnsupportedType(request.input.mime_type.clone()))?;

        // Exact-hash dedup short-circuits to the existing id.
        if let Some(existing) = self.store.find_document_by_hash(&content.content_hash).await? {
            tracing::info!(document_id = %existing.id, "duplicate ingest short-circuited");
            return Ok(IngestOutcome::Duplicate {
                document_id: existing.id,
            });
        }

        // Entity dedup for structured sources with declared identifiers.
        let content = self.entity_dedup(content, &request.entity_id_fields);

        self.persist_new(content, &request).await.map(IngestOutcome::Created)
    }

    fn entity_dedup(&self, content: IngestedContent, id_fields: &[String]) -> IngestedContent {
        if id_fields.is_empty() || content.raw_source.is_none() {
            return content;
        }
        let Some(records) = content
            .raw_source
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(raw).ok())
        else {
            return content;
        };

        let total = records.len();
        let (unique, dropped) = dedupe_records(records, id_fields);
        if dropped == 0 {
            return content;
        }
        tracing::info!(total, dropped, "entity dedup removed duplicate records");

        let text = unique
            .iter()
            .map(|record| match record.as_object() {
                Some(map) => map
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("; "),
                None => record.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = content.metadata.clone();
        metadata.insert("entityDedupDropped".to_string(), serde_json::json!(dropped));
        IngestedContent {
            content_hash: super::adapters::content_hash(&text),
            text,
            metadata,
            ..content
        }
    }

    async fn persist_new(
        &self,
        content: IngestedContent,
        request: &IngestRequest,
    ) -> Result<IngestReceipt, RuntimeError> {
        let chunks = chunk_text(
            &content.text,
            request.chunk_strategy,
            self.config.chunk_size_chars,
            self.config.chunk_overlap_chars,
        );
        if chunks.is_empty() {
            return Err(IngestError::EmptyBody.into());
        }

        // Budget gates: per-user tokens, then the process cost cap.
        let estimate = estimate_tokens(&content.text);
        let decision = self.tokens.check(&request.user_id, estimate).await;
        if !decision.allowed {
            self.events
                .emit(
                    TelemetryEvent::new("budget_denied")
                        .with("user_id", request.user_id.clone())
                        .with("estimate", estimate)
                        .with("remaining", decision.remaining),
                )
                .await;
            return Err(BudgetError::TokensExceeded {
                limit: decision.limit,
                used: decision.limit - decision.remaining,
                remaining: decision.remaining,
            }
            .into());
        }
        self.costs.ensure_budget()?;

        let model = self.router.embedding_model(
            request.model_override.as_deref(),
            &content.text,
            request.task_type.as_deref(),
        );

        let document_id = DocumentId::new();
        let started = Instant::now();
        let embed_result = self.llm.embed_batch(&model, &chunks).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.costs.record_call(
            "ingest",
            &model,
            estimate as u32,
            0,
            latency_ms,
            embed_result.is_ok(),
        );

        let title = request
            .input
            .title
            .clone()
            .unwrap_or_else(|| default_title(&content.text));

        let mut metadata = content.metadata.clone();
        let mut document = Document {
            id: document_id,
            title,
            source_type: content.source_type,
            source_url: request.input.source_url.clone(),
            mime_type: content.mime_type.clone(),
            content_hash: content.content_hash.clone(),
            chunk_count: 0,
            embedding_model_id: None,
            raw_content: Some(content.text.clone()),
            chunk_strategy: request.chunk_strategy,
            ingested_at: Utc::now(),
            source_updated_at: request.source_updated_at,
            valid_until: request.valid_until,
            metadata: HashMap::new(),
            enrichment_status: EnrichmentStatus::Pending,
        };

        match embed_result {
            Ok(vectors) => {
                document.chunk_count = chunks.len() as u32;
                document.embedding_model_id = Some(model.clone());
                document.metadata = metadata;
                self.store.insert_document(&document).await?;

                let rows = embedding_rows(&document, &chunks, vectors, &model);
                self.vectors.upsert(&model, document_id, rows).await?;

                let queued = self.enqueue_followups(&document, &model).await;
                Ok(IngestReceipt {
                    document_id,
                    chunks_created: chunks.len(),
                    embeddings_generated: true,
                    embedding_model_id: Some(model),
                    content_hash: content.content_hash,
                    queued,
                })
            }
            Err(e) => {
                // Fail-open: the document persists without embeddings and a
                // retry runs in the background.
                tracing::warn!(error = %e, document_id = %document_id, "embedding failed, persisting partial");
                metadata.insert("partialFailure".to_string(), serde_json::json!(true));
                document.metadata = metadata;
                self.store.insert_document(&document).await?;

                let queued = self
                    .queue
                    .enqueue(JobPayload::Embed {
                        document_id,
                        model_id: Some(model.clone()),
                    })
                    .await;

                Ok(IngestReceipt {
                    document_id,
                    chunks_created: 0,
                    embeddings_generated: false,
                    embedding_model_id: None,
                    content_hash: content.content_hash,
                    queued,
                })
            }
        }
    }

    /// Fire-and-forget follow-ups. Enqueue failure never fails the request;
    /// it is reported through the receipt.
    async fn enqueue_followups(&self, document: &Document, model: &str) -> bool {
        let mut queued = self
            .queue
            .enqueue(JobPayload::Enrich {
                document_id: document.id,
            })
            .await;
        queued &= self
            .queue
            .enqueue(JobPayload::DedupCheck {
                document_id: document.id,
                model_id: model.to_string(),
            })
            .await;
        if let Some(valid_until) = document.valid_until {
            queued &= self
                .queue
                .enqueue_delayed(
                    JobPayload::Freshness {
                        document_id: document.id,
                    },
                    valid_until,
                )
                .await;
        }
        queued
    }

    // ── Job processors (idempotent; at-least-once delivery) ──────────

    async fn process_embed(
        &self,
        document_id: DocumentId,
        model_override: Option<&str>,
    ) -> Result<(), JobError> {
        let document = self
            .store
            .get_document(document_id)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?
            .ok_or_else(|| JobError::ProcessingFailed(format!("document {document_id} missing")))?;

        let Some(text) = document.raw_content.clone() else {
            return Err(JobError::ProcessingFailed(
                "document has no raw content to embed".to_string(),
            ));
        };

        let chunks = chunk_text(
            &text,
            document.chunk_strategy,
            self.config.chunk_size_chars,
            self.config.chunk_overlap_chars,
        );
        if chunks.is_empty() {
            return Err(JobError::ProcessingFailed("no chunks produced".to_string()));
        }

        let model = self.router.embedding_model(model_override, &text, None);

        let started = Instant::now();
        let vectors = self.llm.embed_batch(&model, &chunks).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.costs.record_call(
            "worker:embed",
            &model,
            estimate_tokens(&text) as u32,
            0,
            latency_ms,
            vectors.is_ok(),
        );
        let vectors = vectors.map_err(|e| JobError::ProcessingFailed(e.to_string()))?;

        // Delete-then-insert per document, then flip the document state.
        let rows = embedding_rows(&document, &chunks, vectors, &model);
        self.vectors
            .upsert(&model, document_id, rows)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;
        self.store
            .set_embedding_state(document_id, chunks.len() as u32, Some(&model))
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;
        Ok(())
    }

    async fn process_enrich(&self, document_id: DocumentId) -> Result<(), JobError> {
        let document = self
            .store
            .get_document(document_id)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?
            .ok_or_else(|| JobError::ProcessingFailed(format!("document {document_id} missing")))?;

        let Some(text) = document.raw_content.as_deref() else {
            self.store
                .set_enrichment_status(document_id, EnrichmentStatus::Skipped)
                .await
                .map_err(|e| JobError::Store(e.to_string()))?;
            return Ok(());
        };

        let sample: String = text.chars().take(4_000).collect();
        let chat = self
            .llm
            .chat(
                "gpt-4o-mini",
                "Extract document metadata. Reply with JSON only: \
                 {\"summary\": string, \"keywords\": [string], \"language\": string}",
                &sample,
            )
            .await;

        match chat {
            Ok(output) => {
                self.costs.record_call(
                    "worker:enrich",
                    "gpt-4o-mini",
                    output.input_tokens,
                    output.output_tokens,
                    0,
                    true,
                );
                match extract_json(&output.content) {
                    Some(enrichment) => {
                        self.store
                            .merge_document_metadata(document_id, "enrichment", enrichment)
                            .await
                            .map_err(|e| JobError::Store(e.to_string()))?;
                        self.store
                            .set_enrichment_status(document_id, EnrichmentStatus::Enriched)
                            .await
                            .map_err(|e| JobError::Store(e.to_string()))?;
                        Ok(())
                    }
                    None => {
                        self.store
                            .set_enrichment_status(document_id, EnrichmentStatus::Failed)
                            .await
                            .map_err(|e| JobError::Store(e.to_string()))?;
                        Err(JobError::ProcessingFailed(
                            "unparseable enrichment output".to_string(),
                        ))
                    }
                }
            }
            Err(e) => {
                self.store
                    .set_enrichment_status(document_id, EnrichmentStatus::Failed)
                    .await
                    .map_err(|e| JobError::Store(e.to_string()))?;
                Err(JobError::ProcessingFailed(e.to_string()))
            }
        }
    }

    async fn process_dedup_check(
        &self,
        document_id: DocumentId,
        model_id: &str,
    ) -> Result<(), JobError> {
        let rows = self
            .vectors
            .rows_for_document(document_id)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;
        let chunk_vectors: Vec<Vec<f32>> = rows.into_iter().map(|r| r.vector).collect();

        let result = near_duplicate_check(
            &self.vectors,
            model_id,
            document_id,
            &chunk_vectors,
            self.config.near_dup_threshold,
        )
        .await
        .map_err(|e| JobError::Store(e.to_string()))?;

        // Marker only: near-duplicates are flagged, never rejected.
        self.store
            .merge_document_metadata(
                document_id,
                "nearDuplicate",
                serde_json::json!({
                    "isNearDuplicate": result.is_near_duplicate,
                    "nearestSimilarity": result.nearest_similarity,
                    "nearestDocumentId": result.nearest_document.map(|id| id.to_string()),
                }),
            )
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;
        Ok(())
    }

    async fn process_freshness(&self, document_id: DocumentId) -> Result<(), JobError> {
        let document = self
            .store
            .get_document(document_id)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?
            .ok_or_else(|| JobError::ProcessingFailed(format!("document {document_id} missing")))?;

        let class = freshness::classify(document.ingested_at, document.valid_until, Utc::now());
        self.store
            .merge_document_metadata(document_id, "freshness", serde_json::json!(class))
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;
        Ok(())
    }

    async fn process_scrape(&self, url: &str, title: Option<&str>) -> Result<(), JobError> {
        let input = RawInput {
            mime_type: "text/uri-list".to_string(),
            body: url.as_bytes().to_vec(),
            source_url: Some(url.to_string()),
            title: title.map(str::to_string),
        };
        let request = IngestRequest {
            input,
            user_id: "system".to_string(),
            chunk_strategy: ChunkStrategy::Semantic,
            model_override: None,
            task_type: None,
            valid_until: None,
            source_updated_at: None,
            entity_id_fields: Vec::new(),
        };
        // Hash dedup inside `ingest` guards the insert; rerunning the same
        // scrape converges on the same document.
        match self.ingest(request).await {
            Ok(_) => Ok(()),
            Err(e) => Err(JobError::ProcessingFailed(e.to_string())),
        }
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }
}

#[async_trait]
impl JobHandler for IngestService {
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobError> {
        match payload {
            JobPayload::Embed {
                document_id,
                model_id,
            } => {
                self.process_embed(*document_id, model_id.as_deref())
                    .await
            }
            JobPayload::ReEmbed {
                document_id,
                model_id,
            } => self.process_embed(*document_id, Some(model_id)).await,
            JobPayload::Enrich { document_id } => self.process_enrich(*document_id).await,
            JobPayload::DedupCheck {
                document_id,
                model_id,
            } => self.process_dedup_check(*document_id, model_id).await,
            JobPayload::Freshness { document_id } => self.process_freshness(*document_id).await,
            JobPayload::Scrape { url, title } => {
                self.process_scrape(url, title.as_deref()).await
            }
        }
    }
}

fn default_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("untitled");
    first_line.chars().take(80).collect()
}

fn embedding_rows(
    document: &Document,
    chunks: &[String],
    vectors: Vec<Vec<f32>>,
    model: &str,
) -> Vec<EmbeddingRow> {
    chunks
        .iter()
        .zip(vectors)
        .enumerate()
        .map(|(index, (chunk, vector))| {
            let mut metadata = HashMap::new();
            metadata.insert("chunkIndex".to_string(), serde_json::json!(index));
            EmbeddingRow {
                id: EmbeddingId::new(),
                source_type: document.source_type,
                source_id: document.id,
                content_hash: super::adapters::content_hash(chunk),
                vector,
                model_id: model.to_string(),
                metadata,
                created_at: Utc::now(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::jobs::SqliteJobStore;
    use crate::ledger::{InMemoryCounterStore, PricingTable};
    use crate::llm::MockLlmClient;
    use crate::telemetry::TracingSink;
    use crate::vector::SqliteVectorStore;

    struct Fixture {
        service: IngestService,
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        jobs: Arc<SqliteJobStore>,
    }

    fn fixture_with(llm: Arc<dyn LlmClient>, token_limit: u64) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.handle()));
        let jobs = Arc::new(SqliteJobStore::new(store.handle()));
        let queue = Arc::new(JobQueue::new(Some(jobs.clone()), 5));
        let tokens = Arc::new(TokenBudget::new(
            Some(Arc::new(InMemoryCounterStore::new())),
            token_limit,
            Environment::Development,
        ));
        let costs = Arc::new(CostLedger::new(PricingTable::default(), 100.0));
        let service = IngestService::new(
            store.clone(),
            vectors.clone(),
            llm,
            ModelRouter::new(true),
            IngesterRegistry::new(None, None, None),
            tokens,
            costs,
            queue,
            Arc::new(TracingSink),
            IngestConfig::default(),
        );
        Fixture {
            service,
            store,
            vectors,
            jobs,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MockLlmClient::new(64)), 1_000_000)
    }

    fn text_request(body: &str) -> IngestRequest {
        IngestRequest {
            input: RawInput {
                mime_type: "text/plain".to_string(),
                body: body.as_bytes().to_vec(),
                source_url: None,
                title: Some("A".to_string()),
            },
            user_id: "u1".to_string(),
            chunk_strategy: ChunkStrategy::Fixed,
            model_override: None,
            task_type: None,
            valid_until: None,
            source_updated_at: None,
            entity_id_fields: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ingest_persists_document_and_embeddings() {
        let fx = fixture();
        let outcome = fx.service.ingest(text_request("hello world")).await.unwrap();
        let IngestOutcome::Created(receipt) = outcome else {
            panic!("expected created");
        };
        assert!(receipt.embeddings_generated);
        assert_eq!(receipt.chunks_created, 1);
        assert!(receipt.queued);

        let doc = fx
            .store
            .get_document(receipt.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.chunk_count, 1);
        assert_eq!(
            doc.embedding_model_id.as_deref(),
            receipt.embedding_model_id.as_deref()
        );

        let rows = fx
            .vectors
            .rows_for_document(receipt.document_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_id, doc.embedding_model_id.unwrap());
    }

    #[tokio::test]
    async fn duplicate_ingest_short_circuits() {
        let fx = fixture();
        let first = fx.service.ingest(text_request("hello")).await.unwrap();
        let IngestOutcome::Created(receipt) = first else {
            panic!("expected created");
        };

        let second = fx.service.ingest(text_request("hello")).await.unwrap();
        let IngestOutcome::Duplicate { document_id } = second else {
            panic!("expected duplicate");
        };
        assert_eq!(document_id, receipt.document_id);

        // No second set of embeddings.
        let rows = fx.vectors.rows_for_document(document_id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn follow_up_jobs_are_enqueued() {
        let fx = fixture();
        let mut request = text_request("content with expiry");
        request.valid_until = Some(Utc::now() + chrono::Duration::days(7));
        fx.service.ingest(request).await.unwrap();

        use crate::jobs::JobStore;
        let claimed = fx.jobs.claim_due(Utc::now(), 10).await.unwrap();
        let kinds: Vec<crate::jobs::JobKind> =
            claimed.iter().map(|j| j.payload.kind()).collect();
        assert!(kinds.contains(&crate::jobs::JobKind::Enrich));
        assert!(kinds.contains(&crate::jobs::JobKind::DedupCheck));
        // Freshness is delayed until valid_until, not yet due.
        assert!(!kinds.contains(&crate::jobs::JobKind::Freshness));
    }

    #[tokio::test]
    async fn token_budget_denial_is_surfaced() {
        let fx = fixture_with(Arc::new(MockLlmClient::new(64)), 2);
        let err = fx
            .service
            .ingest(text_request("a text well over eight characters"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Budget(BudgetError::TokensExceeded { .. })
        ));
    }

    struct FailingEmbedder;

    #[async_trait]
    impl LlmClient for FailingEmbedder {
        async fn embed_batch(
            &self,
            _model: &str,
            _texts: &[String],
        ) -> Result<Vec<Vec<f32>>, crate::types::LlmError> {
            Err(crate::types::LlmError::RequestFailed("proxy down".into()))
        }

        async fn chat(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
        ) -> Result<crate::llm::ChatOutput, crate::types::LlmError> {
            Err(crate::types::LlmError::RequestFailed("proxy down".into()))
        }

        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn embed_failure_persists_partial_and_enqueues_retry() {
        let fx = fixture_with(Arc::new(FailingEmbedder), 1_000_000);
        let outcome = fx.service.ingest(text_request("persist me anyway")).await.unwrap();
        let IngestOutcome::Created(receipt) = outcome else {
            panic!("expected created");
        };
        assert!(!receipt.embeddings_generated);
        assert_eq!(receipt.chunks_created, 0);
        assert!(receipt.queued);

        let doc = fx
            .store
            .get_document(receipt.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.chunk_count, 0);
        assert!(doc.embedding_model_id.is_none());
        assert_eq!(doc.metadata["partialFailure"], serde_json::json!(true));

        use crate::jobs::JobStore;
        let claimed = fx.jobs.claim_due(Utc::now(), 10).await.unwrap();
        assert!(claimed
            .iter()
            .any(|j| j.payload.kind() == crate::jobs::JobKind::Embed));
    }

    #[tokio::test]
    async fn embed_job_is_idempotent() {
        let fx = fixture_with(Arc::new(FailingEmbedder), 1_000_000);
        let outcome = fx.service.ingest(text_request("retry me")).await.unwrap();
        let IngestOutcome::Created(receipt) = outcome else {
            panic!("expected created");
        };

        // Swap in a working embedder by building a second service over the
        // same stores, as the retry worker would after the proxy recovers.
        let store = fx.store.clone();
        let vectors = fx.vectors.clone();
        let working = IngestService::new(
            store.clone(),
            vectors.clone(),
            Arc::new(MockLlmClient::new(64)),
            ModelRouter::new(true),
            IngesterRegistry::new(None, None, None),
            Arc::new(TokenBudget::new(None, 1_000_000, Environment::Development)),
            Arc::new(CostLedger::new(PricingTable::default(), 100.0)),
            Arc::new(JobQueue::unavailable()),
            Arc::new(TracingSink),
            IngestConfig::default(),
        );

        let payload = JobPayload::Embed {
            document_id: receipt.document_id,
            model_id: None,
        };
        working.handle(&payload).await.unwrap();
        let after_first = vectors.rows_for_document(receipt.document_id).await.unwrap();

        working.handle(&payload).await.unwrap();
        let after_second = vectors.rows_for_document(receipt.document_id).await.unwrap();

        assert_eq!(after_first.len(), after_second.len());
        let doc = store.get_document(receipt.document_id).await.unwrap().unwrap();
        assert_eq!(doc.chunk_count as usize, after_second.len());
        assert!(doc.embedding_model_id.is_some());
        // Vectors are identical run to run (mock embeddings are
        // deterministic), so observable state converged.
        assert_eq!(
            after_first.iter().map(|r| r.vector.clone()).collect::<Vec<_>>(),
            after_second.iter().map(|r| r.vector.clone()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn freshness_job_writes_classification() {
        let fx = fixture();
        let outcome = fx.service.ingest(text_request("fresh doc")).await.unwrap();
        let IngestOutcome::Created(receipt) = outcome else {
            panic!("expected created");
        };

        fx.service
            .handle(&JobPayload::Freshness {
                document_id: receipt.document_id,
            })
            .await
            .unwrap();

        let doc = fx
            .store
            .get_document(receipt.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.metadata["freshness"], serde_json::json!("fresh"));
    }

    #[tokio::test]
    async fn dedup_check_flags_near_duplicates() {
        let fx = fixture();
        let IngestOutcome::Created(_first) =
            fx.service.ingest(text_request("the quick brown fox")).await.unwrap()
        else {
            panic!()
        };
        // Identical text would hash-dedup; near-identical text embeds to the
        // same mock vector only if equal, so reuse the same text with a
        // differing title via direct vector insert instead.
        let IngestOutcome::Created(second) =
            fx.service.ingest(text_request("the quick brown fox!")).await.unwrap()
        else {
            panic!()
        };

        fx.service
            .handle(&JobPayload::DedupCheck {
                document_id: second.document_id,
                model_id: second.embedding_model_id.clone().unwrap(),
            })
            .await
            .unwrap();

        let doc = fx
            .store
            .get_document(second.document_id)
            .await
            .unwrap()
            .unwrap();
        let marker = &doc.metadata["nearDuplicate"];
        assert!(marker.get("isNearDuplicate").is_some());
    }

    #[tokio::test]
    async fn enrich_job_sets_status() {
        let fx = fixture();
        let IngestOutcome::Created(receipt) =
            fx.service.ingest(text_request("enrich this")).await.unwrap()
        else {
            panic!()
        };

        fx.service
            .handle(&JobPayload::Enrich {
                document_id: receipt.document_id,
            })
            .await
            .unwrap();

        let doc = fx
            .store
            .get_document(receipt.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.enrichment_status, EnrichmentStatus::Enriched);
        assert!(doc.metadata.contains_key("enrichment"));
    }
}
