//! Embedded vector store backed by SQLite
//!
//! Vectors are stored as little-endian f32 blobs and scanned in process.
//! The trait seam keeps the runtime portable to a pgvector- or HNSW-backed
//! implementation without touching callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::ingest::freshness::freshness_multiplier;
use crate::storage::sqlite::DbHandle;
use crate::types::{DocumentId, EmbeddingId, EmbeddingRow, SourceType, VectorError};
use crate::vector::{cosine_similarity, decode_vector, encode_vector};

/// One search hit, ordered by similarity descending.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KnnHit {
    pub embedding_id: EmbeddingId,
    pub source_type: SourceType,
    pub source_id: DocumentId,
    pub metadata: HashMap<String, serde_json::Value>,
    pub similarity: f32,
}

/// Query options for [`VectorStore::knn`].
#[derive(Debug, Clone, Copy)]
pub struct KnnOptions {
    /// Exclude rows whose document has a past `valid_until` (default on).
    pub freshness_filter: bool,
    /// Multiply similarity by the staleness curve before ranking.
    pub freshness_weight: bool,
}

impl Default for KnnOptions {
    fn default() -> Self {
        Self {
            freshness_filter: true,
            freshness_weight: false,
        }
    }
}

/// Backend-agnostic vector store.
///
/// Every operation is scoped by `model_id`; an empty model id is rejected
/// before any store access.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace all rows for a document atomically (delete-then-insert).
    async fn upsert(
        &self,
        model_id: &str,
        document_id: DocumentId,
        rows: Vec<EmbeddingRow>,
    ) -> Result<usize, VectorError>;

    /// K-nearest-neighbor search over one model's vectors.
    async fn knn(
        &self,
        model_id: &str,
        query: &[f32],
        limit: usize,
        options: KnnOptions,
    ) -> Result<Vec<KnnHit>, VectorError>;

    /// Fetch all rows for a document (re-embed and near-dup checks).
    async fn rows_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<EmbeddingRow>, VectorError>;

    /// Delete all rows for a document. Returns the number removed.
    async fn delete_for_document(&self, document_id: DocumentId) -> Result<usize, VectorError>;

    /// Number of rows stored for a model.
    async fn count_for_model(&self, model_id: &str) -> Result<u64, VectorError>;
}

/// SQLite-backed vector store sharing the runtime's primary connection.
pub struct SqliteVectorStore {
    conn: DbHandle,
}

impl SqliteVectorStore {
    /// Wrap an open database handle. The schema is owned by
    /// [`crate::storage::sqlite::SqliteStore`].
    pub fn new(conn: DbHandle) -> Self {
        Self { conn }
    }
}

fn require_model_id(model_id: &str) -> Result<(), VectorError> {
    if model_id.trim().is_empty() {
        return Err(VectorError::MissingModelId);
    }
    Ok(())
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(
        &self,
        model_id: &str,
        document_id: DocumentId,
        rows: Vec<EmbeddingRow>,
    ) -> Result<usize, VectorError> {
        require_model_id(model_id)?;

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        tx.execute(
            "DELETE FROM embeddings WHERE source_id = ?1",
            rusqlite::params![document_id.to_string()],
        )
        .map_err(|e| VectorError::Backend(e.to_string()))?;

        let inserted = rows.len();
        for row in rows {
            let metadata = serde_json::to_string(&row.metadata)
                .map_err(|e| VectorError::Backend(e.to_string()))?;
            tx.execute(
                "INSERT INTO embeddings
                    (id, source_type, source_id, content_hash, vector, model_id, metadata, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                rusqlite::params![
                    row.id.to_string(),
                    row.source_type.to_string(),
                    document_id.to_string(),
                    row.content_hash,
                    encode_vector(&row.vector),
                    model_id,
                    metadata,
                    row.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| VectorError::Backend(e.to_string()))?;
        }

        tx.commit()
            .map_err(|e| VectorError::Backend(e.to_string()))?;
        Ok(inserted)
    }

    async fn knn(
        &self,
        model_id: &str,
        query: &[f32],
        limit: usize,
        options: KnnOptions,
    ) -> Result<Vec<KnnHit>, VectorError> {
        require_model_id(model_id)?;
        if query.is_empty() {
            return Err(VectorError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }

        let now = Utc::now();
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT e.id, e.source_type, e.source_id, e.vector, e.metadata, e.created_at,
                        d.ingested_at, d.valid_until
                 FROM embeddings e
                 LEFT JOIN documents d ON d.id = e.source_id
                 WHERE e.model_id = ?1",
            )
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        struct Candidate {
            hit: KnnHit,
            created_at: DateTime<Utc>,
        }

        let rows = stmt
            .query_map(rusqlite::params![model_id], |row| {
                let id: String = row.get(0)?;
                let source_type: String = row.get(1)?;
                let source_id: String = row.get(2)?;
                let vector: Vec<u8> = row.get(3)?;
                let metadata: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                let ingested_at: Option<String> = row.get(6)?;
                let valid_until: Option<String> = row.get(7)?;
                Ok((
                    id,
                    source_type,
                    source_id,
                    vector,
                    metadata,
                    created_at,
                    ingested_at,
                    valid_until,
                ))
            })
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        let mut candidates: Vec<Candidate> = Vec::new();
        for row in rows {
            let (id, source_type, source_id, vector, metadata, created_at, ingested_at, valid_until) =
                row.map_err(|e| VectorError::Backend(e.to_string()))?;

            let valid_until = parse_opt_ts(valid_until.as_deref());
            if options.freshness_filter {
                if let Some(expiry) = valid_until {
                    if expiry < now {
                        continue;
                    }
                }
            }

            let stored = decode_vector(&vector);
            let mut similarity = cosine_similarity(query, &stored);
            if options.freshness_weight {
                let ingested = parse_opt_ts(ingested_at.as_deref()).unwrap_or(now);
                similarity *= freshness_multiplier(ingested, valid_until, now);
            }

            candidates.push(Candidate {
                hit: KnnHit {
                    embedding_id: id
                        .parse()
                        .map_err(|e: uuid::Error| VectorError::Backend(e.to_string()))?,
                    source_type: source_type
                        .parse()
                        .map_err(VectorError::Backend)?,
                    source_id: source_id
                        .parse()
                        .map_err(|e: uuid::Error| VectorError::Backend(e.to_string()))?,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    similarity,
                },
                created_at: parse_opt_ts(Some(&created_at)).unwrap_or(now),
            });
        }

        // Descending by similarity; equal similarity breaks toward newer rows.
        candidates.sort_by(|a, b| {
            b.hit
                .similarity
                .partial_cmp(&a.hit.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        candidates.truncate(limit);

        Ok(candidates.into_iter().map(|c| c.hit).collect())
    }

    async fn rows_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<EmbeddingRow>, VectorError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, source_type, source_id, content_hash, vector, model_id, metadata, created_at
                 FROM embeddings WHERE source_id = ?1
                 ORDER BY created_at",
            )
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![document_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let source_type: String = row.get(1)?;
                let source_id: String = row.get(2)?;
                let content_hash: String = row.get(3)?;
                let vector: Vec<u8> = row.get(4)?;
                let model_id: String = row.get(5)?;
                let metadata: String = row.get(6)?;
                let created_at: String = row.get(7)?;
                Ok((
                    id,
                    source_type,
                    source_id,
                    content_hash,
                    vector,
                    model_id,
                    metadata,
                    created_at,
                ))
            })
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, source_type, source_id, content_hash, vector, model_id, metadata, created_at) =
                row.map_err(|e| VectorError::Backend(e.to_string()))?;
            out.push(EmbeddingRow {
                id: id
                    .parse()
                    .map_err(|e: uuid::Error| VectorError::Backend(e.to_string()))?,
                source_type: source_type.parse().map_err(VectorError::Backend)?,
                source_id: source_id
                    .parse()
                    .map_err(|e: uuid::Error| VectorError::Backend(e.to_string()))?,
                content_hash,
                vector: decode_vector(&vector),
                model_id,
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                created_at: parse_opt_ts(Some(&created_at)).unwrap_or_else(Utc::now),
            });
        }
        Ok(out)
    }

    async fn delete_for_document(&self, document_id: DocumentId) -> Result<usize, VectorError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM embeddings WHERE source_id = ?1",
            rusqlite::params![document_id.to_string()],
        )
        .map_err(|e| VectorError::Backend(e.to_string()))
    }

    async fn count_for_model(&self, model_id: &str) -> Result<u64, VectorError> {
        require_model_id(model_id)?;
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE model_id = ?1",
            rusqlite::params![model_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(|e| VectorError::Backend(e.to_string()))
    }
}

fn parse_opt_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use chrono::Duration;

    fn row(doc: DocumentId, model: &str, vector: Vec<f32>, idx: u32) -> EmbeddingRow {
        let mut metadata = HashMap::new();
        metadata.insert("chunkIndex".to_string(), serde_json::json!(idx));
        EmbeddingRow {
            id: EmbeddingId::new(),
            source_type: SourceType::Document,
            source_id: doc,
            content_hash: format!("hash-{idx}"),
            vector,
            model_id: model.to_string(),
            metadata,
            created_at: Utc::now(),
        }
    }

    async fn store() -> (SqliteStore, SqliteVectorStore) {
        let entity_store = SqliteStore::open_in_memory().unwrap();
        let vector_store = SqliteVectorStore::new(entity_store.handle());
        (entity_store, vector_store)
    }

    #[tokio::test]
    async fn upsert_replaces_rows_for_document() {
        let (_entities, vectors) = store().await;
        let doc = DocumentId::new();

        vectors
            .upsert("m1", doc, vec![row(doc, "m1", vec![1.0, 0.0], 0)])
            .await
            .unwrap();
        vectors
            .upsert(
                "m1",
                doc,
                vec![
                    row(doc, "m1", vec![0.0, 1.0], 0),
                    row(doc, "m1", vec![1.0, 1.0], 1),
                ],
            )
            .await
            .unwrap();

        let rows = vectors.rows_for_document(doc).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(vectors.count_for_model("m1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn knn_is_scoped_by_model() {
        let (_entities, vectors) = store().await;
        let doc_a = DocumentId::new();
        let doc_b = DocumentId::new();

        vectors
            .upsert("m1", doc_a, vec![row(doc_a, "m1", vec![1.0, 0.0], 0)])
            .await
            .unwrap();
        vectors
            .upsert("m2", doc_b, vec![row(doc_b, "m2", vec![1.0, 0.0], 0)])
            .await
            .unwrap();

        let hits = vectors
            .knn("m2", &[1.0, 0.0], 10, KnnOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, doc_b);

        let hits = vectors
            .knn("m1", &[1.0, 0.0], 10, KnnOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, doc_a);
    }

    #[tokio::test]
    async fn knn_orders_by_similarity_descending() {
        let (_entities, vectors) = store().await;
        let doc = DocumentId::new();

        vectors
            .upsert(
                "m1",
                doc,
                vec![
                    row(doc, "m1", vec![1.0, 0.0], 0),
                    row(doc, "m1", vec![0.6, 0.8], 1),
                    row(doc, "m1", vec![0.0, 1.0], 2),
                ],
            )
            .await
            .unwrap();

        let hits = vectors
            .knn("m1", &[1.0, 0.0], 2, KnnOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_model_id_is_rejected_before_store_access() {
        let (_entities, vectors) = store().await;
        let err = vectors
            .knn("", &[1.0], 10, KnnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::MissingModelId));

        let err = vectors
            .upsert("  ", DocumentId::new(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::MissingModelId));
    }

    #[tokio::test]
    async fn expired_documents_are_filtered() {
        let (entities, vectors) = store().await;
        let doc = DocumentId::new();

        let mut document = crate::storage::sqlite::tests_support::document_fixture(doc);
        document.valid_until = Some(Utc::now() - Duration::days(1));
        entities.insert_document(&document).await.unwrap();

        vectors
            .upsert("m1", doc, vec![row(doc, "m1", vec![1.0, 0.0], 0)])
            .await
            .unwrap();

        let hits = vectors
            .knn("m1", &[1.0, 0.0], 10, KnnOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = vectors
            .knn(
                "m1",
                &[1.0, 0.0],
                10,
                KnnOptions {
                    freshness_filter: false,
                    freshness_weight: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_for_document_removes_rows() {
        let (_entities, vectors) = store().await;
        let doc = DocumentId::new();
        vectors
            .upsert("m1", doc, vec![row(doc, "m1", vec![1.0, 0.0], 0)])
            .await
            .unwrap();
        assert_eq!(vectors.delete_for_document(doc).await.unwrap(), 1);
        assert_eq!(vectors.count_for_model("m1").await.unwrap(), 0);
    }
}
