//! Deduplication
//!
//! Three layers: exact `content_hash` matches short-circuit in the pipeline,
//! near-duplicates are detected by cosine similarity against existing
//! same-model embeddings (marker only, not a reject), and structured records
//! deduplicate on their declared identifier set.

use std::collections::HashSet;
use std::sync::Arc;

use crate::types::{DocumentId, VectorError};
use crate::vector::{KnnOptions, VectorStore};

/// Default cosine threshold above which a document counts as a near-duplicate.
pub const NEAR_DUP_THRESHOLD: f32 = 0.92;

/// Outcome of a near-duplicate check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NearDupResult {
    pub is_near_duplicate: bool,
    pub nearest_similarity: f32,
    pub nearest_document: Option<DocumentId>,
}

/// Compare a document's centroid against existing same-model embeddings.
///
/// The document's own rows are excluded so a re-check after upsert cannot
/// match itself.
pub async fn near_duplicate_check(
    vectors: &Arc<dyn VectorStore>,
    model_id: &str,
    document_id: DocumentId,
    chunk_vectors: &[Vec<f32>],
    threshold: f32,
) -> Result<NearDupResult, VectorError> {
    let Some(centroid) = centroid(chunk_vectors) else {
        return Ok(NearDupResult {
            is_near_duplicate: false,
            nearest_similarity: 0.0,
            nearest_document: None,
        });
    };

    let hits = vectors
        .knn(
            model_id,
            &centroid,
            8,
            KnnOptions {
                freshness_filter: false,
                freshness_weight: false,
            },
        )
        .await?;

    let nearest = hits.into_iter().find(|hit| hit.source_id != document_id);

    Ok(match nearest {
        Some(hit) => NearDupResult {
            is_near_duplicate: hit.similarity >= threshold,
            nearest_similarity: hit.similarity,
            nearest_document: Some(hit.source_id),
        },
        None => NearDupResult {
            is_near_duplicate: false,
            nearest_similarity: 0.0,
            nearest_document: None,
        },
    })
}

/// Mean vector over all chunks.
fn centroid(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    if dim == 0 {
        return None;
    }
    let mut sum = vec![0.0f32; dim];
    let mut count = 0usize;
    for v in vectors {
        if v.len() != dim {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for s in &mut sum {
        *s /= count as f32;
    }
    Some(sum)
}

/// Deduplicate structured records on their declared identifier fields.
///
/// Records missing every identifier field are kept (no key to collide on).
/// Returns the unique records and the number dropped.
pub fn dedupe_records(
    records: Vec<serde_json::Value>,
    id_fields: &[String],
) -> (Vec<serde_json::Value>, usize) {
    if id_fields.is_empty() {
        return (records, 0);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::new();
    let mut dropped = 0usize;

    for record in records {
        let key: Option<String> = {
            let parts: Vec<String> = id_fields
                .iter()
                .filter_map(|field| record.get(field).map(|v| v.to_string()))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\u{1f}"))
            }
        };

        match key {
            Some(key) => {
                if seen.insert(key) {
                    unique.push(record);
                } else {
                    dropped += 1;
                }
            }
            None => unique.push(record),
        }
    }

    (unique, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::types::{EmbeddingId, EmbeddingRow, SourceType};
    use crate::vector::SqliteVectorStore;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn centroid_of_uniform_vectors() {
        let c = centroid(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(c, vec![0.5, 0.5]);
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn record_dedup_by_composite_key() {
        let records = vec![
            json!({"sku": "a", "region": "eu", "price": 1}),
            json!({"sku": "a", "region": "eu", "price": 2}),
            json!({"sku": "a", "region": "us"}),
            json!({"untagged": true}),
        ];
        let (unique, dropped) =
            dedupe_records(records, &["sku".to_string(), "region".to_string()]);
        assert_eq!(unique.len(), 3);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn record_dedup_without_id_fields_is_a_noop() {
        let records = vec![json!({"a": 1}), json!({"a": 1})];
        let (unique, dropped) = dedupe_records(records, &[]);
        assert_eq!(unique.len(), 2);
        assert_eq!(dropped, 0);
    }

    fn row(doc: DocumentId, vector: Vec<f32>) -> EmbeddingRow {
        EmbeddingRow {
            id: EmbeddingId::new(),
            source_type: SourceType::Document,
            source_id: doc,
            content_hash: "h".to_string(),
            vector,
            model_id: "m1".to_string(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn near_dup_detects_close_documents() {
        let entities = SqliteStore::open_in_memory().unwrap();
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::new(entities.handle()));

        let existing = DocumentId::new();
        vectors
            .upsert("m1", existing, vec![row(existing, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let incoming = DocumentId::new();
        let result = near_duplicate_check(
            &vectors,
            "m1",
            incoming,
            &[vec![0.99, 0.05, 0.0]],
            NEAR_DUP_THRESHOLD,
        )
        .await
        .unwrap();
        assert!(result.is_near_duplicate);
        assert_eq!(result.nearest_document, Some(existing));

        let result = near_duplicate_check(
            &vectors,
            "m1",
            incoming,
            &[vec![0.0, 1.0, 0.0]],
            NEAR_DUP_THRESHOLD,
        )
        .await
        .unwrap();
        assert!(!result.is_near_duplicate);
    }

    #[tokio::test]
    async fn near_dup_excludes_own_document() {
        let entities = SqliteStore::open_in_memory().unwrap();
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::new(entities.handle()));

        let doc = DocumentId::new();
        vectors
            .upsert("m1", doc, vec![row(doc, vec![1.0, 0.0])])
            .await
            .unwrap();

        let result =
            near_duplicate_check(&vectors, "m1", doc, &[vec![1.0, 0.0]], NEAR_DUP_THRESHOLD)
                .await
                .unwrap();
        assert!(!result.is_near_duplicate);
        assert!(result.nearest_document.is_none());
    }
}
