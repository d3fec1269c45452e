//! SQLite-backed entity store
//!
//! One connection in WAL mode behind an async mutex serves the whole
//! process; the vector and job stores share the handle so in-memory databases
//! stay coherent in tests. Schema creation happens once at open.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{
    Document, DocumentId, EnrichmentStatus, Generation, GenerationId, Outcome, PromptVersion,
    PromptVersionId, StorageError, UserFeedback, UserPreference,
};

/// Shared connection handle. All stores in the process serialize through it.
pub type DbHandle = Arc<tokio::sync::Mutex<rusqlite::Connection>>;

/// Result of a preference upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceWrite {
    Inserted,
    Updated,
    /// An explicit row was present and `respect_explicit` was set.
    SkippedExplicit,
}

/// SQLite-backed store for the platform's relational entities.
pub struct SqliteStore {
    conn: DbHandle,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| StorageError::Sqlite(e.to_string()))?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    /// Resolve a `DATABASE_URL` value into a store. Accepts `sqlite://path`,
    /// a bare filesystem path, or `:memory:`.
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        if path == ":memory:" {
            Self::open_in_memory()
        } else {
            Self::open(Path::new(path))
        }
    }

    /// Clone the underlying connection handle for sibling stores.
    pub fn handle(&self) -> DbHandle {
        Arc::clone(&self.conn)
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StorageError::Sqlite(e.to_string()))
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS documents (
                id                 TEXT PRIMARY KEY,
                title              TEXT NOT NULL,
                source_type        TEXT NOT NULL,
                source_url         TEXT,
                mime_type          TEXT NOT NULL,
                content_hash       TEXT NOT NULL UNIQUE,
                chunk_count        INTEGER NOT NULL DEFAULT 0,
                embedding_model_id TEXT,
                raw_content        TEXT,
                chunk_strategy     TEXT NOT NULL DEFAULT 'fixed',
                ingested_at        TEXT NOT NULL,
                source_updated_at  TEXT,
                valid_until        TEXT,
                metadata           TEXT NOT NULL DEFAULT '{}',
                enrichment_status  TEXT NOT NULL DEFAULT 'pending'
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                id            TEXT PRIMARY KEY,
                source_type   TEXT NOT NULL,
                source_id     TEXT NOT NULL,
                content_hash  TEXT NOT NULL,
                vector        BLOB NOT NULL,
                model_id      TEXT NOT NULL,
                metadata      TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_source ON embeddings(source_id);

            CREATE TABLE IF NOT EXISTS prompt_versions (
                id           TEXT PRIMARY KEY,
                prompt_name  TEXT NOT NULL,
                version      TEXT NOT NULL,
                content      TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                eval_score   REAL,
                active_pct   INTEGER NOT NULL DEFAULT 0,
                author       TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                UNIQUE (prompt_name, version)
            );

            CREATE INDEX IF NOT EXISTS idx_prompt_versions_name ON prompt_versions(prompt_name);

            CREATE TABLE IF NOT EXISTS generations (
                id                  TEXT PRIMARY KEY,
                created_at          TEXT NOT NULL,
                user_id             TEXT NOT NULL,
                session_id          TEXT,
                prompt_hash         TEXT NOT NULL,
                prompt_version      TEXT,
                task_type           TEXT NOT NULL,
                input_tokens        INTEGER NOT NULL,
                response_hash       TEXT NOT NULL,
                output_tokens       INTEGER NOT NULL,
                model               TEXT NOT NULL,
                model_version       TEXT,
                latency_ms          INTEGER NOT NULL,
                cost_usd            REAL NOT NULL,
                user_feedback       TEXT,
                feedback_at         TEXT,
                thumbs              INTEGER,
                user_edit_diff      TEXT,
                quality_score       REAL,
                hallucination       INTEGER NOT NULL DEFAULT 0,
                guardrail_triggered TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_generations_user ON generations(user_id, created_at);

            CREATE TABLE IF NOT EXISTS outcomes (
                id            TEXT PRIMARY KEY,
                generation_id TEXT NOT NULL,
                user_id       TEXT NOT NULL,
                outcome_type  TEXT NOT NULL,
                outcome_value REAL NOT NULL,
                created_at    TEXT NOT NULL,
                FOREIGN KEY (generation_id) REFERENCES generations(id)
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                preference_key   TEXT NOT NULL,
                preference_value TEXT NOT NULL,
                source           TEXT NOT NULL,
                confidence       REAL NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE (user_id, preference_key)
            );

            CREATE TABLE IF NOT EXISTS few_shot_entries (
                id                   TEXT PRIMARY KEY,
                task_type            TEXT NOT NULL,
                input_text           TEXT NOT NULL,
                output_text          TEXT NOT NULL,
                quality_score        REAL NOT NULL,
                source_generation_id TEXT,
                curated_by           TEXT NOT NULL,
                is_active            INTEGER NOT NULL DEFAULT 1,
                metadata             TEXT NOT NULL DEFAULT '{}',
                created_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id           TEXT PRIMARY KEY,
                job_type     TEXT NOT NULL,
                document_id  TEXT,
                payload      TEXT NOT NULL,
                attempts     INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                state        TEXT NOT NULL DEFAULT 'queued',
                delay_until  TEXT,
                last_error   TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, delay_until);",
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

// ── Documents ─────────────────────────────────────────────────────────

impl SqliteStore {
    pub async fn insert_document(&self, doc: &Document) -> Result<(), StorageError> {
        let metadata = serde_json::to_string(&doc.metadata)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO documents
                (id, title, source_type, source_url, mime_type, content_hash, chunk_count,
                 embedding_model_id, raw_content, chunk_strategy, ingested_at,
                 source_updated_at, valid_until, metadata, enrichment_status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                doc.id.to_string(),
                doc.title,
                doc.source_type.to_string(),
                doc.source_url,
                doc.mime_type,
                doc.content_hash,
                doc.chunk_count,
                doc.embedding_model_id,
                doc.raw_content,
                doc.chunk_strategy.to_string(),
                doc.ingested_at.to_rfc3339(),
                doc.source_updated_at.map(|t| t.to_rfc3339()),
                doc.valid_until.map(|t| t.to_rfc3339()),
                metadata,
                doc.enrichment_status.to_string(),
            ],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_document)
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        flatten_opt(result)
    }

    pub async fn find_document_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<Document>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ?1"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![content_hash], row_to_document)
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        flatten_opt(result)
    }

    /// Update the embed result. The `(chunk_count > 0) ↔ model set` invariant
    /// is enforced here rather than trusted from callers.
    pub async fn set_embedding_state(
        &self,
        id: DocumentId,
        chunk_count: u32,
        embedding_model_id: Option<&str>,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(chunk_count > 0, embedding_model_id.is_some());
        let (chunk_count, model) = if embedding_model_id.is_some() {
            (chunk_count, embedding_model_id)
        } else {
            (0, None)
        };
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE documents SET chunk_count = ?1, embedding_model_id = ?2 WHERE id = ?3",
                rusqlite::params![chunk_count, model, id.to_string()],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::DocumentNotFound(id));
        }
        Ok(())
    }

    pub async fn set_enrichment_status(
        &self,
        id: DocumentId,
        status: EnrichmentStatus,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE documents SET enrichment_status = ?1 WHERE id = ?2",
                rusqlite::params![status.to_string(), id.to_string()],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::DocumentNotFound(id));
        }
        Ok(())
    }

    /// Merge one key into the document's metadata JSON. Used by the
    /// dedup-check and freshness workers to record their classification.
    pub async fn merge_document_metadata(
        &self,
        id: DocumentId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let current: Option<String> = conn
            .query_row(
                "SELECT metadata FROM documents WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;

        let Some(current) = current else {
            return Err(StorageError::DocumentNotFound(id));
        };

        let mut metadata: HashMap<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        metadata.insert(key.to_string(), value);
        let merged = serde_json::to_string(&metadata)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        conn.execute(
            "UPDATE documents SET metadata = ?1 WHERE id = ?2",
            rusqlite::params![merged, id.to_string()],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

// ── Prompt versions ───────────────────────────────────────────────────

impl SqliteStore {
    pub async fn insert_prompt_version(&self, version: &PromptVersion) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO prompt_versions
                (id, prompt_name, version, content, content_hash, eval_score, active_pct,
                 author, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                version.id.to_string(),
                version.prompt_name,
                version.version,
                version.content,
                version.content_hash,
                version.eval_score,
                version.active_pct,
                version.author,
                version.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }

    pub async fn get_prompt_version(
        &self,
        id: PromptVersionId,
    ) -> Result<Option<PromptVersion>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PROMPT_COLUMNS} FROM prompt_versions WHERE id = ?1"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_prompt_version)
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        flatten_opt(result)
    }

    /// All versions of a prompt, insertion-ordered. Callers sort by semver.
    pub async fn versions_for_prompt(
        &self,
        prompt_name: &str,
    ) -> Result<Vec<PromptVersion>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PROMPT_COLUMNS} FROM prompt_versions
                 WHERE prompt_name = ?1 ORDER BY created_at"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![prompt_name], row_to_prompt_version)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    pub async fn set_active_pct(
        &self,
        id: PromptVersionId,
        active_pct: u8,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE prompt_versions SET active_pct = ?1 WHERE id = ?2",
                rusqlite::params![active_pct, id.to_string()],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::PromptVersionNotFound(id));
        }
        Ok(())
    }

    pub async fn set_eval_score(
        &self,
        id: PromptVersionId,
        eval_score: f64,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE prompt_versions SET eval_score = ?1 WHERE id = ?2",
                rusqlite::params![eval_score, id.to_string()],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::PromptVersionNotFound(id));
        }
        Ok(())
    }

    /// Promote one version to 100% and zero its siblings in a single
    /// transaction, so readers never observe an allocation over 100.
    pub async fn promote_exclusive(
        &self,
        id: PromptVersionId,
        prompt_name: &str,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        tx.execute(
            "UPDATE prompt_versions SET active_pct = 0 WHERE prompt_name = ?1",
            rusqlite::params![prompt_name],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = tx
            .execute(
                "UPDATE prompt_versions SET active_pct = 100 WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StorageError::PromptVersionNotFound(id));
        }
        tx.commit().map_err(|e| StorageError::Sqlite(e.to_string()))
    }
}

// ── Generations & outcomes ────────────────────────────────────────────

impl SqliteStore {
    pub async fn insert_generation(&self, generation: &Generation) -> Result<(), StorageError> {
        let guardrails = serde_json::to_string(&generation.guardrail_triggered)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO generations
                (id, created_at, user_id, session_id, prompt_hash, prompt_version, task_type,
                 input_tokens, response_hash, output_tokens, model, model_version, latency_ms,
                 cost_usd, user_feedback, feedback_at, thumbs, user_edit_diff, quality_score,
                 hallucination, guardrail_triggered)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            rusqlite::params![
                generation.id.to_string(),
                generation.created_at.to_rfc3339(),
                generation.user_id,
                generation.session_id,
                generation.prompt_hash,
                generation.prompt_version,
                generation.task_type,
                generation.input_tokens,
                generation.response_hash,
                generation.output_tokens,
                generation.model,
                generation.model_version,
                generation.latency_ms as i64,
                generation.cost_usd,
                generation.user_feedback.map(|f| f.to_string()),
                generation.feedback_at.map(|t| t.to_rfc3339()),
                generation.thumbs.map(i64::from),
                generation.user_edit_diff,
                generation.quality_score,
                generation.hallucination as i32,
                guardrails,
            ],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }

    pub async fn get_generation(
        &self,
        id: GenerationId,
    ) -> Result<Option<Generation>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM generations WHERE id = ?1"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_generation)
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        flatten_opt(result)
    }

    pub async fn list_generations(
        &self,
        user_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Generation>, StorageError> {
        let conn = self.conn.lock().await;
        let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match user_id {
            Some(user) => (
                format!(
                    "SELECT {GENERATION_COLUMNS} FROM generations
                     WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ),
                vec![
                    Box::new(user.to_string()),
                    Box::new(limit as i64),
                    Box::new(offset as i64),
                ],
            ),
            None => (
                format!(
                    "SELECT {GENERATION_COLUMNS} FROM generations
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ),
                vec![Box::new(limit as i64), Box::new(offset as i64)],
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_generation)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    /// Generations in the stats window, newest first.
    pub async fn generations_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Generation>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM generations
                 WHERE user_id = ?1 AND created_at >= ?2 ORDER BY created_at DESC"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![user_id, since.to_rfc3339()],
                row_to_generation,
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    /// Rows carrying any feedback signal, for preference inference.
    pub async fn feedback_generations(
        &self,
        user_id: &str,
    ) -> Result<Vec<Generation>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM generations
                 WHERE user_id = ?1 AND (user_feedback IS NOT NULL OR thumbs IS NOT NULL)
                 ORDER BY created_at DESC"
            ))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![user_id], row_to_generation)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    /// Users that have at least one feedback-bearing generation.
    pub async fn feedback_user_ids(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM generations
                 WHERE user_feedback IS NOT NULL OR thumbs IS NOT NULL",
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Sqlite(e.to_string()))
    }

    /// Attach feedback. Last writer wins on the fields, but `feedback_at` is
    /// stamped only once.
    pub async fn attach_feedback(
        &self,
        id: GenerationId,
        user_feedback: Option<UserFeedback>,
        thumbs: Option<i8>,
        user_edit_diff: Option<&str>,
    ) -> Result<Generation, StorageError> {
        {
            let conn = self.conn.lock().await;
            let rows = conn
                .execute(
                    "UPDATE generations SET
                        user_feedback = COALESCE(?1, user_feedback),
                        thumbs = COALESCE(?2, thumbs),
                        user_edit_diff = COALESCE(?3, user_edit_diff),
                        feedback_at = COALESCE(feedback_at, ?4)
                     WHERE id = ?5",
                    rusqlite::params![
                        user_feedback.map(|f| f.to_string()),
                        thumbs.map(i64::from),
                        user_edit_diff,
                        Utc::now().to_rfc3339(),
                        id.to_string(),
                    ],
                )
                .map_err(|e| StorageError::Sqlite(e.to_string()))?;
            if rows == 0 {
                return Err(StorageError::GenerationNotFound(id));
            }
        }
        self.get_generation(id)
            .await?
            .ok_or(StorageError::GenerationNotFound(id))
    }

    pub async fn insert_outcome(&self, outcome: &Outcome) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO outcomes (id, generation_id, user_id, outcome_type, outcome_value, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                outcome.id.to_string(),
                outcome.generation_id.to_string(),
                outcome.user_id,
                outcome.outcome_type.to_string(),
                outcome.outcome_value,
                outcome.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }

    pub async fn outcomes_for_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Vec<Outcome>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, generation_id, user_id, outcome_type, outcome_value, created_at
                 FROM outcomes WHERE generation_id = ?1 ORDER BY created_at",
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![generation_id.to_string()], row_to_outcome)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }
}

// ── User preferences ──────────────────────────────────────────────────

impl SqliteStore {
    /// Insert or update a preference. With `respect_explicit`, an existing
    /// `source=explicit` row is left untouched and reported.
    pub async fn upsert_preference(
        &self,
        preference: &UserPreference,
        respect_explicit: bool,
    ) -> Result<PreferenceWrite, StorageError> {
        let value = serde_json::to_string(&preference.preference_value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;

        let existing: Option<String> = conn
            .query_row(
                "SELECT source FROM user_preferences WHERE user_id = ?1 AND preference_key = ?2",
                rusqlite::params![preference.user_id, preference.preference_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;

        match existing {
            Some(source) => {
                if respect_explicit && source == "explicit" {
                    return Ok(PreferenceWrite::SkippedExplicit);
                }
                conn.execute(
                    "UPDATE user_preferences SET
                        preference_value = ?1, source = ?2, confidence = ?3, updated_at = ?4
                     WHERE user_id = ?5 AND preference_key = ?6",
                    rusqlite::params![
                        value,
                        preference.source.to_string(),
                        preference.confidence,
                        Utc::now().to_rfc3339(),
                        preference.user_id,
                        preference.preference_key,
                    ],
                )
                .map_err(|e| StorageError::Sqlite(e.to_string()))?;
                Ok(PreferenceWrite::Updated)
            }
            None => {
                conn.execute(
                    "INSERT INTO user_preferences
                        (id, user_id, preference_key, preference_value, source, confidence,
                         created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        preference.id.to_string(),
                        preference.user_id,
                        preference.preference_key,
                        value,
                        preference.source.to_string(),
                        preference.confidence,
                        preference.created_at.to_rfc3339(),
                        preference.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| StorageError::Sqlite(e.to_string()))?;
                Ok(PreferenceWrite::Inserted)
            }
        }
    }

    pub async fn list_preferences(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserPreference>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, preference_key, preference_value, source, confidence,
                        created_at, updated_at
                 FROM user_preferences WHERE user_id = ?1 ORDER BY preference_key",
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![user_id], row_to_preference)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }

    pub async fn get_preference(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<UserPreference>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, preference_key, preference_value, source, confidence,
                        created_at, updated_at
                 FROM user_preferences WHERE user_id = ?1 AND preference_key = ?2",
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![user_id, key], row_to_preference)
            .optional()
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        flatten_opt(result)
    }

    pub async fn delete_preference(&self, user_id: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM user_preferences WHERE user_id = ?1 AND preference_key = ?2",
                rusqlite::params![user_id, key],
            )
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }
}

// ── Few-shot entries ──────────────────────────────────────────────────

impl SqliteStore {
    pub async fn insert_few_shot(&self, entry: &crate::types::FewShotEntry) -> Result<(), StorageError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO few_shot_entries
                (id, task_type, input_text, output_text, quality_score, source_generation_id,
                 curated_by, is_active, metadata, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                entry.id.to_string(),
                entry.task_type,
                entry.input_text,
                entry.output_text,
                entry.quality_score,
                entry.source_generation_id.map(|id| id.to_string()),
                entry.curated_by.to_string(),
                entry.is_active as i32,
                metadata,
                entry.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        Ok(())
    }

    /// Active entries, best quality first.
    pub async fn list_few_shot(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<crate::types::FewShotEntry>, StorageError> {
        let conn = self.conn.lock().await;
        let (sql, params): (&str, Vec<Box<dyn rusqlite::types::ToSql>>) = match task_type {
            Some(task) => (
                "SELECT id, task_type, input_text, output_text, quality_score,
                        source_generation_id, curated_by, is_active, metadata, created_at
                 FROM few_shot_entries
                 WHERE is_active = 1 AND task_type = ?1
                 ORDER BY quality_score DESC LIMIT ?2",
                vec![Box::new(task.to_string()), Box::new(limit as i64)],
            ),
            None => (
                "SELECT id, task_type, input_text, output_text, quality_score,
                        source_generation_id, curated_by, is_active, metadata, created_at
                 FROM few_shot_entries
                 WHERE is_active = 1
                 ORDER BY quality_score DESC LIMIT ?1",
                vec![Box::new(limit as i64)],
            ),
        };
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_few_shot)
            .map_err(|e| StorageError::Sqlite(e.to_string()))?;
        collect_rows(rows)
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

const DOCUMENT_COLUMNS: &str = "id, title, source_type, source_url, mime_type, content_hash, \
     chunk_count, embedding_model_id, raw_content, chunk_strategy, ingested_at, \
     source_updated_at, valid_until, metadata, enrichment_status";

const PROMPT_COLUMNS: &str =
    "id, prompt_name, version, content, content_hash, eval_score, active_pct, author, created_at";

const GENERATION_COLUMNS: &str = "id, created_at, user_id, session_id, prompt_hash, \
     prompt_version, task_type, input_tokens, response_hash, output_tokens, model, \
     model_version, latency_ms, cost_usd, user_feedback, feedback_at, thumbs, user_edit_diff, \
     quality_score, hallucination, guardrail_triggered";

type MappedRow<T> = Result<Result<T, StorageError>, rusqlite::Error>;

fn flatten_opt<T>(result: Option<Result<T, StorageError>>) -> Result<Option<T>, StorageError> {
    match result {
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

fn collect_rows<T>(
    rows: impl Iterator<Item = MappedRow<T>>,
) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    for row in rows {
        let inner = row.map_err(|e| StorageError::Sqlite(e.to_string()))?;
        out.push(inner?);
    }
    Ok(out)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn row_to_document(row: &rusqlite::Row<'_>) -> MappedRow<Document> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let source_type: String = row.get(2)?;
    let source_url: Option<String> = row.get(3)?;
    let mime_type: String = row.get(4)?;
    let content_hash: String = row.get(5)?;
    let chunk_count: i64 = row.get(6)?;
    let embedding_model_id: Option<String> = row.get(7)?;
    let raw_content: Option<String> = row.get(8)?;
    let chunk_strategy: String = row.get(9)?;
    let ingested_at: String = row.get(10)?;
    let source_updated_at: Option<String> = row.get(11)?;
    let valid_until: Option<String> = row.get(12)?;
    let metadata: String = row.get(13)?;
    let enrichment_status: String = row.get(14)?;

    Ok((|| -> Result<Document, StorageError> {
        Ok(Document {
            id: id
                .parse()
                .map_err(|e: uuid::Error| StorageError::Serialization(e.to_string()))?,
            title,
            source_type: source_type.parse().map_err(StorageError::Serialization)?,
            source_url,
            mime_type,
            content_hash,
            chunk_count: chunk_count as u32,
            embedding_model_id,
            raw_content,
            chunk_strategy: chunk_strategy
                .parse()
                .map_err(StorageError::Serialization)?,
            ingested_at: parse_ts(&ingested_at)?,
            source_updated_at: parse_opt_ts(source_updated_at)?,
            valid_until: parse_opt_ts(valid_until)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            enrichment_status: enrichment_status
                .parse()
                .map_err(StorageError::Serialization)?,
        })
    })())
}

fn row_to_prompt_version(row: &rusqlite::Row<'_>) -> MappedRow<PromptVersion> {
    let id: String = row.get(0)?;
    let prompt_name: String = row.get(1)?;
    let version: String = row.get(2)?;
    let content: String = row.get(3)?;
    let content_hash: String = row.get(4)?;
    let eval_score: Option<f64> = row.get(5)?;
    let active_pct: i64 = row.get(6)?;
    let author: String = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok((|| -> Result<PromptVersion, StorageError> {
        Ok(PromptVersion {
            id: id
                .parse()
                .map_err(|e: uuid::Error| StorageError::Serialization(e.to_string()))?,
            prompt_name,
            version,
            content,
            content_hash,
            eval_score,
            active_pct: active_pct as u8,
            author,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn row_to_generation(row: &rusqlite::Row<'_>) -> MappedRow<Generation> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let session_id: Option<String> = row.get(3)?;
    let prompt_hash: String = row.get(4)?;
    let prompt_version: Option<String> = row.get(5)?;
    let task_type: String = row.get(6)?;
    let input_tokens: i64 = row.get(7)?;
    let response_hash: String = row.get(8)?;
    let output_tokens: i64 = row.get(9)?;
    let model: String = row.get(10)?;
    let model_version: Option<String> = row.get(11)?;
    let latency_ms: i64 = row.get(12)?;
    let cost_usd: f64 = row.get(13)?;
    let user_feedback: Option<String> = row.get(14)?;
    let feedback_at: Option<String> = row.get(15)?;
    let thumbs: Option<i64> = row.get(16)?;
    let user_edit_diff: Option<String> = row.get(17)?;
    let quality_score: Option<f64> = row.get(18)?;
    let hallucination: i64 = row.get(19)?;
    let guardrail_triggered: String = row.get(20)?;

    Ok((|| -> Result<Generation, StorageError> {
        Ok(Generation {
            id: id
                .parse()
                .map_err(|e: uuid::Error| StorageError::Serialization(e.to_string()))?,
            created_at: parse_ts(&created_at)?,
            user_id,
            session_id,
            prompt_hash,
            prompt_version,
            task_type,
            input_tokens: input_tokens as u32,
            response_hash,
            output_tokens: output_tokens as u32,
            model,
            model_version,
            latency_ms: latency_ms as u64,
            cost_usd,
            user_feedback: user_feedback
                .map(|f| f.parse().map_err(StorageError::Serialization))
                .transpose()?,
            feedback_at: parse_opt_ts(feedback_at)?,
            thumbs: thumbs.map(|t| t as i8),
            user_edit_diff,
            quality_score,
            hallucination: hallucination != 0,
            guardrail_triggered: serde_json::from_str(&guardrail_triggered).unwrap_or_default(),
        })
    })())
}

fn row_to_outcome(row: &rusqlite::Row<'_>) -> MappedRow<Outcome> {
    let id: String = row.get(0)?;
    let generation_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let outcome_type: String = row.get(3)?;
    let outcome_value: f64 = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok((|| -> Result<Outcome, StorageError> {
        Ok(Outcome {
            id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
            generation_id: generation_id
                .parse()
                .map_err(|e: uuid::Error| StorageError::Serialization(e.to_string()))?,
            user_id,
            outcome_type: outcome_type.parse().map_err(StorageError::Serialization)?,
            outcome_value,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn row_to_preference(row: &rusqlite::Row<'_>) -> MappedRow<UserPreference> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let preference_key: String = row.get(2)?;
    let preference_value: String = row.get(3)?;
    let source: String = row.get(4)?;
    let confidence: f64 = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok((|| -> Result<UserPreference, StorageError> {
        Ok(UserPreference {
            id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
            user_id,
            preference_key,
            preference_value: serde_json::from_str(&preference_value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            source: source.parse().map_err(StorageError::Serialization)?,
            confidence,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn row_to_few_shot(row: &rusqlite::Row<'_>) -> MappedRow<crate::types::FewShotEntry> {
    let id: String = row.get(0)?;
    let task_type: String = row.get(1)?;
    let input_text: String = row.get(2)?;
    let output_text: String = row.get(3)?;
    let quality_score: f64 = row.get(4)?;
    let source_generation_id: Option<String> = row.get(5)?;
    let curated_by: String = row.get(6)?;
    let is_active: i64 = row.get(7)?;
    let metadata: String = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok((|| -> Result<crate::types::FewShotEntry, StorageError> {
        Ok(crate::types::FewShotEntry {
            id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
            task_type,
            input_text,
            output_text,
            quality_score,
            source_generation_id: source_generation_id
                .map(|s| {
                    s.parse()
                        .map_err(|e: uuid::Error| StorageError::Serialization(e.to_string()))
                })
                .transpose()?,
            curated_by: curated_by.parse().map_err(StorageError::Serialization)?,
            is_active: is_active != 0,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            created_at: parse_ts(&created_at)?,
        })
    })())
}

/// Extension trait so we can use `optional()` on rusqlite queries.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::types::{ChunkStrategy, SourceType};

    pub fn document_fixture(id: DocumentId) -> Document {
        Document {
            id,
            title: "fixture".to_string(),
            source_type: SourceType::Document,
            source_url: None,
            mime_type: "text/plain".to_string(),
            content_hash: format!("hash-{id}"),
            chunk_count: 0,
            embedding_model_id: None,
            raw_content: None,
            chunk_strategy: ChunkStrategy::Fixed,
            ingested_at: Utc::now(),
            source_updated_at: None,
            valid_until: None,
            metadata: HashMap::new(),
            enrichment_status: EnrichmentStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::document_fixture;
    use super::*;
    use crate::types::{CuratedBy, FewShotEntry, OutcomeType, PreferenceSource, SourceType};

    fn generation_fixture(user: &str) -> Generation {
        Generation {
            id: GenerationId::new(),
            created_at: Utc::now(),
            user_id: user.to_string(),
            session_id: None,
            prompt_hash: "p".repeat(64),
            prompt_version: Some("v1.0.0".to_string()),
            task_type: "summarize".to_string(),
            input_tokens: 120,
            response_hash: "r".repeat(64),
            output_tokens: 80,
            model: "gpt-4o-mini".to_string(),
            model_version: None,
            latency_ms: 800,
            cost_usd: 0.0004,
            user_feedback: None,
            feedback_at: None,
            thumbs: None,
            user_edit_diff: None,
            quality_score: None,
            hallucination: false,
            guardrail_triggered: Vec::new(),
        }
    }

    #[tokio::test]
    async fn document_round_trip_and_hash_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = document_fixture(DocumentId::new());
        store.insert_document(&doc).await.unwrap();

        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "fixture");
        assert_eq!(loaded.source_type, SourceType::Document);

        let by_hash = store
            .find_document_by_hash(&doc.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.id, doc.id);

        assert!(store
            .find_document_by_hash("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_content_hash_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut a = document_fixture(DocumentId::new());
        a.content_hash = "same".to_string();
        let mut b = document_fixture(DocumentId::new());
        b.content_hash = "same".to_string();

        store.insert_document(&a).await.unwrap();
        assert!(store.insert_document(&b).await.is_err());
    }

    #[tokio::test]
    async fn embedding_state_clears_model_on_zero_chunks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let doc = document_fixture(DocumentId::new());
        store.insert_document(&doc).await.unwrap();

        store
            .set_embedding_state(doc.id, 4, Some("text-embedding-3-small"))
            .await
            .unwrap();
        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.chunk_count, 4);
        assert_eq!(
            loaded.embedding_model_id.as_deref(),
            Some("text-embedding-3-small")
        );

        store.set_embedding_state(doc.id, 0, None).await.unwrap();
        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.chunk_count, 0);
        assert!(loaded.embedding_model_id.is_none());
    }

    #[tokio::test]
    async fn prompt_version_unique_per_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        let v1 = PromptVersion {
            id: PromptVersionId::new(),
            prompt_name: "onboarding".to_string(),
            version: "v1.0.0".to_string(),
            content: "hello".to_string(),
            content_hash: "h1".to_string(),
            eval_score: None,
            active_pct: 0,
            author: "ops".to_string(),
            created_at: Utc::now(),
        };
        store.insert_prompt_version(&v1).await.unwrap();

        let mut dup = v1.clone();
        dup.id = PromptVersionId::new();
        assert!(store.insert_prompt_version(&dup).await.is_err());
    }

    #[tokio::test]
    async fn promote_exclusive_zeroes_siblings_atomically() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for (i, pct) in [(0u32, 50u8), (1, 50), (2, 0)] {
            let v = PromptVersion {
                id: PromptVersionId::new(),
                prompt_name: "ladder".to_string(),
                version: format!("v1.{i}.0"),
                content: "c".to_string(),
                content_hash: format!("h{i}"),
                eval_score: Some(0.9),
                active_pct: pct,
                author: "ops".to_string(),
                created_at: Utc::now(),
            };
            store.insert_prompt_version(&v).await.unwrap();
            ids.push(v.id);
        }

        store.promote_exclusive(ids[2], "ladder").await.unwrap();
        let versions = store.versions_for_prompt("ladder").await.unwrap();
        let total: u32 = versions.iter().map(|v| u32::from(v.active_pct)).sum();
        assert_eq!(total, 100);
        let winner = versions.iter().find(|v| v.id == ids[2]).unwrap();
        assert_eq!(winner.active_pct, 100);
    }

    #[tokio::test]
    async fn feedback_at_is_stamped_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let generation = generation_fixture("u1");
        store.insert_generation(&generation).await.unwrap();

        let first = store
            .attach_feedback(generation.id, Some(UserFeedback::Accepted), None, None)
            .await
            .unwrap();
        let stamp = first.feedback_at.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = store
            .attach_feedback(generation.id, Some(UserFeedback::Edited), Some(1), None)
            .await
            .unwrap();
        assert_eq!(second.feedback_at.unwrap(), stamp);
        assert_eq!(second.user_feedback, Some(UserFeedback::Edited));
        assert_eq!(second.thumbs, Some(1));
    }

    #[tokio::test]
    async fn list_generations_paginates_per_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        for _ in 0..3 {
            store
                .insert_generation(&generation_fixture("u1"))
                .await
                .unwrap();
        }
        store
            .insert_generation(&generation_fixture("u2"))
            .await
            .unwrap();

        let page = store.list_generations(Some("u1"), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        let rest = store.list_generations(Some("u1"), 10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        let all = store.list_generations(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn outcome_requires_generation_lookup_by_caller() {
        let store = SqliteStore::open_in_memory().unwrap();
        let generation = generation_fixture("u1");
        store.insert_generation(&generation).await.unwrap();

        let outcome = Outcome {
            id: Uuid::new_v4(),
            generation_id: generation.id,
            user_id: "u1".to_string(),
            outcome_type: OutcomeType::Conversion,
            outcome_value: 19.99,
            created_at: Utc::now(),
        };
        store.insert_outcome(&outcome).await.unwrap();

        let outcomes = store.outcomes_for_generation(generation.id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome_type, OutcomeType::Conversion);
    }

    #[tokio::test]
    async fn preference_upsert_respects_explicit_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let explicit = UserPreference {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            preference_key: "preferred_model".to_string(),
            preference_value: serde_json::json!("claude-sonnet"),
            source: PreferenceSource::Explicit,
            confidence: 1.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            store.upsert_preference(&explicit, false).await.unwrap(),
            PreferenceWrite::Inserted
        );

        let inferred = UserPreference {
            source: PreferenceSource::Inferred,
            confidence: 0.7,
            preference_value: serde_json::json!("gpt-4o"),
            ..explicit.clone()
        };
        assert_eq!(
            store.upsert_preference(&inferred, true).await.unwrap(),
            PreferenceWrite::SkippedExplicit
        );

        let kept = store
            .get_preference("u1", "preferred_model")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.preference_value, serde_json::json!("claude-sonnet"));
        assert_eq!(kept.source, PreferenceSource::Explicit);

        // An explicit write (respect flag off) replaces the row.
        assert_eq!(
            store.upsert_preference(&inferred, false).await.unwrap(),
            PreferenceWrite::Updated
        );
    }

    #[tokio::test]
    async fn few_shot_listing_filters_and_orders() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (task, score, active) in [
            ("summarize", 0.9, true),
            ("summarize", 0.7, true),
            ("summarize", 0.99, false),
            ("classify", 0.8, true),
        ] {
            let entry = FewShotEntry {
                id: Uuid::new_v4(),
                task_type: task.to_string(),
                input_text: "in".to_string(),
                output_text: "out".to_string(),
                quality_score: score,
                source_generation_id: None,
                curated_by: CuratedBy::Manual,
                is_active: active,
                metadata: HashMap::new(),
                created_at: Utc::now(),
            };
            store.insert_few_shot(&entry).await.unwrap();
        }

        let entries = store.list_few_shot(Some("summarize"), 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].quality_score > entries[1].quality_score);
    }
}
