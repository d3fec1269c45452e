//! Durable job store backed by SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Job, JobPayload, JobState};
use crate::storage::sqlite::DbHandle;
use crate::types::{JobError, JobId};

/// Abstract store for durable jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn enqueue(&self, job: &Job) -> Result<(), JobError>;

    /// Claim up to `limit` due jobs, atomically marking them active.
    /// A job is due when queued, or delayed with `delay_until <= now`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError>;

    /// Mark a job completed.
    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobError>;

    /// Schedule a retry after a failure.
    async fn mark_retry(
        &self,
        job_id: JobId,
        attempts: u32,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobError>;

    /// Dead-letter a job that exhausted its attempts.
    async fn mark_failed(&self, job_id: JobId, attempts: u32, error: &str)
        -> Result<(), JobError>;

    /// Retrieve a job by id.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobError>;

    /// Job counts per state, for health and telemetry.
    async fn counts(&self) -> Result<Vec<(JobState, u64)>, JobError>;
}

/// SQLite-backed job store sharing the runtime's primary connection.
pub struct SqliteJobStore {
    conn: DbHandle,
}

impl SqliteJobStore {
    pub fn new(conn: DbHandle) -> Self {
        Self { conn }
    }
}

const JOB_COLUMNS: &str =
    "id, job_type, document_id, payload, attempts, max_attempts, state, delay_until, \
     last_error, created_at, updated_at";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: &Job) -> Result<(), JobError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| JobError::Store(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs
                (id, job_type, document_id, payload, attempts, max_attempts, state,
                 delay_until, last_error, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                job.id.to_string(),
                job.payload.kind().to_string(),
                job.payload.document_id().map(|id| id.to_string()),
                payload,
                job.attempts,
                job.max_attempts,
                job.state.to_string(),
                job.delay_until.map(|t| t.to_rfc3339()),
                job.last_error,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| JobError::Store(e.to_string()))?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| JobError::Store(e.to_string()))?;

        let jobs = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE state = 'queued'
                        OR (state = 'delayed' AND delay_until IS NOT NULL AND delay_until <= ?1)
                     ORDER BY created_at
                     LIMIT ?2"
                ))
                .map_err(|e| JobError::Store(e.to_string()))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![now.to_rfc3339(), limit as i64],
                    row_to_job,
                )
                .map_err(|e| JobError::Store(e.to_string()))?;

            let mut jobs = Vec::new();
            for row in rows {
                let inner = row.map_err(|e| JobError::Store(e.to_string()))?;
                jobs.push(inner?);
            }
            jobs
        };

        for job in &jobs {
            tx.execute(
                "UPDATE jobs SET state = 'active', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now.to_rfc3339(), job.id.to_string()],
            )
            .map_err(|e| JobError::Store(e.to_string()))?;
        }

        tx.commit().map_err(|e| JobError::Store(e.to_string()))?;

        Ok(jobs
            .into_iter()
            .map(|mut job| {
                job.state = JobState::Active;
                job
            })
            .collect())
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<(), JobError> {
        self.update_state(job_id, "completed", None, None, None).await
    }

    async fn mark_retry(
        &self,
        job_id: JobId,
        attempts: u32,
        delay_until: DateTime<Utc>,
        error: &str,
    ) -> Result<(), JobError> {
        self.update_state(
            job_id,
            "delayed",
            Some(attempts),
            Some(delay_until),
            Some(error),
        )
        .await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        attempts: u32,
        error: &str,
    ) -> Result<(), JobError> {
        self.update_state(job_id, "failed", Some(attempts), None, Some(error))
            .await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .map_err(|e| JobError::Store(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![job_id.to_string()], row_to_job);
        match result {
            Ok(inner) => inner.map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(JobError::Store(e.to_string())),
        }
    }

    async fn counts(&self) -> Result<Vec<(JobState, u64)>, JobError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .map_err(|e| JobError::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count))
            })
            .map_err(|e| JobError::Store(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (state, count) = row.map_err(|e| JobError::Store(e.to_string()))?;
            let state: JobState = state.parse().map_err(JobError::Store)?;
            out.push((state, count as u64));
        }
        Ok(out)
    }
}

impl SqliteJobStore {
    async fn update_state(
        &self,
        job_id: JobId,
        state: &str,
        attempts: Option<u32>,
        delay_until: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), JobError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET
                    state = ?1,
                    attempts = COALESCE(?2, attempts),
                    delay_until = ?3,
                    last_error = COALESCE(?4, last_error),
                    updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    state,
                    attempts,
                    delay_until.map(|t| t.to_rfc3339()),
                    error,
                    Utc::now().to_rfc3339(),
                    job_id.to_string(),
                ],
            )
            .map_err(|e| JobError::Store(e.to_string()))?;
        if rows == 0 {
            return Err(JobError::NotFound(job_id));
        }
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, JobError>> {
    let id: String = row.get(0)?;
    let _job_type: String = row.get(1)?;
    let _document_id: Option<String> = row.get(2)?;
    let payload: String = row.get(3)?;
    let attempts: i64 = row.get(4)?;
    let max_attempts: i64 = row.get(5)?;
    let state: String = row.get(6)?;
    let delay_until: Option<String> = row.get(7)?;
    let last_error: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok((|| -> Result<Job, JobError> {
        let payload: JobPayload =
            serde_json::from_str(&payload).map_err(|e| JobError::Store(e.to_string()))?;
        Ok(Job {
            id: id
                .parse()
                .map_err(|e: uuid::Error| JobError::Store(e.to_string()))?,
            payload,
            attempts: attempts as u32,
            max_attempts: max_attempts as u32,
            state: state.parse().map_err(JobError::Store)?,
            delay_until: delay_until
                .map(|s| {
                    DateTime::parse_from_rfc3339(&s)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| JobError::Store(e.to_string()))
                })
                .transpose()?,
            last_error,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| JobError::Store(e.to_string()))?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| JobError::Store(e.to_string()))?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::types::DocumentId;
    use chrono::Duration;

    fn store() -> SqliteJobStore {
        let entities = SqliteStore::open_in_memory().unwrap();
        SqliteJobStore::new(entities.handle())
    }

    fn enrich_job() -> Job {
        Job::new(
            JobPayload::Enrich {
                document_id: DocumentId::new(),
            },
            5,
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = store();
        let job = enrich_job();
        store.enqueue(&job).await.unwrap();

        let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].state, JobState::Active);

        // Claimed jobs are not claimed twice.
        let again = store.claim_due(Utc::now(), 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn delayed_jobs_run_no_earlier_than_delay_until() {
        let store = store();
        let now = Utc::now();
        let job = Job::delayed(
            JobPayload::Freshness {
                document_id: DocumentId::new(),
            },
            5,
            now + Duration::minutes(10),
        );
        store.enqueue(&job).await.unwrap();

        assert!(store.claim_due(now, 10).await.unwrap().is_empty());

        let later = now + Duration::minutes(11);
        let claimed = store.claim_due(later, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn retry_and_dead_letter_transitions() {
        let store = store();
        let job = enrich_job();
        store.enqueue(&job).await.unwrap();
        store.claim_due(Utc::now(), 1).await.unwrap();

        let retry_at = Utc::now() + Duration::seconds(30);
        store
            .mark_retry(job.id, 1, retry_at, "transient failure")
            .await
            .unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Delayed);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("transient failure"));

        store.mark_failed(job.id, 5, "gave up").await.unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.attempts, 5);
    }

    #[tokio::test]
    async fn completed_jobs_leave_the_queue() {
        let store = store();
        let job = enrich_job();
        store.enqueue(&job).await.unwrap();
        store.claim_due(Utc::now(), 1).await.unwrap();
        store.mark_completed(job.id).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Completed);
        assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_by_state() {
        let store = store();
        store.enqueue(&enrich_job()).await.unwrap();
        store.enqueue(&enrich_job()).await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts, vec![(JobState::Queued, 2)]);
    }
}
