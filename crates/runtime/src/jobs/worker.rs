//! Worker pool
//!
//! Workers poll the store for due jobs and process them in parallel under a
//! concurrency cap. Embed-family jobs serialize per document so two embeds
//! can never interleave writes for the same document. Failures retry with
//! jittered exponential backoff until `max_attempts`, then dead-letter with a
//! telemetry event.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;

use super::store::JobStore;
use super::types::{Job, JobKind, JobPayload};
use crate::config::WorkerConfig;
use crate::retry::RetryPolicy;
use crate::telemetry::{EventSink, TelemetryEvent};
use crate::types::{DocumentId, JobError};

/// Enqueue facade. When no store is configured, enqueueing is a no-op that
/// reports `queued=false`; callers surface that in responses rather than
/// failing the request.
pub struct JobQueue {
    store: Option<Arc<dyn JobStore>>,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(store: Option<Arc<dyn JobStore>>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            store: None,
            max_attempts: 0,
        }
    }

    pub fn available(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<Arc<dyn JobStore>> {
        self.store.clone()
    }

    /// Enqueue a job now. Returns whether it was queued.
    pub async fn enqueue(&self, payload: JobPayload) -> bool {
        let Some(store) = &self.store else {
            tracing::debug!(kind = %payload.kind(), "job queue unavailable, dropping enqueue");
            return false;
        };
        let job = Job::new(payload, self.max_attempts);
        match store.enqueue(&job).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enqueue job");
                false
            }
        }
    }

    /// Enqueue a job to run no earlier than `until`.
    pub async fn enqueue_delayed(
        &self,
        payload: JobPayload,
        until: chrono::DateTime<Utc>,
    ) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let job = Job::delayed(payload, self.max_attempts, until);
        match store.enqueue(&job).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enqueue delayed job");
                false
            }
        }
    }
}

/// Processes one job payload. Implementations must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobError>;
}

/// Polling worker pool with bounded concurrency and graceful drain.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
    poll_interval: Duration,
    semaphore: Arc<Semaphore>,
    document_locks: Arc<DashMap<DocumentId, Arc<Mutex<()>>>>,
    backoff: RetryPolicy,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        events: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            store,
            handler,
            events,
            config,
            poll_interval: Duration::from_millis(500),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            document_locks: Arc::new(DashMap::new()),
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(300),
            },
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until the shutdown signal flips, then drain active jobs within the
    /// configured window and force-stop the rest.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut active = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished tasks without blocking.
            while active.try_join_next().is_some() {}

            let free = self.semaphore.available_permits();
            if free > 0 {
                match self.store.claim_due(Utc::now(), free).await {
                    Ok(jobs) => {
                        for job in jobs {
                            self.spawn_job(&mut active, job).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to claim due jobs"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!(
            active = active.len(),
            drain_timeout_secs = self.config.drain_timeout_secs,
            "worker pool draining"
        );
        let drain = tokio::time::timeout(
            Duration::from_secs(self.config.drain_timeout_secs),
            async {
                while active.join_next().await.is_some() {}
            },
        )
        .await;
        if drain.is_err() {
            tracing::warn!("drain window elapsed, aborting remaining jobs");
            active.abort_all();
        }
    }

    async fn spawn_job(&self, active: &mut JoinSet<()>, job: Job) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let store = self.store.clone();
        let handler = self.handler.clone();
        let events = self.events.clone();
        let backoff = self.backoff;
        let document_locks = self.document_locks.clone();

        active.spawn(async move {
            let _permit = permit;

            // Embed-family jobs serialize per document: interleaved embeds
            // could mix models inside one document's rows.
            let doc_lock = match (job.payload.kind(), job.payload.document_id()) {
                (JobKind::Embed | JobKind::ReEmbed, Some(document_id)) => {
                    let lock = document_locks
                        .entry(document_id)
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone();
                    Some(lock)
                }
                _ => None,
            };
            let _doc_guard = match &doc_lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };

            let result = handler.handle(&job.payload).await;
            match result {
                Ok(()) => {
                    if let Err(e) = store.mark_completed(job.id).await {
                        tracing::warn!(error = %e, job_id = %job.id, "failed to mark completed");
                    }
                }
                Err(error) => {
                    let attempts = job.attempts + 1;
                    if attempts >= job.max_attempts {
                        tracing::error!(
                            job_id = %job.id,
                            kind = %job.payload.kind(),
                            attempts,
                            error = %error,
                            "job dead-lettered"
                        );
                        let _ = store
                            .mark_failed(job.id, attempts, &error.to_string())
                            .await;
                        events
                            .emit(
                                TelemetryEvent::new("job_dead_lettered")
                                    .with("job_id", job.id.to_string())
                                    .with("job_type", job.payload.kind().to_string())
                                    .with("attempts", attempts)
                                    .with("error", error.to_string()),
                            )
                            .await;
                    } else {
                        let delay = backoff.delay_for_attempt(attempts - 1);
                        let retry_at = Utc::now()
                            + ChronoDuration::from_std(delay)
                                .unwrap_or_else(|_| ChronoDuration::seconds(2));
                        tracing::warn!(
                            job_id = %job.id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %error,
                            "job failed, scheduling retry"
                        );
                        let _ = store
                            .mark_retry(job.id, attempts, retry_at, &error.to_string())
                            .await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::SqliteJobStore;
    use crate::storage::sqlite::SqliteStore;
    use crate::telemetry::JsonlSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _payload: &JobPayload) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(JobError::ProcessingFailed("induced".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_attempts: 3,
            drain_timeout_secs: 2,
        }
    }

    async fn run_pool_until(
        pool: Arc<WorkerPool>,
        duration: Duration,
    ) {
        let (tx, rx) = watch::channel(false);
        let handle = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(rx).await })
        };
        tokio::time::sleep(duration).await;
        let _ = tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn queue_without_store_reports_not_queued() {
        let queue = JobQueue::unavailable();
        let queued = queue
            .enqueue(JobPayload::Enrich {
                document_id: DocumentId::new(),
            })
            .await;
        assert!(!queued);
        assert!(!queue.available());
    }

    #[tokio::test]
    async fn pool_processes_queued_jobs() {
        let entities = SqliteStore::open_in_memory().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(entities.handle()));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let queue = JobQueue::new(Some(store.clone()), 3);
        assert!(queue
            .enqueue(JobPayload::Enrich {
                document_id: DocumentId::new()
            })
            .await);

        let pool = Arc::new(
            WorkerPool::new(
                store.clone(),
                handler.clone(),
                Arc::new(crate::telemetry::TracingSink),
                test_config(),
            )
            .with_poll_interval(Duration::from_millis(20)),
        );
        run_pool_until(pool, Duration::from_millis(300)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let counts = store.counts().await.unwrap();
        assert!(counts.contains(&(super::super::types::JobState::Completed, 1)));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_event() {
        let entities = SqliteStore::open_in_memory().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(entities.handle()));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });

        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let sink = Arc::new(JsonlSink::new(events_path.clone()));

        let job = Job::new(
            JobPayload::Enrich {
                document_id: DocumentId::new(),
            },
            1, // dead-letter on first failure
        );
        store.enqueue(&job).await.unwrap();

        let pool = Arc::new(
            WorkerPool::new(store.clone(), handler, sink, test_config())
                .with_poll_interval(Duration::from_millis(20)),
        );
        run_pool_until(pool, Duration::from_millis(300)).await;

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, super::super::types::JobState::Failed);

        let content = std::fs::read_to_string(&events_path).unwrap();
        assert!(content.contains("job_dead_lettered"));
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_after_delay() {
        let entities = SqliteStore::open_in_memory().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(entities.handle()));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });

        let job = Job::new(
            JobPayload::Enrich {
                document_id: DocumentId::new(),
            },
            5,
        );
        store.enqueue(&job).await.unwrap();

        let pool = Arc::new(
            WorkerPool::new(
                store.clone(),
                handler.clone(),
                Arc::new(crate::telemetry::TracingSink),
                test_config(),
            )
            .with_poll_interval(Duration::from_millis(20)),
        );
        run_pool_until(pool, Duration::from_millis(200)).await;

        // First attempt failed; the job is delayed for a future retry.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, super::super::types::JobState::Delayed);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.delay_until.unwrap() > Utc::now() - ChronoDuration::seconds(1));
    }
}
