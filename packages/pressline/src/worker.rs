//! Worker pool: bounded-concurrency drain of the pending queue.
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► acquire concurrency slot (semaphore)
//!     ├─► claim_next_job (store-side atomic claim)
//!     ├─► JobHandler.handle(job) under a timeout
//!     └─► complete_job / fail_job + one JobRun per attempt
//! ```
//!
//! A permit is acquired before each claim, so a full pool pauses
//! further claims until a slot frees instead of stacking claimed jobs
//! behind slow handlers. Handler timeouts are handler failures, not
//! queue bugs: they route through `fail_job` like any other error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::job::{ErrorDetails, Job, JobRun, JobStatus, RunActor, RunStatus};
use crate::scheduler::TickAction;
use crate::store::JobStore;

/// External collaborator that does the actual work for a job.
///
/// The handler may block on network I/O (content generation, publish
/// calls); the pool isolates that behind a concurrency slot and a
/// timeout. Handlers should be idempotent: the queue guarantees
/// at-least-once execution, not exactly-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Handler invocations in flight at any instant.
    pub max_concurrent_jobs: usize,
    /// Handler timeout; exceeding it fails the attempt.
    pub handler_timeout: Duration,
    /// Idle sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Claim budget per drain pass; `None` drains until empty.
    pub max_batch_size: Option<usize>,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            handler_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            max_batch_size: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            handler_timeout: config.handler_timeout,
            poll_interval: config.poll_interval,
            max_batch_size: config.max_batch_size,
            ..Default::default()
        }
    }
}

/// Result of one drain pass, success or partial.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainSummary {
    /// Jobs claimed this pass.
    pub total_jobs_checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Completions/failures that lost the race to the sweeper.
    pub conflicts: usize,
    /// Jobs given back unprocessed on shutdown.
    pub released: usize,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct DrainCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    conflicts: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl DrainCounters {
    fn record_error(&self, message: String) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

/// Concurrency-bounded processor over a [`JobStore`].
pub struct WorkerPool<S: JobStore> {
    store: Arc<S>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            store,
            handler,
            config,
            semaphore,
        }
    }

    /// One processing pass: claim and process until the queue is
    /// empty or the batch budget runs out, then wait for every
    /// in-flight handler.
    pub async fn drain_once(&self) -> Result<DrainSummary> {
        self.drain(&CancellationToken::new()).await
    }

    async fn drain(&self, shutdown: &CancellationToken) -> Result<DrainSummary> {
        let counters = Arc::new(DrainCounters::default());
        let mut handles = Vec::new();
        let mut claimed = 0usize;
        let mut released = 0usize;

        loop {
            if self
                .config
                .max_batch_size
                .is_some_and(|budget| claimed >= budget)
            {
                break;
            }

            // Slot first, claim second: a full pool must pause claims.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.context("worker semaphore closed")?
                }
            };

            // Store unavailability fails the whole tick; the next
            // scheduled pass retries. Nothing is left half-updated.
            let job = match self.store.claim_next_job(&self.config.worker_id).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => return Err(e).context("claiming next job"),
            };
            claimed += 1;

            if shutdown.is_cancelled() {
                // Claimed after the shutdown signal: give it back
                // rather than starting work we will not finish.
                if self.store.release_job(job.id).await.unwrap_or(false) {
                    released += 1;
                    claimed -= 1;
                }
                break;
            }

            let store = Arc::clone(&self.store);
            let handler = Arc::clone(&self.handler);
            let counters = Arc::clone(&counters);
            let timeout = self.config.handler_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_one(store, handler, job, timeout, counters).await;
            }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked");
                counters.record_error(format!("worker task panicked: {e}"));
            }
        }

        let errors = counters
            .errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(DrainSummary {
            total_jobs_checked: claimed,
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            conflicts: counters.conflicts.load(Ordering::Relaxed),
            released,
            errors,
        })
    }

    /// Long-running service loop: drain, sleep while idle, exit on
    /// cancellation.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "worker pool starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.drain(&shutdown).await {
                Ok(summary) if summary.total_jobs_checked > 0 => {
                    debug!(
                        total_jobs_checked = summary.total_jobs_checked,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        conflicts = summary.conflicts,
                        "drain pass complete"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "drain pass failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }
}

async fn process_one<S: JobStore>(
    store: Arc<S>,
    handler: Arc<dyn JobHandler>,
    job: Job,
    timeout: Duration,
    counters: Arc<DrainCounters>,
) {
    let started = Instant::now();
    let claimed_at = job.claimed_at.unwrap_or_else(Utc::now);
    debug!(job_id = %job.id, job_type = %job.job_type, retry_count = job.retry_count, "processing job");

    let result = match tokio::time::timeout(timeout, handler.handle(&job)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("handler timed out after {}s", timeout.as_secs())),
    };
    let execution_time_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(()) => match store.complete_job(job.id).await {
            Ok(true) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                let run = JobRun::builder()
                    .job_id(job.id)
                    .status(RunStatus::Success)
                    .retry_attempt(job.retry_count)
                    .execution_time_ms(execution_time_ms)
                    .build();
                if let Err(e) = store.record_run(run).await {
                    warn!(job_id = %job.id, error = %e, "failed to record run");
                    counters.record_error(format!("record_run for {}: {e}", job.id));
                }
                debug!(job_id = %job.id, execution_time_ms, "job succeeded");
            }
            Ok(false) => {
                // The sweeper reset this job between our claim and the
                // completion write; the reset stands.
                counters.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.id, "completion lost the race, job no longer processing");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark job as completed");
                counters.record_error(format!("complete_job for {}: {e}", job.id));
            }
        },
        Err(e) => {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "job handler failed");
            match store.fail_job(job.id, &e.to_string()).await {
                Ok(Some(status)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    let run = JobRun::builder()
                        .job_id(job.id)
                        .status(RunStatus::Failed)
                        .retry_attempt(job.retry_count)
                        .execution_time_ms(execution_time_ms)
                        .error_details(ErrorDetails {
                            reason: e.to_string(),
                            processing_seconds: (Utc::now() - claimed_at).num_seconds(),
                            actor: RunActor::Worker,
                        })
                        .build();
                    if let Err(e) = store.record_run(run).await {
                        warn!(job_id = %job.id, error = %e, "failed to record run");
                        counters.record_error(format!("record_run for {}: {e}", job.id));
                    }
                    if status == JobStatus::Failed {
                        info!(job_id = %job.id, retry_count = job.retry_count + 1, "job terminally failed");
                    }
                }
                Ok(None) => {
                    counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    warn!(job_id = %job.id, "failure report lost the race, job no longer processing");
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to mark job as failed");
                    counters.record_error(format!("fail_job for {}: {e}", job.id));
                }
            }
        }
    }
}

#[async_trait]
impl<S: JobStore + 'static> TickAction for WorkerPool<S> {
    async fn tick(&self) -> Result<()> {
        self.drain_once().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            Err(anyhow!("publish rejected"))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 5);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerConfig::with_worker_id("press-1");
        assert_eq!(config.worker_id, "press-1");
    }

    #[tokio::test]
    async fn handler_failure_routes_through_fail_job() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();

        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::new(FailingHandler),
            WorkerConfig::with_worker_id("t"),
        );
        let summary = pool.drain_once().await.unwrap();

        assert_eq!(summary.total_jobs_checked, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("publish rejected"));

        let runs = store.all_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        let details = runs[0].error_details.as_ref().unwrap();
        assert_eq!(details.actor, RunActor::Worker);
    }

    #[tokio::test]
    async fn handler_timeout_is_a_handler_failure() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();

        let mut config = WorkerConfig::with_worker_id("t");
        config.handler_timeout = Duration::from_millis(25);
        let pool = WorkerPool::new(Arc::clone(&store), Arc::new(SlowHandler), config);

        let summary = pool.drain_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn batch_budget_caps_claims() {
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..4 {
            store
                .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
                .await
                .unwrap();
        }

        struct OkHandler;
        #[async_trait]
        impl JobHandler for OkHandler {
            async fn handle(&self, _job: &Job) -> Result<()> {
                Ok(())
            }
        }

        let mut config = WorkerConfig::with_worker_id("t");
        config.max_batch_size = Some(2);
        let pool = WorkerPool::new(Arc::clone(&store), Arc::new(OkHandler), config);

        let summary = pool.drain_once().await.unwrap();
        assert_eq!(summary.total_jobs_checked, 2);
        assert_eq!(
            store.count_by_status(JobStatus::Pending).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn completion_conflict_is_counted_not_errored() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();

        // Handler that simulates the sweeper resetting the job while
        // the worker is still running it.
        struct ResettingHandler {
            store: Arc<MemoryJobStore>,
        }
        #[async_trait]
        impl JobHandler for ResettingHandler {
            async fn handle(&self, job: &Job) -> Result<()> {
                self.store.reset_job(job.id, "Job reset by sweeper").await?;
                Ok(())
            }
        }

        let mut config = WorkerConfig::with_worker_id("t");
        config.max_batch_size = Some(1);
        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::new(ResettingHandler {
                store: Arc::clone(&store),
            }),
            config,
        );
        let summary = pool.drain_once().await.unwrap();

        assert_eq!(summary.total_jobs_checked, 1);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.succeeded, 0);
        assert!(summary.errors.is_empty());

        // The reset stood: the job is back in pending, untouched by
        // the worker's completion attempt.
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, JobStatus::Pending);
    }
}
