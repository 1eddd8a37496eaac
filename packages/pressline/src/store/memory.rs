//! In-memory job store.
//!
//! Same conditional semantics as the Postgres store, behind a single
//! mutex: each protocol operation checks the precondition and applies
//! the write inside one critical section, with no await points while
//! the lock is held. Used by the test suite and by single-process
//! deployments that do not need durability across restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::job::{Job, JobRun, JobStatus};

use super::JobStore;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    runs: Vec<JobRun>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every job, unordered. Inspection helper for tests
    /// and diagnostics.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Snapshot of the run log, oldest first.
    pub fn all_runs(&self) -> Vec<JobRun> {
        self.lock().runs.clone()
    }

    /// Rewrite a job's `claimed_at`. Testing helper for simulating a
    /// lease that started in the past.
    pub fn set_claimed_at(&self, id: Uuid, claimed_at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) => {
                job.claimed_at = Some(claimed_at);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: Job) -> StoreResult<Job> {
        let mut inner = self.lock();
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next_job(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.lock();

        // Oldest eligible pending job; id tie-break keeps the pick
        // deterministic when timestamps collide.
        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable())
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else { return Ok(None) };

        let job = inner.jobs.get_mut(&id).expect("job present under lock");
        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn release_job(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                job.claimed_at = None;
                job.worker_id = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<bool> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.claimed_at = None;
                job.worker_id = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<Option<JobStatus>> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.retry_count += 1;
                job.status = if job.retry_count >= job.max_retries {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                job.claimed_at = None;
                job.worker_id = None;
                job.last_error = Some(error.to_string());
                job.updated_at = now;
                Ok(Some(job.status))
            }
            _ => Ok(None),
        }
    }

    async fn reset_job(&self, id: Uuid, error: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                job.claimed_at = None;
                job.worker_id = None;
                job.last_error = Some(error.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let inner = self.lock();
        let mut stale: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.claimed_at.is_some_and(|c| c < claimed_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| (j.claimed_at, j.id));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn count_by_status(&self, status: JobStatus) -> StoreResult<i64> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .count() as i64)
    }

    async fn record_run(&self, run: JobRun) -> StoreResult<JobRun> {
        let mut inner = self.lock();
        inner.runs.push(run.clone());
        Ok(run)
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<JobRun>> {
        let inner = self.lock();
        let mut runs: Vec<JobRun> = inner
            .runs
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.runs.len();
        inner.runs.retain(|r| r.created_at >= cutoff);
        Ok((before - inner.runs.len()) as u64)
    }

    async fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            !(j.status == JobStatus::Completed && j.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ErrorDetails, RunActor, RunStatus};

    fn job() -> Job {
        Job::for_payload("publish_article", serde_json::json!({"topic": "rust"}))
    }

    #[tokio::test]
    async fn claim_sets_processing_and_claimed_at() {
        let store = MemoryJobStore::new();
        let enqueued = store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, enqueued.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.claimed_at.is_some());
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn claim_returns_none_on_empty_queue() {
        let store = MemoryJobStore::new();
        assert!(store.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_oldest_pending() {
        let store = MemoryJobStore::new();
        let mut first = job();
        first.created_at = Utc::now() - chrono::Duration::seconds(60);
        let first = store.enqueue(first).await.unwrap();
        store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn release_reverts_to_pending() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();

        assert!(store.release_job(j.id).await.unwrap());
        let j = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.claimed_at.is_none());

        // Second release is a precondition conflict, not an error.
        assert!(!store.release_job(j.id).await.unwrap());
    }

    #[tokio::test]
    async fn complete_only_from_processing() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();

        // Not yet claimed: guard fails.
        assert!(!store.complete_job(j.id).await.unwrap());

        store.claim_next_job("w1").await.unwrap().unwrap();
        assert!(store.complete_job(j.id).await.unwrap());

        let j = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert!(j.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_below_cap_returns_to_pending_with_error() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();

        let status = store.fail_job(j.id, "boom").await.unwrap();
        assert_eq!(status, Some(JobStatus::Pending));

        let j = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.retry_count, 1);
        assert_eq!(j.last_error.as_deref(), Some("boom"));
        assert!(j.claimed_at.is_none());
    }

    #[tokio::test]
    async fn fail_at_cap_is_terminal() {
        let store = MemoryJobStore::new();
        let mut j = job();
        j.max_retries = 1;
        let j = store.enqueue(j).await.unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();

        let status = store.fail_job(j.id, "boom").await.unwrap();
        assert_eq!(status, Some(JobStatus::Failed));

        // Terminal jobs are never claimed again.
        assert!(store.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_on_non_processing_job_is_a_noop() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();
        assert_eq!(store.fail_job(j.id, "boom").await.unwrap(), None);

        let j = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.retry_count, 0);
    }

    #[tokio::test]
    async fn reset_never_touches_retry_count() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();

        assert!(store.reset_job(j.id, "Job reset by sweeper").await.unwrap());
        let j = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.retry_count, 0);
        assert!(j.last_error.as_deref().unwrap().starts_with("Job reset"));
    }

    #[tokio::test]
    async fn find_stale_jobs_orders_by_claim_time() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let a = store.enqueue(job()).await.unwrap();
        let b = store.enqueue(job()).await.unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();
        store.set_claimed_at(a.id, now - chrono::Duration::seconds(700));
        store.set_claimed_at(b.id, now - chrono::Duration::seconds(900));

        let stale = store
            .find_stale_jobs(now - chrono::Duration::seconds(600), 50)
            .await
            .unwrap();
        assert_eq!(stale.len(), 2);
        assert_eq!(stale[0].id, b.id);
        assert_eq!(stale[1].id, a.id);
    }

    #[tokio::test]
    async fn run_log_is_append_only_and_time_filtered() {
        let store = MemoryJobStore::new();
        let j = store.enqueue(job()).await.unwrap();

        let run = JobRun::builder()
            .job_id(j.id)
            .status(RunStatus::Failed)
            .retry_attempt(1)
            .execution_time_ms(120i64)
            .error_details(ErrorDetails {
                reason: "boom".into(),
                processing_seconds: 0,
                actor: RunActor::Worker,
            })
            .build();
        store.record_run(run).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(5);
        let runs = store.runs_since(since).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, j.id);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(store.runs_since(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_deletes_only_eligible_rows() {
        let store = MemoryJobStore::new();
        let cutoff = Utc::now() - chrono::Duration::days(30);

        let mut old_done = job();
        old_done.status = JobStatus::Completed;
        old_done.completed_at = Some(cutoff - chrono::Duration::days(1));
        let old_done = store.enqueue(old_done).await.unwrap();

        // Old but failed: retention never touches it.
        let mut old_failed = job();
        old_failed.status = JobStatus::Failed;
        let old_failed = store.enqueue(old_failed).await.unwrap();

        let mut old_run = JobRun::builder()
            .job_id(old_done.id)
            .status(RunStatus::Success)
            .build();
        old_run.created_at = cutoff - chrono::Duration::days(1);
        store.record_run(old_run).await.unwrap();

        assert_eq!(store.delete_runs_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_completed_jobs_before(cutoff).await.unwrap(), 1);
        assert!(store.get_job(old_done.id).await.unwrap().is_none());
        assert!(store.get_job(old_failed.id).await.unwrap().is_some());
    }
}
