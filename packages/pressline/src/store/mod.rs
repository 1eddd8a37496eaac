//! Job store contract: the claim protocol.
//!
//! Every mutation in [`JobStore`] is a single atomic conditional state
//! transition: the status check and the write happen together, never
//! as a read-modify-write pair. Multiple workers and the sweeper may
//! race on the same job id; exactly one caller observes its
//! precondition hold, the rest see a no-op.
//!
//! Two implementations:
//! - [`PostgresJobStore`] — production; each mutation is one SQL
//!   statement with a `WHERE status = ...` guard, claims use
//!   `FOR UPDATE SKIP LOCKED`.
//! - [`MemoryJobStore`] — in-process; identical conditional semantics
//!   behind a mutex. Used by the test suite and embedded deployments.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::job::{Job, JobRun, JobStatus};

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

/// Durable store of `Job` and `JobRun` rows; the single source of
/// truth for job status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job.
    async fn enqueue(&self, job: Job) -> StoreResult<Job>;

    /// Claim the oldest eligible pending job: atomically set
    /// `status = processing` and `claimed_at = now`. Returns `None`
    /// when nothing is eligible. No two concurrent callers can claim
    /// the same job.
    async fn claim_next_job(&self, worker_id: &str) -> StoreResult<Option<Job>>;

    /// Cooperative give-back: `processing -> pending`, clearing
    /// `claimed_at`. `false` if the job was not processing.
    async fn release_job(&self, id: Uuid) -> StoreResult<bool>;

    /// `processing -> completed`, setting `completed_at`. `false` if
    /// the job was not processing (e.g. the sweeper recovered it
    /// mid-flight and the completion lost the race).
    async fn complete_job(&self, id: Uuid) -> StoreResult<bool>;

    /// Handler failure: atomically increment `retry_count`; below the
    /// cap the job goes back to `pending` with `last_error` set, at
    /// the cap it goes terminally `failed`. Returns the resulting
    /// status, or `None` if the job was not processing.
    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<Option<JobStatus>>;

    /// Sweeper/operator recovery: `processing -> pending`, clearing
    /// `claimed_at` and writing `last_error`, guarded on the job still
    /// being `processing`. Never touches `retry_count`. `false` when
    /// the guard fails (the job completed, or was already reset).
    async fn reset_job(&self, id: Uuid, error: &str) -> StoreResult<bool>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    /// Processing jobs whose claim predates `claimed_before`, oldest
    /// claim first, capped at `limit`.
    async fn find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>>;

    async fn count_by_status(&self, status: JobStatus) -> StoreResult<i64>;

    /// Append an immutable run record.
    async fn record_run(&self, run: JobRun) -> StoreResult<JobRun>;

    /// Run records created at or after `since`, oldest first.
    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<JobRun>>;

    /// Retention: delete run records created before `cutoff`. Returns
    /// the number deleted.
    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Retention: delete jobs that completed before `cutoff`. Only
    /// `completed` rows are eligible; every other status is kept.
    async fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}
