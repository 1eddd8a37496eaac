//! PostgreSQL-backed job store.
//!
//! Every protocol mutation is a single SQL statement whose `WHERE`
//! clause carries the status guard, so the precondition check and the
//! write are one atomic unit. Claims lock the candidate row with
//! `FOR UPDATE SKIP LOCKED` inside a CTE: concurrent claimers skip
//! rows another transaction has already locked instead of blocking or
//! double-claiming.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::job::{ErrorDetails, Job, JobRun, JobStatus, RunStatus};

use super::JobStore;

const JOB_COLUMNS: &str = "id, job_type, payload, status, claimed_at, worker_id, \
     retry_count, max_retries, last_error, created_at, updated_at, completed_at";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Row shape for `job_runs`; `error_details` travels as JSONB.
#[derive(FromRow)]
struct JobRunRow {
    id: Uuid,
    job_id: Uuid,
    status: RunStatus,
    retry_attempt: i32,
    execution_time_ms: i64,
    error_details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = StoreError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        let error_details = row
            .error_details
            .map(serde_json::from_value::<ErrorDetails>)
            .transpose()
            .map_err(|e| StoreError::InvalidInput(format!("bad error_details: {e}")))?;

        Ok(JobRun {
            id: row.id,
            job_id: row.job_id,
            status: row.status,
            retry_attempt: row.retry_attempt,
            execution_time_ms: row.execution_time_ms,
            error_details,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: Job) -> StoreResult<Job> {
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, claimed_at, worker_id,
                retry_count, max_retries, last_error, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.claimed_at)
        .bind(&job.worker_id)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn claim_next_job(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND retry_count < max_retries
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                claimed_at = NOW(),
                worker_id = $1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn release_job(&self, id: Uuid) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                claimed_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                claimed_at = NULL,
                worker_id = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> StoreResult<Option<JobStatus>> {
        // Retry-vs-terminal is decided inside the statement so the
        // increment and the status choice cannot tear.
        let status = sqlx::query_scalar::<_, JobStatus>(
            r#"
            UPDATE jobs
            SET retry_count = retry_count + 1,
                status = CASE
                    WHEN retry_count + 1 >= max_retries THEN 'failed'::job_status
                    ELSE 'pending'::job_status
                END,
                claimed_at = NULL,
                worker_id = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn reset_job(&self, id: Uuid, error: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                claimed_at = NULL,
                worker_id = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'processing' AND claimed_at < $1
            ORDER BY claimed_at ASC
            LIMIT $2
            "#
        ))
        .bind(claimed_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_by_status(&self, status: JobStatus) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE status = $1",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn record_run(&self, run: JobRun) -> StoreResult<JobRun> {
        let error_details = run
            .error_details
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::InvalidInput(format!("bad error_details: {e}")))?;

        let row = sqlx::query_as::<_, JobRunRow>(
            r#"
            INSERT INTO job_runs (
                id, job_id, status, retry_attempt, execution_time_ms, error_details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, job_id, status, retry_attempt, execution_time_ms, error_details, created_at
            "#,
        )
        .bind(run.id)
        .bind(run.job_id)
        .bind(run.status)
        .bind(run.retry_attempt)
        .bind(run.execution_time_ms)
        .bind(error_details)
        .bind(run.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(
            r#"
            SELECT id, job_id, status, retry_attempt, execution_time_ms, error_details, created_at
            FROM job_runs
            WHERE created_at >= $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let affected = sqlx::query("DELETE FROM job_runs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected)
    }

    async fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let affected = sqlx::query(
            "DELETE FROM jobs WHERE status = 'completed' AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }
}
