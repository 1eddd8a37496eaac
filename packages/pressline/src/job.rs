//! Job and JobRun models.
//!
//! A [`Job`] is the unit of work: a payload waiting in the durable
//! queue to be claimed, processed, and completed (or failed). A
//! [`JobRun`] is an append-only audit record, one per execution
//! attempt or recovery event; it is never mutated after creation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single execution attempt or recovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Retrying,
}

/// Who caused a run record to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunActor {
    Worker,
    Sweeper,
    Operator,
}

impl fmt::Display for RunActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunActor::Worker => f.write_str("worker"),
            RunActor::Sweeper => f.write_str("sweeper"),
            RunActor::Operator => f.write_str("operator"),
        }
    }
}

/// Why the sweeper considered a processing job stale.
///
/// The reason only changes what the audit trail records; the reset
/// action is the same either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    ProcessingTimeout,
    MaxProcessingTimeExceeded,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::ProcessingTimeout => f.write_str("Processing timeout"),
            StaleReason::MaxProcessingTimeExceeded => {
                f.write_str("Exceeded maximum processing time")
            }
        }
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Handler routing key.
    pub job_type: String,

    /// Opaque handler input.
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Set when a worker claims the job; non-null iff `Processing`.
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    /// Handler-level failed attempts. Never touched by the sweeper.
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,

    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job for a payload (convenience constructor).
    pub fn for_payload(job_type: &str, payload: serde_json::Value) -> Self {
        Self::builder()
            .job_type(job_type.to_string())
            .payload(payload)
            .build()
    }

    /// Whether a `claim_next_job` call may return this job.
    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Pending && self.retry_count < self.max_retries
    }

    /// Seconds this job has spent in `processing`, if claimed.
    pub fn processing_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.claimed_at
            .map(|claimed| (now - claimed).num_seconds())
    }
}

// ============================================================================
// JobRun
// ============================================================================

/// Structured failure/recovery context attached to a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub reason: String,
    pub processing_seconds: i64,
    pub actor: RunActor,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRun {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Reference to the job this run belongs to. The job owns its
    /// lifecycle; the run is an immutable log entry.
    pub job_id: Uuid,

    pub status: RunStatus,

    /// Which retry this attempt was (0 = first attempt). Sweeper
    /// recoveries always record 0.
    #[builder(default = 0)]
    pub retry_attempt: i32,

    #[builder(default = 0)]
    pub execution_time_ms: i64,

    #[builder(default, setter(strip_option))]
    pub error_details: Option<ErrorDetails>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::for_payload("publish_article", serde_json::json!({"topic": "t"}))
    }

    #[test]
    fn new_job_starts_pending() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_at.is_none());
    }

    #[test]
    fn new_job_has_default_max_retries_of_3() {
        let job = sample_job();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn job_at_retry_cap_is_not_claimable() {
        let mut job = sample_job();
        job.retry_count = job.max_retries;
        assert!(!job.is_claimable());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn stale_reason_display_matches_audit_wording() {
        assert_eq!(StaleReason::ProcessingTimeout.to_string(), "Processing timeout");
        assert_eq!(
            StaleReason::MaxProcessingTimeExceeded.to_string(),
            "Exceeded maximum processing time"
        );
    }

    #[test]
    fn processing_seconds_requires_a_claim() {
        let mut job = sample_job();
        assert_eq!(job.processing_seconds(Utc::now()), None);

        let now = Utc::now();
        job.claimed_at = Some(now - chrono::Duration::seconds(90));
        assert_eq!(job.processing_seconds(now), Some(90));
    }
}
