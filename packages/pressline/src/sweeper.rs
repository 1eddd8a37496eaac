//! Sweeper: stale-job detection and lease recovery.
//!
//! A job claimed by a worker that then crashed, hung, or timed out
//! without reporting leaves the queue with `status = processing` and
//! an expired lease. The sweeper finds those rows and returns them to
//! `pending` through the guarded `processing -> pending` reset.
//!
//! The one race that matters: the original worker may complete the
//! job between the sweeper's stale-scan read and its reset write. The
//! reset is conditional on the row still being `processing`, so in
//! that case it affects zero rows and the completion stands. A lost
//! reset is counted in the sweep summary, never treated as an error.
//!
//! A sweeper reset is not a handler failure: `retry_count` is never
//! touched, and the audit record uses `retry_attempt = 0`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::job::{ErrorDetails, JobRun, JobStatus, RunActor, RunStatus, StaleReason};
use crate::scheduler::TickAction;
use crate::store::JobStore;

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Lease length: a processing job older than this is stale.
    pub processing_timeout: Duration,
    /// Secondary threshold; selects the recorded stale reason, never
    /// changes the reset action.
    pub max_processing_time: Duration,
    /// Stale jobs handled per sweep pass.
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(600),
            max_processing_time: Duration::from_secs(1800),
            batch_size: 50,
        }
    }
}

impl From<&QueueConfig> for SweeperConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            processing_timeout: config.processing_timeout,
            max_processing_time: config.max_processing_time,
            batch_size: config.sweep_batch_size,
        }
    }
}

/// Per-job detail in a sweep summary.
#[derive(Debug, Clone, Serialize)]
pub struct SweptJob {
    pub job_id: Uuid,
    pub stale_reason: StaleReason,
    pub processing_seconds: i64,
    /// Whether the conditional reset took effect.
    pub reset: bool,
}

/// Structured result of one sweep pass.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub dry_run: bool,
    /// Processing jobs in the store when the scan started.
    pub total_jobs_checked: i64,
    pub stale_jobs_found: usize,
    pub jobs_reset: usize,
    /// Conditional resets that affected zero rows (lost the race to a
    /// completion or another sweep), plus per-job store failures.
    pub jobs_failed: usize,
    pub jobs: Vec<SweptJob>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Recovery statistics over a rolling window, recomputed from the run
/// log. Every reset leaves one `retrying` run, so the audit trail is
/// the durable counter; the numbers do not depend on which process
/// ran the sweeps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStatistics {
    pub window_secs: u64,
    pub sweeper_resets: u64,
    pub operator_resets: u64,
    pub last_recovery_at: Option<DateTime<Utc>>,
}

/// Outcome of one manual reset request.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub job_id: Uuid,
    pub reset: bool,
    pub detail: String,
}

/// Background recovery pass over a [`JobStore`].
pub struct Sweeper<S: JobStore> {
    store: Arc<S>,
    config: SweeperConfig,
}

impl<S: JobStore> Sweeper<S> {
    pub fn new(store: Arc<S>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// One scan-and-recover pass.
    ///
    /// With `dry_run` the stale set and intended actions are computed
    /// and reported but no row is mutated. `max_jobs` overrides the
    /// configured batch size for this pass.
    pub async fn sweep(&self, dry_run: bool, max_jobs: Option<i64>) -> Result<SweepSummary> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let limit = max_jobs.unwrap_or(self.config.batch_size);

        let total_jobs_checked = self.store.count_by_status(JobStatus::Processing).await?;
        let cutoff = started_at - chrono::Duration::seconds(self.config.processing_timeout.as_secs() as i64);
        let stale = self.store.find_stale_jobs(cutoff, limit).await?;

        let mut summary = SweepSummary {
            dry_run,
            total_jobs_checked,
            stale_jobs_found: stale.len(),
            jobs_reset: 0,
            jobs_failed: 0,
            jobs: Vec::with_capacity(stale.len()),
            started_at,
            duration_ms: 0,
        };

        for job in stale {
            let Some(processing_seconds) = job.processing_seconds(started_at) else {
                // Should not happen: stale implies claimed. Skip
                // rather than guessing a duration.
                warn!(job_id = %job.id, "stale job without claimed_at, skipping");
                continue;
            };
            let reason =
                if processing_seconds > self.config.max_processing_time.as_secs() as i64 {
                    StaleReason::MaxProcessingTimeExceeded
                } else {
                    StaleReason::ProcessingTimeout
                };

            if dry_run {
                debug!(job_id = %job.id, %reason, processing_seconds, "dry run, would reset");
                summary.jobs.push(SweptJob {
                    job_id: job.id,
                    stale_reason: reason,
                    processing_seconds,
                    reset: false,
                });
                continue;
            }

            let error = format!(
                "Job reset by sweeper: {reason} (processing for {processing_seconds}s)"
            );
            let reset = match self.store.reset_job(job.id, &error).await {
                Ok(true) => {
                    summary.jobs_reset += 1;
                    self.record_recovery(job.id, reason, processing_seconds).await;
                    info!(job_id = %job.id, %reason, processing_seconds, "stale job reset to pending");
                    true
                }
                Ok(false) => {
                    // Completed (or re-swept) between our read and
                    // this write; the other transition stands.
                    summary.jobs_failed += 1;
                    debug!(job_id = %job.id, "reset lost the race, leaving job as-is");
                    false
                }
                Err(e) => {
                    summary.jobs_failed += 1;
                    warn!(job_id = %job.id, error = %e, "reset failed, continuing sweep");
                    false
                }
            };
            summary.jobs.push(SweptJob {
                job_id: job.id,
                stale_reason: reason,
                processing_seconds,
                reset,
            });
        }

        summary.duration_ms = timer.elapsed().as_millis() as u64;

        info!(
            dry_run,
            total_jobs_checked,
            stale_jobs_found = summary.stale_jobs_found,
            jobs_reset = summary.jobs_reset,
            jobs_failed = summary.jobs_failed,
            duration_ms = summary.duration_ms,
            "sweep complete"
        );
        Ok(summary)
    }

    /// Operator path: reset specific jobs by id, independent of
    /// staleness, with a free-text reason. Same conditional guard and
    /// audit trail as the automatic sweep.
    pub async fn reset_jobs(&self, ids: &[Uuid], reason: &str) -> Result<Vec<ResetOutcome>> {
        let now = Utc::now();
        let mut outcomes = Vec::with_capacity(ids.len());

        for &id in ids {
            let outcome = match self.store.get_job(id).await? {
                None => ResetOutcome {
                    job_id: id,
                    reset: false,
                    detail: "job not found".to_string(),
                },
                Some(job) if job.status != JobStatus::Processing => ResetOutcome {
                    job_id: id,
                    reset: false,
                    detail: format!("not processing (status: {})", job.status),
                },
                Some(job) => {
                    let processing_seconds = job.processing_seconds(now).unwrap_or(0);
                    let error = format!("Job reset by operator: {reason}");
                    match self.store.reset_job(id, &error).await? {
                        true => {
                            let run = JobRun::builder()
                                .job_id(id)
                                .status(RunStatus::Retrying)
                                .retry_attempt(0)
                                .error_details(ErrorDetails {
                                    reason: reason.to_string(),
                                    processing_seconds,
                                    actor: RunActor::Operator,
                                })
                                .build();
                            if let Err(e) = self.store.record_run(run).await {
                                warn!(job_id = %id, error = %e, "failed to record reset run");
                            }
                            info!(job_id = %id, reason, "job reset by operator");
                            ResetOutcome {
                                job_id: id,
                                reset: true,
                                detail: "reset to pending".to_string(),
                            }
                        }
                        false => ResetOutcome {
                            job_id: id,
                            reset: false,
                            detail: "reset lost the race, job no longer processing".to_string(),
                        },
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Recovery statistics over the trailing `window`, derived from
    /// run history.
    pub async fn statistics(&self, window: Duration) -> Result<SweepStatistics> {
        let since = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let runs = self.store.runs_since(since).await?;

        let mut stats = SweepStatistics {
            window_secs: window.as_secs(),
            ..Default::default()
        };
        for run in runs.iter().filter(|r| r.status == RunStatus::Retrying) {
            match run.error_details.as_ref().map(|d| d.actor) {
                Some(RunActor::Sweeper) => stats.sweeper_resets += 1,
                Some(RunActor::Operator) => stats.operator_resets += 1,
                _ => continue,
            }
            // runs_since returns oldest first.
            stats.last_recovery_at = Some(run.created_at);
        }
        Ok(stats)
    }

    async fn record_recovery(&self, job_id: Uuid, reason: StaleReason, processing_seconds: i64) {
        let run = JobRun::builder()
            .job_id(job_id)
            .status(RunStatus::Retrying)
            .retry_attempt(0)
            .error_details(ErrorDetails {
                reason: reason.to_string(),
                processing_seconds,
                actor: RunActor::Sweeper,
            })
            .build();
        if let Err(e) = self.store.record_run(run).await {
            warn!(job_id = %job_id, error = %e, "failed to record recovery run");
        }
    }
}

#[async_trait]
impl<S: JobStore + 'static> TickAction for Sweeper<S> {
    async fn tick(&self) -> Result<()> {
        self.sweep(false, None).await.map(|_| ())
    }
}

/// Retention thresholds for the daily history cleanup.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Run records older than this are deleted.
    pub run_retention: Duration,
    /// Completed jobs older than this are deleted.
    pub completed_job_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_retention: Duration::from_secs(30 * 24 * 3600),
            completed_job_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Daily cleanup: trims old run records and long-completed jobs so
/// the history tables stay bounded. Pending, processing, and failed
/// jobs are never touched.
pub struct Cleanup<S: JobStore> {
    store: Arc<S>,
    config: RetentionConfig,
}

impl<S: JobStore> Cleanup<S> {
    pub fn new(store: Arc<S>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// One cleanup pass; returns (runs deleted, jobs deleted).
    pub async fn run_once(&self) -> Result<(u64, u64)> {
        let now = Utc::now();
        let runs_cutoff =
            now - chrono::Duration::seconds(self.config.run_retention.as_secs() as i64);
        let jobs_cutoff = now
            - chrono::Duration::seconds(self.config.completed_job_retention.as_secs() as i64);

        let runs_deleted = self.store.delete_runs_before(runs_cutoff).await?;
        let jobs_deleted = self.store.delete_completed_jobs_before(jobs_cutoff).await?;
        info!(runs_deleted, jobs_deleted, "history cleanup complete");
        Ok((runs_deleted, jobs_deleted))
    }
}

#[async_trait]
impl<S: JobStore + 'static> TickAction for Cleanup<S> {
    async fn tick(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::MemoryJobStore;

    async fn claimed_job(store: &MemoryJobStore, age_secs: i64) -> Job {
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();
        let claimed = store.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        store.set_claimed_at(job.id, Utc::now() - chrono::Duration::seconds(age_secs));
        claimed
    }

    #[tokio::test]
    async fn fresh_processing_jobs_are_not_stale() {
        let store = Arc::new(MemoryJobStore::new());
        claimed_job(&store, 30).await;

        let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        let summary = sweeper.sweep(false, None).await.unwrap();

        assert_eq!(summary.total_jobs_checked, 1);
        assert_eq!(summary.stale_jobs_found, 0);
        assert_eq!(summary.jobs_reset, 0);
    }

    #[tokio::test]
    async fn long_stall_is_classified_as_max_processing_time() {
        let store = Arc::new(MemoryJobStore::new());
        claimed_job(&store, 2000).await;

        let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        let summary = sweeper.sweep(false, None).await.unwrap();

        assert_eq!(summary.jobs_reset, 1);
        assert_eq!(
            summary.jobs[0].stale_reason,
            StaleReason::MaxProcessingTimeExceeded
        );
    }

    #[tokio::test]
    async fn batch_size_caps_a_pass() {
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..3 {
            claimed_job(&store, 700).await;
        }

        let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        let summary = sweeper.sweep(false, Some(2)).await.unwrap();

        assert_eq!(summary.stale_jobs_found, 2);
        assert_eq!(summary.jobs_reset, 2);
        assert_eq!(
            store.count_by_status(JobStatus::Processing).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn manual_reset_reports_per_id_outcomes() {
        let store = Arc::new(MemoryJobStore::new());
        let processing = claimed_job(&store, 30).await;
        let pending = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();
        let missing = Uuid::new_v4();

        let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        let outcomes = sweeper
            .reset_jobs(&[processing.id, pending.id, missing], "stuck deploy")
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].reset);
        assert!(!outcomes[1].reset);
        assert!(outcomes[1].detail.contains("not processing"));
        assert!(!outcomes[2].reset);
        assert_eq!(outcomes[2].detail, "job not found");

        let job = store.get_job(processing.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.as_deref().unwrap().contains("stuck deploy"));

        // Operator resets are audited like sweeper resets.
        let runs = store.all_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Retrying);
        assert_eq!(
            runs[0].error_details.as_ref().unwrap().actor,
            RunActor::Operator
        );
    }

    #[tokio::test]
    async fn statistics_derive_from_run_history() {
        let store = Arc::new(MemoryJobStore::new());
        claimed_job(&store, 700).await;
        let manual = claimed_job(&store, 30).await;

        let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        sweeper.sweep(false, None).await.unwrap();
        sweeper.reset_jobs(&[manual.id], "stuck deploy").await.unwrap();

        // A different instance sees the same numbers: the run log is
        // the counter, not in-process state.
        let other = Sweeper::new(Arc::clone(&store), SweeperConfig::default());
        let stats = other.statistics(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.sweeper_resets, 1);
        assert_eq!(stats.operator_resets, 1);
        assert!(stats.last_recovery_at.is_some());
    }

    #[tokio::test]
    async fn cleanup_trims_old_history_but_keeps_live_jobs() {
        let store = Arc::new(MemoryJobStore::new());

        let mut old_done = Job::for_payload("publish_article", serde_json::Value::Null);
        old_done.status = JobStatus::Completed;
        old_done.completed_at = Some(Utc::now() - chrono::Duration::days(60));
        let old_done = store.enqueue(old_done).await.unwrap();

        let mut fresh_done = Job::for_payload("publish_article", serde_json::Value::Null);
        fresh_done.status = JobStatus::Completed;
        fresh_done.completed_at = Some(Utc::now());
        let fresh_done = store.enqueue(fresh_done).await.unwrap();

        let pending = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();

        let mut old_run = JobRun::builder()
            .job_id(old_done.id)
            .status(RunStatus::Success)
            .build();
        old_run.created_at = Utc::now() - chrono::Duration::days(60);
        store.record_run(old_run).await.unwrap();
        store
            .record_run(
                JobRun::builder()
                    .job_id(fresh_done.id)
                    .status(RunStatus::Success)
                    .build(),
            )
            .await
            .unwrap();

        let cleanup = Cleanup::new(Arc::clone(&store), RetentionConfig::default());
        let (runs_deleted, jobs_deleted) = cleanup.run_once().await.unwrap();

        assert_eq!(runs_deleted, 1);
        assert_eq!(jobs_deleted, 1);
        assert!(store.get_job(old_done.id).await.unwrap().is_none());
        assert!(store.get_job(fresh_done.id).await.unwrap().is_some());
        assert!(store.get_job(pending.id).await.unwrap().is_some());
        assert_eq!(store.all_runs().len(), 1);
    }
}
