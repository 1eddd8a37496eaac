//! Maintenance invocation surface.
//!
//! One entry point, selectable by mode: `sweep` (recover stale jobs),
//! `stats` (sweep statistics + queue counts), `health` (queue depth
//! snapshot), `reset` (manual per-id reset), `monitor` (metrics +
//! alerts). Every mode returns a structured, serializable report;
//! operator errors (unknown mode, reset without ids) are validation
//! failures raised before any mutation is attempted.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::job::JobStatus;
use crate::monitor::{Alert, Monitor, MonitorConfig, QueueMetrics};
use crate::store::JobStore;
use crate::sweeper::{ResetOutcome, SweepStatistics, SweepSummary, Sweeper, SweeperConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OpsMode {
    Sweep,
    Stats,
    Health,
    Reset,
    Monitor,
}

impl FromStr for OpsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sweep" => Ok(OpsMode::Sweep),
            "stats" => Ok(OpsMode::Stats),
            "health" => Ok(OpsMode::Health),
            "reset" => Ok(OpsMode::Reset),
            "monitor" => Ok(OpsMode::Monitor),
            other => bail!("unsupported mode: {other}"),
        }
    }
}

/// Parameters shared across modes; modes ignore what they don't use.
#[derive(Debug, Clone, Default)]
pub struct OpsParams {
    pub dry_run: bool,
    pub max_jobs: Option<i64>,
    pub job_ids: Vec<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub counts: QueueCounts,
    pub stale_jobs_count: usize,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OpsReport {
    Sweep(SweepSummary),
    Stats {
        statistics: SweepStatistics,
        counts: QueueCounts,
    },
    Health(HealthReport),
    Reset {
        outcomes: Vec<ResetOutcome>,
    },
    Monitor {
        metrics: QueueMetrics,
        alerts: Vec<Alert>,
    },
}

async fn queue_counts<S: JobStore>(store: &S) -> Result<QueueCounts> {
    Ok(QueueCounts {
        pending: store.count_by_status(JobStatus::Pending).await?,
        processing: store.count_by_status(JobStatus::Processing).await?,
        completed: store.count_by_status(JobStatus::Completed).await?,
        failed: store.count_by_status(JobStatus::Failed).await?,
    })
}

/// Run one maintenance mode against a store.
pub async fn run_mode<S: JobStore + 'static>(
    mode: OpsMode,
    params: OpsParams,
    store: Arc<S>,
    config: &QueueConfig,
) -> Result<OpsReport> {
    match mode {
        OpsMode::Sweep => {
            let sweeper = Sweeper::new(store, SweeperConfig::from(config));
            let summary = sweeper.sweep(params.dry_run, params.max_jobs).await?;
            Ok(OpsReport::Sweep(summary))
        }
        OpsMode::Stats => {
            // Statistics come from the durable run log, not from this
            // short-lived process.
            let sweeper = Sweeper::new(Arc::clone(&store), SweeperConfig::from(config));
            let statistics = sweeper.statistics(config.alert_window).await?;
            let counts = queue_counts(store.as_ref()).await?;
            Ok(OpsReport::Stats { statistics, counts })
        }
        OpsMode::Health => {
            let now = Utc::now();
            let cutoff = now
                - chrono::Duration::seconds(config.processing_timeout.as_secs() as i64);
            let counts = queue_counts(store.as_ref()).await?;
            let stale = store.find_stale_jobs(cutoff, config.sweep_batch_size).await?;
            Ok(OpsReport::Health(HealthReport {
                healthy: stale.is_empty(),
                stale_jobs_count: stale.len(),
                counts,
                checked_at: now,
            }))
        }
        OpsMode::Reset => {
            if params.job_ids.is_empty() {
                bail!("reset requires at least one job id");
            }
            let reason = params.reason.as_deref().unwrap_or("manual reset");
            let sweeper = Sweeper::new(store, SweeperConfig::from(config));
            let outcomes = sweeper.reset_jobs(&params.job_ids, reason).await?;
            Ok(OpsReport::Reset { outcomes })
        }
        OpsMode::Monitor => {
            let monitor = Monitor::new(Arc::clone(&store), MonitorConfig::from(config));
            let metrics = monitor.metrics(config.alert_window).await?;
            let alerts = monitor.evaluate(&metrics);
            Ok(OpsReport::Monitor { metrics, alerts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::MemoryJobStore;

    #[test]
    fn mode_parses_from_wire_names() {
        assert_eq!("sweep".parse::<OpsMode>().unwrap(), OpsMode::Sweep);
        assert_eq!("monitor".parse::<OpsMode>().unwrap(), OpsMode::Monitor);
    }

    #[test]
    fn unsupported_mode_is_a_validation_failure() {
        let err = "restore".parse::<OpsMode>().unwrap_err();
        assert!(err.to_string().contains("unsupported mode"));
    }

    #[tokio::test]
    async fn reset_without_ids_is_rejected_before_mutation() {
        let store = Arc::new(MemoryJobStore::new());
        let err = run_mode(
            OpsMode::Reset,
            OpsParams::default(),
            store,
            &QueueConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("at least one job id"));
    }

    #[tokio::test]
    async fn health_mode_reports_counts_and_staleness() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();

        let report = run_mode(
            OpsMode::Health,
            OpsParams::default(),
            Arc::clone(&store),
            &QueueConfig::default(),
        )
        .await
        .unwrap();

        match report {
            OpsReport::Health(health) => {
                assert_eq!(health.counts.pending, 1);
                assert_eq!(health.stale_jobs_count, 0);
                assert!(health.healthy);
            }
            other => panic!("expected health report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_mode_reflects_sweep_history() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();
        store.set_claimed_at(job.id, Utc::now() - chrono::Duration::seconds(700));

        let report = run_mode(
            OpsMode::Sweep,
            OpsParams::default(),
            Arc::clone(&store),
            &QueueConfig::default(),
        )
        .await
        .unwrap();
        match report {
            OpsReport::Sweep(summary) => assert_eq!(summary.jobs_reset, 1),
            other => panic!("expected sweep report, got {other:?}"),
        }

        // A later stats invocation sees the recovery: the counters
        // live in the run log, not in the process that swept.
        let report = run_mode(
            OpsMode::Stats,
            OpsParams::default(),
            Arc::clone(&store),
            &QueueConfig::default(),
        )
        .await
        .unwrap();
        match report {
            OpsReport::Stats { statistics, counts } => {
                assert_eq!(statistics.sweeper_resets, 1);
                assert!(statistics.last_recovery_at.is_some());
                assert_eq!(counts.pending, 1);
            }
            other => panic!("expected stats report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_mode_returns_a_structured_summary() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .enqueue(Job::for_payload("publish_article", serde_json::Value::Null))
            .await
            .unwrap();
        store.claim_next_job("w1").await.unwrap().unwrap();
        store.set_claimed_at(job.id, Utc::now() - chrono::Duration::seconds(700));

        let report = run_mode(
            OpsMode::Sweep,
            OpsParams {
                dry_run: true,
                ..Default::default()
            },
            Arc::clone(&store),
            &QueueConfig::default(),
        )
        .await
        .unwrap();

        match report {
            OpsReport::Sweep(summary) => {
                assert!(summary.dry_run);
                assert_eq!(summary.stale_jobs_found, 1);
                assert_eq!(summary.jobs_reset, 0);
            }
            other => panic!("expected sweep report, got {other:?}"),
        }
    }
}
