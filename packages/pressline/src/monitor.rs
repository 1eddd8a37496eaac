//! Queue monitoring and tiered alerting.
//!
//! Reads `Job`/`JobRun` history only; never mutates job state.
//! Failure rate and latency percentiles are computed per rolling
//! window, classified against three increasing thresholds, and
//! rate-limited per alert kind by a cooldown so a bad hour does not
//! flood the log.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::job::{JobStatus, RunStatus};
use crate::scheduler::TickAction;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => f.write_str("warning"),
            AlertSeverity::Critical => f.write_str("critical"),
            AlertSeverity::Emergency => f.write_str("emergency"),
        }
    }
}

/// What an alert is about; cooldowns apply per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FailureRate,
    StaleJobs,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Metrics over one rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub window_secs: u64,
    pub total_attempts: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sweeper/operator recoveries in the window.
    pub recoveries: usize,
    pub failure_rate: f64,
    pub latency_p50_ms: i64,
    pub latency_p95_ms: i64,
    pub latency_max_ms: i64,
    pub pending: i64,
    pub processing: i64,
    pub stale_jobs_count: i64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window: Duration,
    pub cooldown: Duration,
    pub failure_rate_warning: f64,
    pub failure_rate_critical: f64,
    pub failure_rate_emergency: f64,
    pub stale_jobs_warning: i64,
    /// Staleness cutoff used for `stale_jobs_count`.
    pub stale_after: Duration,
    /// Upper bound on the stale scan.
    pub stale_scan_limit: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            cooldown: Duration::from_secs(1800),
            failure_rate_warning: 0.15,
            failure_rate_critical: 0.20,
            failure_rate_emergency: 0.30,
            stale_jobs_warning: 5,
            stale_after: Duration::from_secs(600),
            stale_scan_limit: 1000,
        }
    }
}

impl From<&QueueConfig> for MonitorConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            window: config.alert_window,
            cooldown: config.alert_cooldown,
            failure_rate_warning: config.failure_rate_warning,
            failure_rate_critical: config.failure_rate_critical,
            failure_rate_emergency: config.failure_rate_emergency,
            stale_jobs_warning: config.stale_jobs_warning,
            stale_after: config.processing_timeout,
            ..Default::default()
        }
    }
}

impl MonitorConfig {
    fn classify_failure_rate(&self, rate: f64) -> Option<(AlertSeverity, f64)> {
        if rate >= self.failure_rate_emergency {
            Some((AlertSeverity::Emergency, self.failure_rate_emergency))
        } else if rate >= self.failure_rate_critical {
            Some((AlertSeverity::Critical, self.failure_rate_critical))
        } else if rate >= self.failure_rate_warning {
            Some((AlertSeverity::Warning, self.failure_rate_warning))
        } else {
            None
        }
    }
}

/// Read-only observer over a [`JobStore`].
pub struct Monitor<S: JobStore> {
    store: Arc<S>,
    config: MonitorConfig,
    last_raised: Mutex<HashMap<AlertKind, DateTime<Utc>>>,
}

impl<S: JobStore> Monitor<S> {
    pub fn new(store: Arc<S>, config: MonitorConfig) -> Self {
        Self {
            store,
            config,
            last_raised: Mutex::new(HashMap::new()),
        }
    }

    /// Compute metrics over one rolling window.
    pub async fn metrics(&self, window: Duration) -> Result<QueueMetrics> {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(window.as_secs() as i64);
        let runs = self.store.runs_since(since).await?;

        let succeeded = runs.iter().filter(|r| r.status == RunStatus::Success).count();
        let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
        let recoveries = runs.iter().filter(|r| r.status == RunStatus::Retrying).count();
        let total_attempts = succeeded + failed;
        let failure_rate = if total_attempts == 0 {
            0.0
        } else {
            failed as f64 / total_attempts as f64
        };

        let mut latencies: Vec<i64> = runs
            .iter()
            .filter(|r| r.status != RunStatus::Retrying)
            .map(|r| r.execution_time_ms)
            .collect();
        latencies.sort_unstable();

        let stale_cutoff =
            now - chrono::Duration::seconds(self.config.stale_after.as_secs() as i64);
        let stale_jobs_count = self
            .store
            .find_stale_jobs(stale_cutoff, self.config.stale_scan_limit)
            .await?
            .len() as i64;

        Ok(QueueMetrics {
            window_secs: window.as_secs(),
            total_attempts,
            succeeded,
            failed,
            recoveries,
            failure_rate,
            latency_p50_ms: percentile(&latencies, 50),
            latency_p95_ms: percentile(&latencies, 95),
            latency_max_ms: latencies.last().copied().unwrap_or(0),
            pending: self.store.count_by_status(JobStatus::Pending).await?,
            processing: self.store.count_by_status(JobStatus::Processing).await?,
            stale_jobs_count,
            computed_at: now,
        })
    }

    /// Compute metrics over the configured window and evaluate them.
    pub async fn check(&self) -> Result<Vec<Alert>> {
        let metrics = self.metrics(self.config.window).await?;
        Ok(self.evaluate(&metrics))
    }

    /// Evaluate precomputed metrics against the thresholds and raise
    /// any alerts not silenced by their cooldown. No store access;
    /// callers that already hold metrics avoid a second scan.
    pub fn evaluate(&self, metrics: &QueueMetrics) -> Vec<Alert> {
        let now = metrics.computed_at;
        let mut alerts = Vec::new();

        if let Some((severity, threshold)) = self.config.classify_failure_rate(metrics.failure_rate)
        {
            alerts.push(Alert {
                kind: AlertKind::FailureRate,
                severity,
                message: format!(
                    "failure rate {:.1}% over the last {}s ({} of {} attempts)",
                    metrics.failure_rate * 100.0,
                    metrics.window_secs,
                    metrics.failed,
                    metrics.total_attempts
                ),
                value: metrics.failure_rate,
                threshold,
                raised_at: now,
            });
        }

        if metrics.stale_jobs_count >= self.config.stale_jobs_warning {
            alerts.push(Alert {
                kind: AlertKind::StaleJobs,
                severity: AlertSeverity::Warning,
                message: format!("{} stale jobs awaiting recovery", metrics.stale_jobs_count),
                value: metrics.stale_jobs_count as f64,
                threshold: self.config.stale_jobs_warning as f64,
                raised_at: now,
            });
        }

        let cooldown = chrono::Duration::seconds(self.config.cooldown.as_secs() as i64);
        let mut last_raised = self.lock_last_raised();
        let alerts: Vec<Alert> = alerts
            .into_iter()
            .filter(|alert| {
                let silenced = last_raised
                    .get(&alert.kind)
                    .is_some_and(|&at| now - at < cooldown);
                if silenced {
                    debug!(kind = ?alert.kind, "alert silenced by cooldown");
                    return false;
                }
                last_raised.insert(alert.kind, now);
                true
            })
            .collect();
        drop(last_raised);

        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Warning => {
                    warn!(kind = ?alert.kind, value = alert.value, "{}", alert.message)
                }
                AlertSeverity::Critical | AlertSeverity::Emergency => {
                    error!(kind = ?alert.kind, severity = %alert.severity, value = alert.value, "{}", alert.message)
                }
            }
        }

        alerts
    }

    fn lock_last_raised(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<AlertKind, DateTime<Utc>>> {
        self.last_raised.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<S: JobStore + 'static> TickAction for Monitor<S> {
    async fn tick(&self) -> Result<()> {
        self.check().await.map(|_| ())
    }
}

/// Periodic health log line: queue depths and stale count.
pub struct HealthCheck<S: JobStore> {
    store: Arc<S>,
    stale_after: Duration,
}

impl<S: JobStore> HealthCheck<S> {
    pub fn new(store: Arc<S>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }
}

#[async_trait]
impl<S: JobStore + 'static> TickAction for HealthCheck<S> {
    async fn tick(&self) -> Result<()> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.stale_after.as_secs() as i64);
        let pending = self.store.count_by_status(JobStatus::Pending).await?;
        let processing = self.store.count_by_status(JobStatus::Processing).await?;
        let failed = self.store.count_by_status(JobStatus::Failed).await?;
        let stale = self.store.find_stale_jobs(cutoff, 1000).await?.len();

        if stale > 0 {
            warn!(pending, processing, failed, stale, "queue health: stale jobs present");
        } else {
            info!(pending, processing, failed, stale, "queue health");
        }
        Ok(())
    }
}

/// Nearest-rank percentile over sorted values; 0 for an empty slice.
fn percentile(sorted: &[i64], pct: usize) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
