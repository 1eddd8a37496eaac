//! Configuration.
//!
//! `QueueConfig` is the explicit knob set passed into each component
//! at construction; nothing reads process-wide mutable state. `Config`
//! adds the deployment environment (database url, env overrides) for
//! the operational binary.
//!
//! All numeric defaults here are operational tuning, not contract:
//! deployments override them through the environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Cadences for the periodic maintenance schedule.
#[derive(Debug, Clone)]
pub struct ScheduleCadences {
    /// Drain the pending queue.
    pub drain_every: Duration,
    /// Stale-job sweep.
    pub sweep_every: Duration,
    /// Queue health check.
    pub health_every: Duration,
    /// Metrics / alert evaluation.
    pub metrics_every: Duration,
    /// Run-log and completed-job retention cleanup.
    pub cleanup_every: Duration,
}

impl Default for ScheduleCadences {
    fn default() -> Self {
        Self {
            drain_every: Duration::from_secs(120),
            sweep_every: Duration::from_secs(900),
            health_every: Duration::from_secs(600),
            metrics_every: Duration::from_secs(1800),
            cleanup_every: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Handler invocations in flight at once.
    pub max_concurrent_jobs: usize,
    /// A handler running longer than this is failed by the pool.
    pub handler_timeout: Duration,
    /// Worker idle sleep between empty polls.
    pub poll_interval: Duration,
    /// Claim budget per drain pass; `None` drains until empty.
    pub max_batch_size: Option<usize>,
    /// Default retry cap stamped onto new jobs.
    pub max_retries: i32,

    /// A processing job older than this is stale.
    pub processing_timeout: Duration,
    /// Secondary threshold; only changes the recorded stale reason.
    pub max_processing_time: Duration,
    /// Stale jobs handled per sweep pass.
    pub sweep_batch_size: i64,

    /// Rolling window for failure-rate and latency metrics.
    pub alert_window: Duration,
    /// Minimum gap between re-raising the same alert kind.
    pub alert_cooldown: Duration,
    pub failure_rate_warning: f64,
    pub failure_rate_critical: f64,
    pub failure_rate_emergency: f64,
    /// Stale-job count that raises a warning.
    pub stale_jobs_warning: i64,

    pub cadences: ScheduleCadences,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            handler_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            max_batch_size: None,
            max_retries: 3,
            processing_timeout: Duration::from_secs(600),
            max_processing_time: Duration::from_secs(1800),
            sweep_batch_size: 50,
            alert_window: Duration::from_secs(3600),
            alert_cooldown: Duration::from_secs(1800),
            failure_rate_warning: 0.15,
            failure_rate_critical: 0.20,
            failure_rate_emergency: 0.30,
            stale_jobs_warning: 5,
            cadences: ScheduleCadences::default(),
        }
    }
}

/// Deployment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut queue = QueueConfig::default();
        if let Some(n) = parse_env("PRESSLINE_MAX_CONCURRENT_JOBS")? {
            queue.max_concurrent_jobs = n;
        }
        if let Some(secs) = parse_env("PRESSLINE_HANDLER_TIMEOUT_SECS")? {
            queue.handler_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("PRESSLINE_PROCESSING_TIMEOUT_SECS")? {
            queue.processing_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("PRESSLINE_MAX_PROCESSING_TIME_SECS")? {
            queue.max_processing_time = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env("PRESSLINE_SWEEP_BATCH_SIZE")? {
            queue.sweep_batch_size = n;
        }
        if let Some(n) = parse_env("PRESSLINE_MAX_RETRIES")? {
            queue.max_retries = n;
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => {
            let parsed = raw
                .parse::<T>()
                .with_context(|| format!("{name} must be a valid number"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
