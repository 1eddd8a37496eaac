//! Periodic maintenance driver.
//!
//! The scheduler holds no business state: each registered task is a
//! name, a cadence, and an idempotent [`TickAction`] ("run one sweep
//! pass", "drain the pending queue once"). A failing tick is logged
//! and retried on its next cadence; it never stops the loop. The only
//! state the scheduler contributes is per-task enablement and
//! last/next run bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScheduleCadences;
use crate::monitor::{HealthCheck, Monitor};
use crate::store::JobStore;
use crate::sweeper::{Cleanup, Sweeper};
use crate::worker::WorkerPool;

/// One idempotent maintenance action, invoked per tick.
#[async_trait]
pub trait TickAction: Send + Sync {
    async fn tick(&self) -> Result<()>;
}

struct ScheduledTask {
    name: String,
    every: Duration,
    enabled: AtomicBool,
    /// Held while a tick is in flight; ticks never overlap.
    running: AtomicBool,
    action: Arc<dyn TickAction>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    next_run: Mutex<DateTime<Utc>>,
}

impl ScheduledTask {
    fn cadence(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.every.as_millis() as i64)
    }

    async fn fire(&self, now: DateTime<Utc>) {
        *self.lock_next() = now + self.cadence();
        debug!(task = %self.name, "firing scheduled task");

        if let Err(e) = self.action.tick().await {
            warn!(task = %self.name, error = %e, "scheduled task failed");
        }
        *self.lock_last() = Some(now);
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_next(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.next_run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Snapshot of one task for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub every_secs: u64,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    /// Ran within twice its cadence (or has not come due yet).
    pub healthy: bool,
}

/// Cadence driver over registered maintenance tasks.
pub struct Scheduler {
    tasks: Vec<Arc<ScheduledTask>>,
    /// Resolution of the due-check loop.
    tick_interval: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            tick_interval: Duration::from_millis(1000),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Register a named periodic task. First run happens one cadence
    /// after the scheduler starts.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        every: Duration,
        action: Arc<dyn TickAction>,
    ) -> &mut Self {
        let name = name.into();
        let next = Utc::now() + chrono::Duration::milliseconds(every.as_millis() as i64);
        self.tasks.push(Arc::new(ScheduledTask {
            name,
            every,
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            action,
            last_run: Mutex::new(None),
            next_run: Mutex::new(next),
        }));
        self
    }

    fn find(&self, name: &str) -> Option<&Arc<ScheduledTask>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// List all tasks with schedule and health state.
    pub fn list(&self) -> Vec<TaskInfo> {
        let now = Utc::now();
        self.tasks
            .iter()
            .map(|task| {
                let last_run = *task.lock_last();
                let healthy = match last_run {
                    Some(t) => now - t <= task.cadence() * 2,
                    // Not yet due counts as healthy; overdue without a
                    // single run does not.
                    None => now <= *task.lock_next() + task.cadence(),
                };
                TaskInfo {
                    name: task.name.clone(),
                    every_secs: task.every.as_secs(),
                    enabled: task.enabled.load(Ordering::Relaxed),
                    last_run,
                    next_run: *task.lock_next(),
                    healthy,
                }
            })
            .collect()
    }

    /// Toggle a named task on or off.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let Some(task) = self.find(name) else {
            bail!("no scheduled task named '{name}'");
        };
        task.enabled.store(enabled, Ordering::Relaxed);
        info!(task = %name, enabled, "scheduled task toggled");
        Ok(())
    }

    /// Run a named task immediately, outside its cadence.
    pub async fn trigger(&self, name: &str) -> Result<()> {
        let Some(task) = self.find(name) else {
            bail!("no scheduled task named '{name}'");
        };
        if task
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            bail!("task '{name}' is already running");
        }
        task.fire(Utc::now()).await;
        task.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Drive all tasks until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(tasks = self.tasks.len(), "scheduler starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }

            let now = Utc::now();
            for task in &self.tasks {
                if !task.enabled.load(Ordering::Relaxed) {
                    continue;
                }
                if *task.lock_next() > now {
                    continue;
                }
                // Each fire runs as its own task so a slow tick never
                // delays the other cadences; the guard keeps a task
                // from overlapping itself.
                if task
                    .running
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                let task = Arc::clone(task);
                tokio::spawn(async move {
                    task.fire(now).await;
                    task.running.store(false, Ordering::Release);
                });
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}

/// Wire the standard maintenance schedule over one store.
pub fn standard_schedule<S: JobStore + 'static>(
    worker: Arc<WorkerPool<S>>,
    sweeper: Arc<Sweeper<S>>,
    health: Arc<HealthCheck<S>>,
    monitor: Arc<Monitor<S>>,
    cleanup: Arc<Cleanup<S>>,
    cadences: &ScheduleCadences,
) -> Scheduler {
    let mut scheduler = Scheduler::new();
    scheduler
        .register("drain-pending", cadences.drain_every, worker)
        .register("sweep-stale", cadences.sweep_every, sweeper)
        .register("health-check", cadences.health_every, health)
        .register("collect-metrics", cadences.metrics_every, monitor)
        .register("cleanup-history", cadences.cleanup_every, cleanup);
    scheduler
}
