//! Durable job queue with lease recovery.
//!
//! The queue is a durable table of jobs moving through a
//! claim → process → complete/fail lifecycle, drained by a
//! concurrency-bounded worker pool, with a background sweeper that
//! recovers jobs abandoned mid-flight (worker crash, hang, timeout)
//! without double-processing and without losing work.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (cadence driver)
//!     │
//!     ├─► WorkerPool.drain_once()
//!     │       ├─► JobStore.claim_next_job()   ── atomic claim
//!     │       ├─► JobHandler.handle(job)      ── external collaborator
//!     │       └─► complete_job / fail_job     ── guarded transitions
//!     │
//!     ├─► Sweeper.sweep()
//!     │       ├─► find_stale_jobs()           ── lease expired
//!     │       └─► reset_job()                 ── guarded processing -> pending
//!     │
//!     └─► Monitor.check() / HealthCheck      ── read-only, tiered alerts
//! ```
//!
//! # Guarantees
//!
//! - **Single claim wins**: every state transition is one atomic
//!   conditional mutation against the store; no job is ever held by
//!   two workers at once.
//! - **At-least-once**: a worker crash costs at most one lease window
//!   before the sweeper returns the job to `pending`. Handlers must
//!   be idempotent.
//! - **Sweep safety**: a completion racing a sweeper reset is decided
//!   by the store's status guard; whichever lands first stands.
//!
//! The store is the single source of truth: no in-memory queue is
//! authoritative, so a process restart loses nothing beyond the lease
//! window.

pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod ops;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use config::{Config, QueueConfig, ScheduleCadences};
pub use error::{StoreError, StoreResult};
pub use job::{ErrorDetails, Job, JobRun, JobStatus, RunActor, RunStatus, StaleReason};
pub use monitor::{Alert, AlertKind, AlertSeverity, HealthCheck, Monitor, MonitorConfig, QueueMetrics};
pub use ops::{OpsMode, OpsParams, OpsReport};
pub use scheduler::{standard_schedule, Scheduler, TaskInfo, TickAction};
pub use store::{JobStore, MemoryJobStore, PostgresJobStore};
pub use sweeper::{
    Cleanup, ResetOutcome, RetentionConfig, SweepStatistics, SweepSummary, Sweeper, SweeperConfig,
};
pub use worker::{DrainSummary, JobHandler, WorkerConfig, WorkerPool};
