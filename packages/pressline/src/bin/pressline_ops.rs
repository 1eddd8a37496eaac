//! Operational CLI over the queue maintenance surface.
//!
//! ```text
//! pressline-ops --mode sweep --dry-run
//! pressline-ops --mode sweep --max-jobs 20
//! pressline-ops --mode reset --id <uuid> --id <uuid> --reason "stuck deploy"
//! pressline-ops --mode monitor
//! ```
//!
//! Reads `DATABASE_URL` (and `PRESSLINE_*` overrides) from the
//! environment, runs one maintenance pass against the Postgres store,
//! and prints the structured report as JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pressline::ops::{run_mode, OpsMode, OpsParams};
use pressline::store::PostgresJobStore;
use pressline::Config;

#[derive(Parser, Debug)]
#[command(name = "pressline-ops", about = "Queue maintenance: sweep, stats, health, reset, monitor")]
struct Cli {
    /// Maintenance mode to run.
    #[arg(long, value_enum)]
    mode: OpsMode,

    /// Report intended actions without mutating any row.
    #[arg(long)]
    dry_run: bool,

    /// Cap on jobs handled this pass (sweep).
    #[arg(long)]
    max_jobs: Option<i64>,

    /// Job id to reset (repeatable; reset mode).
    #[arg(long = "id")]
    job_ids: Vec<Uuid>,

    /// Free-text reason recorded with a manual reset.
    #[arg(long)]
    reason: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let store = Arc::new(PostgresJobStore::new(pool));

    let params = OpsParams {
        dry_run: cli.dry_run,
        max_jobs: cli.max_jobs,
        job_ids: cli.job_ids,
        reason: cli.reason,
    };
    let report = run_mode(cli.mode, params, store, &config.queue).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
