use super::{connect, load_config};
use crate::output;
use anyhow::{Context, Result};
use brreg_sync::{JobKind, JobRunner, Store, SyncScheduler};
use clap::Args;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct ServeArgs {
    /// Create the schema before starting
    #[arg(long)]
    pub init_schema: bool,

    /// Run one update cycle immediately instead of waiting for the first tick
    #[arg(long)]
    pub update_now: bool
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;
    if args.init_schema {
        store.initialize_schema().await?;
        output::info("Schema initialized");
    }

    let store: Arc<dyn Store> = Arc::new(store);
    let runner = JobRunner::from_config(config, store).context("Failed to build registry clients")?;
    let mut scheduler = SyncScheduler::new(runner).await?;

    if args.update_now {
        let report = scheduler.run_now(JobKind::UpdateCycle).await;
        if !report.success {
            output::warn("Initial update cycle reported failures, see logs");
        }
    }

    scheduler.start().await?;
    output::success("Scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    scheduler.stop().await?;
    for report in scheduler.last_reports().await {
        let status = if report.success { "ok" } else { "failed" };
        output::info(&format!(
            "{}: last run {} ({status})",
            report.job,
            report.finished_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    Ok(())
}
