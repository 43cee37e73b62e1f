use super::{print_json, runner};
use crate::output;
use anyhow::{Context, Result, bail};
use brreg_sync::OrgNumber;
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ImportCommand {
    #[command(about = "Add organization numbers to the import queue")]
    Populate(PopulateArgs),

    #[command(about = "Process pending queue entries in batches")]
    Run(RunArgs),

    #[command(about = "Import one organization number outside the queue")]
    One(OneArgs),

    #[command(name = "retry-failed", about = "Return failed entries to pending")]
    RetryFailed(RetryFailedArgs),

    #[command(about = "Requeue entries stuck in progress")]
    Reap(ReapArgs),

    #[command(about = "Show queue counts per status")]
    Summary(JsonArgs)
}

#[derive(Args)]
pub struct PopulateArgs {
    /// Organization numbers to enqueue
    pub orgnrs: Vec<String>,

    /// File with one organization number per line (`#` starts a comment)
    #[arg(long, short)]
    pub file: Option<PathBuf>,

    /// Higher priorities are claimed first
    #[arg(long, default_value_t = 0)]
    pub priority: i32
}

#[derive(Args)]
pub struct RunArgs {
    /// Stop after this many batches
    #[arg(long)]
    pub max_batches: Option<usize>,

    /// Print the totals as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct OneArgs {
    pub orgnr: String,

    #[arg(long)]
    pub json: bool
}

#[derive(Args)]
pub struct RetryFailedArgs {
    /// Only retry entries with fewer attempts than this
    #[arg(long)]
    pub max_attempts: Option<i32>,

    /// Only retry entries that failed at least this many hours ago
    #[arg(long)]
    pub older_than_hours: Option<i64>
}

#[derive(Args)]
pub struct ReapArgs {
    /// Override the configured in-progress timeout
    #[arg(long)]
    pub timeout_minutes: Option<i64>
}

#[derive(Args)]
pub struct JsonArgs {
    #[arg(long)]
    pub json: bool
}

pub async fn run(cmd: ImportCommand) -> Result<()> {
    match cmd {
        ImportCommand::Populate(args) => populate(args).await,
        ImportCommand::Run(args) => drain(args).await,
        ImportCommand::One(args) => one(args).await,
        ImportCommand::RetryFailed(args) => retry_failed(args).await,
        ImportCommand::Reap(args) => reap(args).await,
        ImportCommand::Summary(args) => summary(args).await,
    }
}

fn read_orgnr_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn populate(args: PopulateArgs) -> Result<()> {
    let mut ids = args.orgnrs;
    if let Some(path) = &args.file {
        ids.extend(read_orgnr_file(path)?);
    }
    if ids.is_empty() {
        bail!("No organization numbers given; pass them as arguments or with --file");
    }

    let runner = runner().await?;
    let report = runner
        .bulk_import()
        .populate_queue(&ids, args.priority)
        .await?;
    output::success(&format!(
        "{} added, {} already queued",
        report.added, report.skipped
    ));
    Ok(())
}

async fn drain(args: RunArgs) -> Result<()> {
    let runner = runner().await?;
    let total = runner.bulk_import().drain(args.max_batches).await?;
    if args.json {
        return print_json(&total);
    }

    output::header("Bulk import");
    output::field("claimed", total.claimed);
    output::field("completed", total.completed);
    output::field("skipped", total.skipped);
    output::field("failed", total.failed);
    output::field("financials", total.financials);
    if total.failed > 0 {
        output::hint("`brreg-sync import retry-failed` returns failed entries to the queue");
    }
    Ok(())
}

async fn one(args: OneArgs) -> Result<()> {
    let orgnr = OrgNumber::parse(&args.orgnr)?;
    let runner = runner().await?;
    let result = runner.bulk_import().process_single_company(&orgnr).await;
    if args.json {
        return print_json(&result);
    }

    match &result.error {
        Some(e) => output::error(&format!("{orgnr}: {e}")),
        None if result.gone => output::warn(&format!("{orgnr} is no longer in the registry")),
        None => output::success(&format!(
            "{orgnr}: company stored, {} financial statement(s)",
            result.financials_count
        ))
    }
    Ok(())
}

async fn retry_failed(args: RetryFailedArgs) -> Result<()> {
    let failed_before = args.older_than_hours.map(|h| Utc::now() - Duration::hours(h));
    let runner = runner().await?;
    let reset = runner
        .bulk_import()
        .retry_failed(args.max_attempts, failed_before)
        .await?;
    output::success(&format!("{reset} failed entries returned to pending"));
    Ok(())
}

async fn reap(args: ReapArgs) -> Result<()> {
    let runner = runner().await?;
    let requeued = runner
        .bulk_import()
        .reap_stale(args.timeout_minutes.map(Duration::minutes))
        .await?;
    output::success(&format!("{requeued} stale entries requeued"));
    Ok(())
}

async fn summary(args: JsonArgs) -> Result<()> {
    let runner = runner().await?;
    let counts = runner.bulk_import().summary().await?;
    if args.json {
        return print_json(&counts);
    }

    output::header("Import queue");
    if counts.is_empty() {
        output::info("Queue is empty");
    }
    for count in counts {
        output::field(count.status.as_str(), count.count);
    }
    Ok(())
}
