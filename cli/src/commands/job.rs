use super::{print_json, runner};
use crate::output;
use anyhow::{Result, bail};
use brreg_sync::JobKind;
use clap::Args;

fn parse_job(raw: &str) -> Result<JobKind, String> {
    raw.parse().map_err(|e: brreg_sync::RegistrySyncError| {
        let known: Vec<&str> = JobKind::ALL.iter().map(JobKind::as_str).collect();
        format!("{e} (expected one of: {})", known.join(", "))
    })
}

#[derive(Args)]
pub struct JobArgs {
    /// update_cycle, view_refresh, population_sync, geocode, ledger_retry or queue_reaper
    #[arg(value_parser = parse_job)]
    pub job: JobKind,

    /// Print the job report as JSON
    #[arg(long)]
    pub json: bool
}

pub async fn run(args: JobArgs) -> Result<()> {
    let runner = runner().await?;
    let report = runner.run(args.job).await;

    if args.json {
        print_json(&report)?;
    } else if report.success {
        output::success(&format!("{} finished", report.job));
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    }

    if !report.success {
        let reason = report.error.as_deref().unwrap_or("reported failures");
        if !args.json {
            output::error(&format!("{}: {reason}", report.job));
        }
        bail!("job {} failed", report.job);
    }
    Ok(())
}
