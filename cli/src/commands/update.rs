use super::{print_json, runner};
use crate::output;
use anyhow::{Result, bail};
use brreg_sync::{CycleReport, StreamFailure, UpdateReport, UpdateSince, UpdateStream};
use clap::{Args, ValueEnum};

#[derive(Clone, Copy, ValueEnum)]
pub enum StreamArg {
    Companies,
    Subunits,
    Roles,
    All
}

impl StreamArg {
    fn streams(self) -> Vec<UpdateStream> {
        match self {
            Self::Companies => vec![UpdateStream::Companies],
            Self::Subunits => vec![UpdateStream::Subunits],
            Self::Roles => vec![UpdateStream::Roles],
            Self::All => vec![UpdateStream::Companies, UpdateStream::Subunits, UpdateStream::Roles]
        }
    }
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Which update stream to consume
    #[arg(long, value_enum, default_value = "all")]
    pub stream: StreamArg,

    /// Replay every change on or after this date (YYYY-MM-DD)
    #[arg(long, conflicts_with = "after")]
    pub since: Option<String>,

    /// Resume after this update id instead of the stored cursor
    #[arg(long)]
    pub after: Option<i64>,

    /// Print the reports as JSON
    #[arg(long)]
    pub json: bool
}

pub async fn run(args: UpdateArgs) -> Result<()> {
    let since = match (&args.since, args.after) {
        (Some(date), _) => Some(UpdateSince::parse_date(date)?),
        (None, Some(id)) if id < 0 => bail!("--after must not be negative"),
        (None, Some(id)) => Some(UpdateSince::After(id)),
        (None, None) => None
    };

    let runner = runner().await?;
    let service = runner.update();

    let mut cycle = CycleReport::default();
    for stream in args.stream.streams() {
        let result = match stream {
            UpdateStream::Companies => service.fetch_company_updates(since).await,
            UpdateStream::Subunits => service.fetch_subunit_updates(since).await,
            UpdateStream::Roles => service.fetch_role_updates(since).await
        };
        match result {
            Ok(report) => cycle.reports.push(report),
            Err(e) => cycle.failures.push(StreamFailure {
                stream,
                error: e.to_string()
            })
        }
    }

    if args.json {
        print_json(&cycle)?;
    } else {
        render(&cycle);
    }

    if cycle.has_failures() {
        bail!("{} update stream(s) failed", cycle.failures.len());
    }
    Ok(())
}

fn render(cycle: &CycleReport) {
    output::header("Update streams");
    for report in &cycle.reports {
        render_report(report);
    }
    for failure in &cycle.failures {
        output::error(&format!("{}: {}", failure.stream.as_str(), failure.error));
    }
}

fn render_report(report: &UpdateReport) {
    output::subheader(report.stream.as_str());
    output::field("pages", report.pages);
    output::field("updated", report.entities_updated);
    output::field("gone", report.gone_skipped);
    output::field("failed", report.failed);
    match report.latest_oppdateringsid {
        Some(id) => output::field("cursor", id),
        None => output::field("cursor", "(none)")
    }
    if report.failed > 0 {
        output::hint("failed entities are in the sync error ledger, see `brreg-sync status`");
    }
}
