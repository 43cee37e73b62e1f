use super::{print_json, runner};
use crate::output;
use anyhow::Result;
use brreg_sync::{RepairMode, RepairReport};
use clap::Args;

fn parse_mode(raw: &str) -> Result<RepairMode, String> {
    raw.parse().map_err(|e: brreg_sync::RegistrySyncError| e.to_string())
}

#[derive(Args)]
pub struct RepairArgs {
    /// ghosts, subunits, roles, errors or all
    #[arg(long, default_value = "all", value_parser = parse_mode)]
    pub mode: RepairMode,

    /// Upper bound on entities examined per sweep
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Write fixes; without this flag the sweep only reports
    #[arg(long)]
    pub repair: bool,

    /// Print every finding instead of the first few
    #[arg(long, short)]
    pub verbose: bool,

    /// Print the reports as JSON
    #[arg(long)]
    pub json: bool
}

const FINDINGS_PREVIEW: usize = 10;

pub async fn run(args: RepairArgs) -> Result<()> {
    let runner = runner().await?;
    let reports = runner.repair().run(args.mode, args.limit, args.repair).await?;

    if args.json {
        return print_json(&reports);
    }

    let title = if args.repair { "Repair" } else { "Repair (dry run)" };
    output::header(title);
    for report in &reports {
        render(report, args.verbose);
    }
    if !args.repair && reports.iter().any(|r| r.discrepancies > 0) {
        output::hint("rerun with --repair to apply the fixes");
    }
    Ok(())
}

fn render(report: &RepairReport, verbose: bool) {
    output::subheader(&report.sweep);
    output::field("scanned", report.scanned);
    output::field("discrepancies", report.discrepancies);
    output::field("repaired", report.repaired);
    output::field("gone", report.gone);
    output::field("failed", report.failed);
    if report.promoted > 0 {
        output::field("promoted", report.promoted);
    }

    let shown = if verbose { report.findings.len() } else { FINDINGS_PREVIEW };
    for finding in report.findings.iter().take(shown) {
        println!("    {}  {}", finding.orgnr, finding.detail);
    }
    if report.findings.len() > shown {
        println!("    ... {} more", report.findings.len() - shown);
    }
}
