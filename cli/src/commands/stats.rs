use super::{print_json, runner};
use crate::output;
use anyhow::Result;
use clap::Args;
use serde_json::json;

#[derive(Args)]
pub struct StatsArgs {
    /// Number of industries to list
    #[arg(long, default_value_t = 20)]
    pub top: usize,

    /// Print the aggregates as JSON
    #[arg(long)]
    pub json: bool
}

pub async fn run(args: StatsArgs) -> Result<()> {
    let runner = runner().await?;
    let analytics = runner.analytics();
    let industries = analytics.industry_stats(args.top).await?;
    let counties = analytics.county_stats().await?;

    if args.json {
        return print_json(&json!({ "industries": industries, "counties": counties }));
    }

    output::header("Industries");
    for stat in &industries {
        println!(
            "  {:<8} {:>8} companies {:>10} employees",
            stat.industry_code, stat.company_count, stat.employee_count
        );
    }

    output::header("Counties");
    for stat in &counties {
        let population = stat
            .population
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "  {:<4} {:>8} companies {:>10} employees {:>10} inhabitants",
            stat.county_number, stat.company_count, stat.employee_count, population
        );
    }
    if industries.is_empty() && counties.is_empty() {
        output::hint("aggregates come from materialized views; run `brreg-sync job view_refresh`");
    }
    Ok(())
}
