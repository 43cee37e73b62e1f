use anyhow::{Context, Result};
use brreg_sync::{JobRunner, PgStore, RegistrySyncConfig, Store};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;

pub mod import;
pub mod job;
pub mod repair;
pub mod schema;
pub mod serve;
pub mod stats;
pub mod status;
pub mod update;

#[derive(Parser)]
#[command(name = "brreg-sync")]
#[command(about = "Keeps a local copy of the Brønnøysund registers in sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the scheduler until interrupted")]
    Serve(serve::ServeArgs),

    #[command(about = "Apply changes from the registry update streams")]
    Update(update::UpdateArgs),

    #[command(about = "Detect and fix drift between the local copy and the registry")]
    Repair(repair::RepairArgs),

    #[command(subcommand, about = "Manage the bulk import queue")]
    Import(import::ImportCommand),

    #[command(about = "Run one background job immediately")]
    Job(job::JobArgs),

    #[command(about = "Print industry and county aggregates")]
    Stats(stats::StatsArgs),

    #[command(about = "Show cursors, sync error ledger and import queue state")]
    Status(status::StatusArgs),

    #[command(name = "init-schema", about = "Create tables, indexes and materialized views")]
    InitSchema
}

pub(crate) fn load_config() -> Result<RegistrySyncConfig> {
    RegistrySyncConfig::from_env().context("Failed to load configuration from environment")
}

pub(crate) async fn connect(config: &RegistrySyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL (is DATABASE_URL set?)")
}

pub(crate) async fn runner() -> Result<JobRunner> {
    let config = load_config()?;
    let store: Arc<dyn Store> = Arc::new(connect(&config).await?);
    JobRunner::from_config(config, store).context("Failed to build registry clients")
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
