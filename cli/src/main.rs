use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Update(args) => commands::update::run(args).await,
        Commands::Repair(args) => commands::repair::run(args).await,
        Commands::Import(cmd) => commands::import::run(cmd).await,
        Commands::Job(args) => commands::job::run(args).await,
        Commands::Stats(args) => commands::stats::run(args).await,
        Commands::Status(args) => commands::status::run(args).await,
        Commands::InitSchema => commands::schema::run().await,
    }
}
