use super::{connect, load_config, print_json};
use crate::output;
use anyhow::Result;
use brreg_sync::models::{ImportStatusCount, SyncErrorCount};
use brreg_sync::{Store, SyncErrorLedger, UpdateStream};
use clap::Args;
use serde::Serialize;
use std::sync::Arc;

#[derive(Args)]
pub struct StatusArgs {
    /// Print the status as JSON
    #[arg(long)]
    pub json: bool
}

#[derive(Serialize)]
struct StreamStatus {
    stream: UpdateStream,
    latest_oppdateringsid: Option<String>,
    last_sync_date: Option<String>
}

#[derive(Serialize)]
struct Status {
    streams: Vec<StreamStatus>,
    open_sync_errors: i64,
    sync_errors: Vec<SyncErrorCount>,
    import_queue: Vec<ImportStatusCount>
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let config = load_config()?;
    let store: Arc<dyn Store> = Arc::new(connect(&config).await?);

    let mut streams = Vec::new();
    for stream in [UpdateStream::Companies, UpdateStream::Subunits, UpdateStream::Roles] {
        streams.push(StreamStatus {
            stream,
            latest_oppdateringsid: store.get_state(&stream.cursor_key()).await?,
            last_sync_date: store.get_state(&stream.sync_date_key()).await?
        });
    }

    let ledger = SyncErrorLedger::new(store.clone());
    let status = Status {
        streams,
        open_sync_errors: ledger.open_count().await?,
        sync_errors: ledger.summary().await?,
        import_queue: store.queue_summary().await?
    };

    if args.json {
        return print_json(&status);
    }
    render(&status);
    Ok(())
}

fn render(status: &Status) {
    output::header("Update streams");
    for stream in &status.streams {
        println!(
            "  {:<10} cursor {:<12} last sync {}",
            stream.stream.as_str(),
            stream.latest_oppdateringsid.as_deref().unwrap_or("-"),
            stream.last_sync_date.as_deref().unwrap_or("never")
        );
    }

    output::header("Sync error ledger");
    output::field("open", status.open_sync_errors);
    for count in &status.sync_errors {
        println!(
            "  {:<10} {:<18} {}",
            count.entity_type.to_string(),
            count.status.as_str(),
            count.count
        );
    }

    output::header("Import queue");
    for count in &status.import_queue {
        output::field(count.status.as_str(), count.count);
    }
    if status.import_queue.is_empty() {
        println!("  (empty)");
    }
}
