use super::{connect, load_config};
use crate::output;
use anyhow::Result;

pub async fn run() -> Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;
    store.initialize_schema().await?;
    output::success("Schema is up to date");
    Ok(())
}
