//! Serves one tile's records and prints them as JSON lines.

use std::time::Duration;

use gridcache::config::ConfigFile;
use tracing::{info, warn};

use super::common::{build_service, TileArgs};
use crate::error::CliError;

/// How long to wait for a background population before exiting.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run(args: &TileArgs, config: &ConfigFile) -> Result<(), CliError> {
    let request = args.to_request()?;
    let service = build_service(config).await?;

    let tile = service.records_for(&request).await?;
    for record in &tile.records {
        let line = serde_json::to_string(record).map_err(|e| CliError::Config(e.to_string()))?;
        println!("{}", line);
    }
    info!(source = ?tile.source, records = tile.records.len(), "Tile served");

    if service.pending_populations() > 0 {
        info!("Waiting for background population");
    }
    if !service.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("Background population still running at exit");
    }
    Ok(())
}
