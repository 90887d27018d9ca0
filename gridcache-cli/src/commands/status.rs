//! Reports the cache state for a tile request.

use gridcache::config::ConfigFile;
use gridcache::fingerprint::Fingerprint;

use super::common::{require_cache, TileArgs};
use crate::error::CliError;

pub async fn run(args: &TileArgs, config: &ConfigFile) -> Result<(), CliError> {
    let request = args.to_request()?;
    let cache = require_cache(config)?;
    let fingerprint = Fingerprint::for_request(&request);
    let precision = cache.precision_handle(&fingerprint, request.zoom());
    let status = precision.status().await;
    let tile = request.tile();
    let cell = precision.cell_path(tile.x, tile.y);

    println!("Directory:    {}", precision.dir().display());
    println!("Populated:    {}", status.populated);
    println!("Oversized:    {}", status.oversized);
    println!("Grid locked:  {}", cache.is_locked().await);
    println!(
        "Cell file:    {} ({})",
        cell.display(),
        if cell.exists() { "present" } else { "absent" }
    );
    Ok(())
}
