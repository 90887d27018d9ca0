//! Shows how a tile request maps onto the grid cache.

use gridcache::cache::CacheStore;
use gridcache::config::ConfigFile;
use gridcache::fingerprint::{eligibility, Fingerprint};

use super::common::TileArgs;
use crate::error::CliError;

pub fn run(args: &TileArgs, config: &ConfigFile) -> Result<(), CliError> {
    let request = args.to_request()?;
    let cache_config = config.cache_config();
    let cache = CacheStore::from_config(&cache_config);

    let fingerprint = Fingerprint::for_request(&request);
    println!("Fingerprint:  {}", fingerprint);
    println!("Partition:    {}", fingerprint.partition());
    println!("Precision:    {}", request.geohash_precision());
    match cache {
        Some(ref store) => {
            let paths = store.paths(&fingerprint, request.zoom());
            println!("Directory:    {}", paths.precision_dir.display());
        }
        None => println!("Directory:    (no cache directory configured)"),
    }
    println!(
        "Eligibility:  {}",
        eligibility(&request, cache.is_some(), cache_config.data_ttl)
    );
    Ok(())
}
