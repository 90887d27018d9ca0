//! Runs one cache population in the foreground.

use gridcache::config::ConfigFile;
use tracing::info;

use super::common::{build_service, require_cache, TileArgs};
use crate::error::CliError;

pub async fn run(args: &TileArgs, config: &ConfigFile) -> Result<(), CliError> {
    let request = args.to_request()?;
    require_cache(config)?;
    let service = build_service(config).await?;

    let eligibility = service.eligibility(&request);
    if !eligibility.is_eligible() {
        return Err(CliError::Config(format!("request is not cacheable: {}", eligibility)));
    }

    info!(zoom = request.zoom(), "Starting population");
    match service.populate(&request).await {
        Some(outcome) => {
            println!("{}", outcome);
            Ok(())
        }
        None => Err(CliError::Config("cache.directory is not set".to_string())),
    }
}
