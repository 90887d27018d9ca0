//! gridcache CLI - operator commands for the tile cache
//!
//! Inspects how requests map onto the cache, runs populations in the
//! foreground and serves single tiles through the same path the tile server
//! uses.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gridcache::config::{config_file_path, ConfigFile};
use gridcache::logging::{default_log_dir, default_log_file, init_logging};
use tracing::debug;

use commands::common::TileArgs;
use commands::config::ConfigCommands;
use error::CliError;

#[derive(Parser)]
#[command(name = "gridcache")]
#[command(version = gridcache::VERSION)]
#[command(about = "Tile cache and query deduplication for aggregation-backed maps", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.gridcache/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint, cache directory and eligibility of a request
    Fingerprint(TileArgs),

    /// Show the cache state for a request
    Status(TileArgs),

    /// Populate the cache for a request and wait for the outcome
    Populate(TileArgs),

    /// Serve a tile's records as JSON lines
    Tile(TileArgs),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.unwrap_or_else(config_file_path);

    // Config commands must work even when the file does not parse.
    let command = match cli.command {
        Commands::Config(command) => return commands::config::run(command, &config_path),
        other => other,
    };

    let config = ConfigFile::load_from(&config_path)?;
    let _logging = init_logging(&default_log_dir(), default_log_file())
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    debug!(path = %config_path.display(), "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Config(format!("failed to start runtime: {}", e)))?;

    runtime.block_on(async {
        match command {
            Commands::Fingerprint(args) => commands::fingerprint::run(&args, &config),
            Commands::Status(args) => commands::status::run(&args, &config).await,
            Commands::Populate(args) => commands::populate::run(&args, &config).await,
            Commands::Tile(args) => commands::tile::run(&args, &config).await,
            Commands::Config(_) => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_tile_command() {
        let cli = Cli::try_parse_from([
            "gridcache", "tile", "geohash", "4", "8", "5", "--format", "grid.json", "-p", "taxon_id=47",
        ])
        .unwrap();
        match cli.command {
            Commands::Tile(args) => {
                assert_eq!(args.format, "grid.json");
                assert_eq!(args.params, vec![("taxon_id".to_string(), "47".to_string())]);
            }
            _ => panic!("expected tile command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["gridcache", "config", "path", "--config", "/tmp/x.ini"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.ini")));
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
    }

    #[test]
    fn test_rejects_bad_param() {
        assert!(Cli::try_parse_from(["gridcache", "fingerprint", "geohash", "1", "0", "0", "-p", "oops"]).is_err());
    }
}
