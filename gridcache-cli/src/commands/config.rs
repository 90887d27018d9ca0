//! Configuration inspection commands.
//!
//! `config path` prints where the configuration file lives; `config list`
//! prints the effective configuration, defaults included.

use std::path::Path;

use clap::Subcommand;
use gridcache::config::ConfigFile;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// List the effective configuration
    List,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => {
            println!("{}", path.display());
            if !path.exists() {
                eprintln!("(file does not exist, defaults are in effect)");
            }
            Ok(())
        }
        ConfigCommands::List => {
            let config = ConfigFile::load_from(path)?;
            print!("{}", config.to_config_string());
            Ok(())
        }
    }
}
