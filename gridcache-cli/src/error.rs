//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

use gridcache::backend::BackendError;
use gridcache::config::ConfigFileError;
use gridcache::request::ValidationError;
use gridcache::service::TileError;
use gridcache::store::StoreError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// Invalid tile arguments
    Request(ValidationError),
    /// Search backend could not be set up
    Backend(BackendError),
    /// Coordination store could not be set up
    Store(StoreError),
    /// Serving the tile failed
    Tile(TileError),
}

impl CliError {
    /// Prints the error and exits with status 1.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Tile(TileError::Backend(_)) | CliError::Backend(_) => {
                eprintln!();
                eprintln!("Check [elasticsearch] url and index in your config file:");
                eprintln!("  gridcache config path");
            }
            CliError::Config(_) => {
                eprintln!();
                eprintln!("Show the effective configuration with: gridcache config list");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Request(e) => write!(f, "Invalid tile request: {}", e),
            CliError::Backend(e) => write!(f, "Search backend error: {}", e),
            CliError::Store(e) => write!(f, "Coordination store error: {}", e),
            CliError::Tile(e) => write!(f, "Tile failed: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Request(e) => Some(e),
            CliError::Backend(e) => Some(e),
            CliError::Store(e) => Some(e),
            CliError::Tile(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<ValidationError> for CliError {
    fn from(e: ValidationError) -> Self {
        CliError::Request(e)
    }
}

impl From<BackendError> for CliError {
    fn from(e: BackendError) -> Self {
        CliError::Backend(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        CliError::Store(e)
    }
}

impl From<TileError> for CliError {
    fn from(e: TileError) -> Self {
        CliError::Tile(e)
    }
}
