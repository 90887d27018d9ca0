//! Configuration file handling for `~/.gridcache/config.ini`.
//!
//! A missing file yields defaults. Every value converts into one of the
//! library's settings types (`CacheConfig`, `PipelineConfig`,
//! `ReservationConfig`, `ElasticsearchConfig`, `QueryConfig`); nothing is
//! read from globals after loading.
//!
//! ```ini
//! [elasticsearch]
//! url = http://localhost:9200
//! index = observations
//! geo_point_field = location
//!
//! [cache]
//! directory = ~/.gridcache/tiles
//! data_ttl = 86400
//!
//! [coordination]
//! backend = file
//! ```

mod parser;
mod settings;

use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

pub use settings::{
    CacheSettings, ConfigFile, CoordinationBackend, CoordinationSettings, ElasticsearchSettings, RenderSettings,
};

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to create config directory: {0}")]
    DirectoryError(std::io::Error),
}

impl ConfigFile {
    /// Loads from the default path.
    pub fn load() -> Result<Self, ConfigFileError> {
        Self::load_from(&config_file_path())
    }

    /// Loads from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        parser::parse_ini(&ini)
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigFileError::DirectoryError)?;
        }
        std::fs::write(path, self.to_config_string()).map_err(|e| ConfigFileError::WriteError(e.to_string()))
    }

    /// Renders the configuration as INI text.
    pub fn to_config_string(&self) -> String {
        let mut ini = Ini::new();
        ini.with_section(Some("elasticsearch"))
            .set("url", self.elasticsearch.url.as_str())
            .set("index", self.elasticsearch.index.as_str())
            .set("geo_point_field", self.elasticsearch.geo_point_field.as_str())
            .set("preference", self.elasticsearch.preference.as_str())
            .set("request_timeout", self.elasticsearch.request_timeout.to_string());

        let directory = self
            .cache
            .directory
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        ini.with_section(Some("cache"))
            .set("directory", directory)
            .set("data_ttl", self.cache.data_ttl.to_string())
            .set("lock_ttl", self.cache.lock_ttl.to_string())
            .set("count_timeout", self.cache.count_timeout.to_string())
            .set("fetch_timeout", self.cache.fetch_timeout.to_string())
            .set("lower_threshold", self.cache.lower_threshold.to_string())
            .set("high_threshold", self.cache.high_threshold.to_string())
            .set("write_concurrency", self.cache.write_concurrency.to_string());

        ini.with_section(Some("coordination"))
            .set("backend", self.coordination.backend.as_str())
            .set("redis_url", self.coordination.redis_url.clone().unwrap_or_default())
            .set("count_ttl", self.coordination.count_ttl.to_string())
            .set("wait_timeout", self.coordination.wait_timeout.to_string())
            .set("poll_interval_ms", self.coordination.poll_interval_ms.to_string());

        ini.with_section(Some("render"))
            .set("tile_size", self.render.tile_size.to_string());

        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = ini.write_to(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Directory for file-based coordination markers.
    pub fn coordination_directory(&self) -> PathBuf {
        match self.cache.directory {
            Some(ref dir) => dir.join("coordination"),
            None => config_directory().join("coordination"),
        }
    }
}

/// `~/.gridcache`
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gridcache")
}

/// `~/.gridcache/config.ini`
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
