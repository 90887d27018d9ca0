//! Partitioned on-disk grid cache.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   processing.lock                  global population lock
//!   <pp>/                            partition: last two hex chars of the fingerprint
//!     <fingerprint>/                 query directory
//!       <zoom>/                      precision directory
//!         saved.done                 population completed
//!         oversized.done             result set too large to cache
//!         <x>.<y>.data               cell file, one JSON record per line
//! ```
//!
//! Markers are [`FileStore`] entries and expire on their own. A precision
//! directory is only authoritative while `saved.done` is live; it is wiped
//! and rebuilt by the next population run once that marker expires.

mod cells;
mod fanout;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::FeatureRecord;
use crate::fingerprint::Fingerprint;
use crate::reservation::Reservation;
use crate::store::{CoordinationStore, FileStore, StoreError};

pub use cells::{cell_file_name, cell_path};
pub use fanout::{cells_for_point, DEFAULT_EDGE_MARGIN};

/// Marker: population completed.
pub const SAVED_MARKER: &str = "saved.done";
/// Marker: result set exceeds caching thresholds.
pub const OVERSIZED_MARKER: &str = "oversized.done";
/// Global lock at the cache root.
pub const PROCESSING_LOCK: &str = "processing.lock";

/// Default lifetime of cached data and markers.
pub const DEFAULT_DATA_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default lifetime of the global population lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(180);

/// Errors from the cache tree.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record in {path} line {line}: {reason}")]
    MalformedCell {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("marker store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache task failed: {0}")]
    Join(String),
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
}

/// Cache tree settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Cache root; `None` disables grid caching.
    pub directory: Option<PathBuf>,
    /// Lifetime of `saved.done` and `oversized.done`.
    pub data_ttl: Duration,
    /// Lifetime of `processing.lock`.
    pub lock_ttl: Duration,
    /// Fan-out margin as a fraction of cell size.
    pub edge_margin: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            data_ttl: DEFAULT_DATA_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }
}

impl CacheConfig {
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    pub fn with_data_ttl(mut self, ttl: Duration) -> Self {
        self.data_ttl = ttl;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// The three directories behind one fingerprint and zoom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub partition_dir: PathBuf,
    pub query_dir: PathBuf,
    pub precision_dir: PathBuf,
}

/// Root of the partitioned cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    data_ttl: Duration,
    lock_ttl: Duration,
    edge_margin: f64,
    root_markers: Arc<FileStore>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, data_ttl: Duration, lock_ttl: Duration) -> Self {
        let root = root.into();
        Self {
            root_markers: Arc::new(FileStore::new(root.clone())),
            root,
            data_ttl,
            lock_ttl,
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }

    /// Builds the store from configuration; `None` when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config.directory.as_ref().map(|dir| {
            let mut store = Self::new(dir.clone(), config.data_ttl, config.lock_ttl);
            store.edge_margin = config.edge_margin;
            store
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_ttl(&self) -> Duration {
        self.data_ttl
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    pub fn edge_margin(&self) -> f64 {
        self.edge_margin
    }

    /// Derives the directories for a fingerprint and zoom without touching disk.
    pub fn paths(&self, fingerprint: &Fingerprint, zoom: u8) -> CachePaths {
        let partition_dir = self.root.join(fingerprint.partition());
        let query_dir = partition_dir.join(fingerprint.as_str());
        let precision_dir = query_dir.join(zoom.to_string());
        CachePaths {
            partition_dir,
            query_dir,
            precision_dir,
        }
    }

    /// Handle on a precision directory, which is created if missing.
    pub async fn precision(&self, fingerprint: &Fingerprint, zoom: u8) -> Result<PrecisionCache, CacheError> {
        let cache = self.precision_handle(fingerprint, zoom);
        let dir = cache.dir.clone();
        blocking(move || std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))).await?;
        Ok(cache)
    }

    /// Handle on a precision directory without creating it.
    pub fn precision_handle(&self, fingerprint: &Fingerprint, zoom: u8) -> PrecisionCache {
        let dir = self.paths(fingerprint, zoom).precision_dir;
        PrecisionCache {
            markers: FileStore::new(dir.clone()),
            dir,
            zoom,
            data_ttl: self.data_ttl,
        }
    }

    /// The global population lock.
    pub fn global_lock(&self) -> Reservation {
        Reservation::new(
            Arc::clone(&self.root_markers) as Arc<dyn CoordinationStore>,
            PROCESSING_LOCK,
            self.lock_ttl,
        )
    }

    /// True while some process holds the global population lock.
    pub async fn is_locked(&self) -> bool {
        self.global_lock().is_held().await
    }
}

/// Lifecycle state of one precision directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatus {
    pub populated: bool,
    pub oversized: bool,
}

/// One fingerprint's cache at one zoom level.
#[derive(Debug, Clone)]
pub struct PrecisionCache {
    dir: PathBuf,
    zoom: u8,
    data_ttl: Duration,
    markers: FileStore,
}

impl PrecisionCache {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    async fn marker_live(&self, marker: &str) -> bool {
        match self.markers.contains(marker).await {
            Ok(live) => live,
            Err(e) => {
                warn!(dir = %self.dir.display(), marker, error = %e, "unreadable marker");
                false
            }
        }
    }

    /// True while `saved.done` is live.
    pub async fn is_populated(&self) -> bool {
        self.marker_live(SAVED_MARKER).await
    }

    /// True while `oversized.done` is live.
    pub async fn is_known_oversized(&self) -> bool {
        self.marker_live(OVERSIZED_MARKER).await
    }

    pub async fn status(&self) -> CacheStatus {
        CacheStatus {
            populated: self.is_populated().await,
            oversized: self.is_known_oversized().await,
        }
    }

    pub async fn mark_populated(&self) -> Result<(), CacheError> {
        self.markers.set(SAVED_MARKER, "true", self.data_ttl).await?;
        debug!(dir = %self.dir.display(), "marked populated");
        Ok(())
    }

    pub async fn mark_oversized(&self) -> Result<(), CacheError> {
        self.markers.set(OVERSIZED_MARKER, "true", self.data_ttl).await?;
        debug!(dir = %self.dir.display(), "marked oversized");
        Ok(())
    }

    /// Removes every cell and marker, leaving an empty directory.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let dir = self.dir.clone();
        blocking(move || {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&dir, e)),
            }
            std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))
        })
        .await
    }

    pub fn cell_path(&self, x: u32, y: u32) -> PathBuf {
        cells::cell_path(&self.dir, x, y)
    }

    /// Records cached for a cell. A cell without a file is empty.
    ///
    /// Only meaningful while [`is_populated`](Self::is_populated) holds.
    pub async fn read_cell(&self, x: u32, y: u32) -> Result<Vec<FeatureRecord>, CacheError> {
        let path = self.cell_path(x, y);
        blocking(move || cells::read(&path)).await
    }

    /// Records for a cell if this directory is populated, `None` otherwise.
    pub async fn cached_cell(&self, x: u32, y: u32) -> Result<Option<Vec<FeatureRecord>>, CacheError> {
        if !self.is_populated().await {
            return Ok(None);
        }
        self.read_cell(x, y).await.map(Some)
    }

    /// Replaces a cell's records.
    pub async fn write_cell(&self, x: u32, y: u32, records: Vec<FeatureRecord>) -> Result<(), CacheError> {
        let path = self.cell_path(x, y);
        blocking(move || cells::write(&path, &records)).await
    }

    /// Appends records to a cell.
    pub async fn append_cell(&self, x: u32, y: u32, records: Vec<FeatureRecord>) -> Result<(), CacheError> {
        let path = self.cell_path(x, y);
        blocking(move || cells::append(&path, &records)).await
    }
}
