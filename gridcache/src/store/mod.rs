//! Coordination stores.
//!
//! A [`CoordinationStore`] is a small key-value store with expiring entries
//! and an atomic set-if-absent. It is the only primitive the engine uses for
//! cross-process mutual exclusion, so implementations must be safe when
//! several processes share them:
//!
//! - [`FileStore`] keeps one file per key in a directory. It backs the
//!   lifecycle markers of the cache tree and works across processes that
//!   share the cache volume.
//! - [`MemoryStore`] is process-local; suitable for a single server and for
//!   tests.
//! - `RedisStore` (feature `redis-store`) talks to a shared Redis server.
//!
//! Values are opaque strings; callers encode what they need.

mod file;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::time::Duration;

use thiserror::Error;

use crate::BoxFuture;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

/// Errors from a coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt entry for key '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Failed to run blocking task: {0}")]
    Join(String),
}

/// Shared key-value store with expiring entries.
///
/// # Atomicity
///
/// `set_if_absent` must be atomic across every client of the store: of any
/// number of concurrent callers for the same absent (or expired) key,
/// exactly one observes `true`.
pub trait CoordinationStore: Send + Sync {
    /// Returns the live value for `key`, or `None` when absent or expired.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    /// Stores `value` under `key`, replacing any previous entry.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Stores `value` only if no live entry exists.
    ///
    /// # Returns
    ///
    /// `true` when this call created the entry.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Removes `key`.
    ///
    /// # Returns
    ///
    /// `true` when an entry existed.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Returns true when a live entry exists for `key`.
    fn contains(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.get(&key).await?.is_some()) })
    }
}
