//! File-backed coordination store.
//!
//! Each key is a file in the store directory holding a small JSON envelope:
//!
//! ```text
//! {"value":"true","expires_at":1718000000000}
//! ```
//!
//! Entries are always written to a private temporary file first and then
//! published atomically:
//!
//! - `set` renames the temporary file over the key (last writer wins);
//! - `set_if_absent` hard-links it to the key, which fails if the key
//!   exists, so exactly one of several racing processes succeeds.
//!
//! An expired entry is reclaimed by renaming it aside before retrying the
//! link; only one process can win that rename. The entry is compared with
//! the one judged expired both before and after the rename, so a claim
//! written in between is left in place or restored.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{CoordinationStore, StoreError};
use crate::BoxFuture;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    value: String,
    /// Unix epoch milliseconds.
    expires_at: i64,
}

impl Envelope {
    fn new(value: &str, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            value: value.to_string(),
            expires_at: Utc::now().timestamp_millis().saturating_add(ttl_ms),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at
    }
}

/// Coordination store over a directory of marker files.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(name)
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.dir
            .join(format!(".{}.{}.{}.{}.tmp", key.len(), std::process::id(), nanos, n))
    }

    async fn blocking<T, F>(f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn read_envelope(key: &str, path: &Path) -> Result<Option<Envelope>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_temp(dir: &Path, temp: &Path, envelope: &Envelope) -> Result<(), StoreError> {
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec(envelope).map_err(|e| StoreError::Corrupt {
        key: temp.display().to_string(),
        reason: e.to_string(),
    })?;
    fs::write(temp, bytes)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True when `found` is the same entry as `observed`.
///
/// `observed` is `None` for an entry that could not be parsed; a corrupt
/// entry only matches another corrupt one.
fn same_entry(found: &Result<Option<Envelope>, StoreError>, observed: Option<&Envelope>) -> bool {
    match (found, observed) {
        (Ok(Some(env)), Some(obs)) => env == obs,
        (Err(StoreError::Corrupt { .. }), None) => true,
        _ => false,
    }
}

/// Moves the entry `set_if_absent` judged stale out of the way.
///
/// Returns `true` when the key is now free. The entry at `path` is compared
/// with `observed` before renaming it aside; a different entry is left in
/// place. If a replacement slipped in between the check and the rename, it
/// is linked back and `false` is returned.
fn reclaim_expired(key: &str, path: &Path, aside: &Path, observed: Option<&Envelope>) -> Result<bool, StoreError> {
    let current = read_envelope(key, path);
    if matches!(current, Ok(None)) {
        return Ok(true);
    }
    if !same_entry(&current, observed) {
        return Ok(false);
    }

    match fs::rename(path, aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    let moved = read_envelope(key, aside);
    if same_entry(&moved, observed) {
        remove_if_exists(aside)?;
        return Ok(true);
    }

    if let Err(e) = fs::hard_link(aside, path) {
        warn!(key = %key, error = %e, "displaced entry could not be restored");
    }
    remove_if_exists(aside)?;
    Ok(false)
}

impl CoordinationStore for FileStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let key = key.to_string();
        let path = self.path_for(&key);
        Box::pin(async move {
            Self::blocking(move || {
                Ok(read_envelope(&key, &path)?
                    .filter(|env| !env.is_expired())
                    .map(|env| env.value))
            })
            .await
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        let path = self.path_for(key);
        let temp = self.temp_path(key);
        let dir = self.dir.clone();
        let envelope = Envelope::new(value, ttl);
        trace!(path = %path.display(), ttl_secs = ttl.as_secs(), "file store set");
        Box::pin(async move {
            Self::blocking(move || {
                write_temp(&dir, &temp, &envelope)?;
                if let Err(e) = fs::rename(&temp, &path) {
                    let _ = fs::remove_file(&temp);
                    return Err(e.into());
                }
                Ok(())
            })
            .await
        })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        let path = self.path_for(&key);
        let temp = self.temp_path(&key);
        let aside = self.temp_path(&key);
        let dir = self.dir.clone();
        let envelope = Envelope::new(value, ttl);
        Box::pin(async move {
            Self::blocking(move || {
                write_temp(&dir, &temp, &envelope)?;
                let result = (|| {
                    // Two attempts: the second follows reclaiming an expired entry.
                    for _ in 0..2 {
                        match fs::hard_link(&temp, &path) {
                            Ok(()) => return Ok(true),
                            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                            Err(e) => return Err(StoreError::from(e)),
                        }
                        let observed = match read_envelope(&key, &path) {
                            Ok(Some(env)) if !env.is_expired() => return Ok(false),
                            Ok(Some(env)) => Some(env),
                            // Removed in the meantime; retry the link.
                            Ok(None) => continue,
                            // A corrupt entry cannot be trusted as a live claim.
                            Err(StoreError::Corrupt { .. }) => None,
                            Err(e) => return Err(e),
                        };
                        debug!(key = %key, "reclaiming expired entry");
                        if !reclaim_expired(&key, &path, &aside, observed.as_ref())? {
                            return Ok(false);
                        }
                    }
                    Ok(false)
                })();
                let _ = fs::remove_file(&temp);
                result
            })
            .await
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let path = self.path_for(key);
        Box::pin(async move { Self::blocking(move || Ok(remove_if_exists(&path)?)).await })
    }
}
