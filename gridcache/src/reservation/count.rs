//! Deduplicated total-hit counts.
//!
//! Counting the documents behind a fingerprint is cheap compared to a grid
//! fetch, but popular requests still arrive in bursts. The coordinator
//! keeps the last count in the coordination store and lets only one caller
//! per fingerprint run the count at a time; the others wait for its value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{Acquire, Reservation, WaitOutcome};
use crate::backend::BackendError;
use crate::fingerprint::Fingerprint;
use crate::store::CoordinationStore;
use crate::telemetry::CacheMetrics;

/// Default lifetime of a stored count.
pub const DEFAULT_COUNT_TTL: Duration = Duration::from_secs(300);
/// Default ceiling on waiting for another caller's count.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default poll interval while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timing for count reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationConfig {
    /// How long a computed count is reused.
    pub count_ttl: Duration,
    /// Expiry of the count lock; also the waiters' ceiling.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            count_ttl: DEFAULT_COUNT_TTL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ReservationConfig {
    pub fn with_count_ttl(mut self, ttl: Duration) -> Self {
        self.count_ttl = ttl;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Runs counts at most once per fingerprint across every process sharing
/// the store.
#[derive(Clone)]
pub struct CountCoordinator {
    store: Arc<dyn CoordinationStore>,
    config: ReservationConfig,
    metrics: Arc<CacheMetrics>,
}

impl CountCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ReservationConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self { store, config, metrics }
    }

    pub fn config(&self) -> &ReservationConfig {
        &self.config
    }

    fn lock_for(&self, fingerprint: &Fingerprint) -> Reservation {
        Reservation::new(
            Arc::clone(&self.store),
            format!("{}:lock", fingerprint.count_key()),
            self.config.wait_timeout,
        )
    }

    /// Reads a stored count. Store errors and unparsable values read as a miss.
    pub async fn cached(&self, fingerprint: &Fingerprint) -> Option<u64> {
        match self.store.get(&fingerprint.count_key()).await {
            Ok(Some(v)) => v.parse().ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "count cache read failed");
                None
            }
        }
    }

    /// Returns the count for `fingerprint`, running `run` only when no
    /// stored value exists and no other caller is already counting.
    ///
    /// # Arguments
    ///
    /// * `fingerprint` - Identifies the count
    /// * `run` - Issues the count query against the backend
    #[instrument(skip(self, fingerprint, run), fields(fingerprint = %fingerprint))]
    pub async fn count<F, Fut>(&self, fingerprint: &Fingerprint, run: F) -> Result<u64, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, BackendError>>,
    {
        if let Some(n) = self.cached(fingerprint).await {
            self.metrics.count_cache_hit();
            return Ok(n);
        }

        let lock = self.lock_for(fingerprint);
        match lock.acquire().await {
            Acquire::Acquired(guard) => {
                let result = self.run_and_store(fingerprint, run).await;
                if let Err(e) = guard.release().await {
                    warn!(error = %e, "count lock release failed");
                }
                result
            }
            Acquire::Held => {
                self.metrics.count_wait();
                let outcome = lock
                    .wait(self.config.wait_timeout, self.config.poll_interval)
                    .await;
                if let Some(n) = self.cached(fingerprint).await {
                    self.metrics.count_cache_hit();
                    return Ok(n);
                }
                debug!(?outcome, "no count after waiting, counting directly");
                if outcome == WaitOutcome::TimedOut {
                    warn!("count wait ceiling reached");
                }
                self.run_and_store(fingerprint, run).await
            }
            Acquire::Unavailable(_) => self.run_and_store(fingerprint, run).await,
        }
    }

    async fn run_and_store<F, Fut>(&self, fingerprint: &Fingerprint, run: F) -> Result<u64, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, BackendError>>,
    {
        self.metrics.count_query();
        let n = run().await?;
        if let Err(e) = self
            .store
            .set(&fingerprint.count_key(), &n.to_string(), self.config.count_ttl)
            .await
        {
            warn!(error = %e, "count cache write failed");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::QueryParams;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fingerprint() -> Fingerprint {
        let mut params = QueryParams::new();
        params.insert("taxon_id".to_string(), "1".to_string());
        Fingerprint::from_params(&params)
    }

    fn coordinator(store: Arc<MemoryStore>, config: ReservationConfig) -> CountCoordinator {
        CountCoordinator::new(store, config, Arc::new(CacheMetrics::new()))
    }

    #[tokio::test]
    async fn test_count_is_cached() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(Arc::clone(&store), ReservationConfig::default());
        let fp = fingerprint();

        assert_eq!(coord.count(&fp, || async { Ok(42) }).await.unwrap(), 42);
        // Second call is served from the store.
        let reran = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&reran);
        let n = coord
            .count(&fp, || async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .await
            .unwrap();
        assert_eq!(n, 42);
        assert_eq!(reran.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&fp.count_key()).await.unwrap(), Some("42".to_string()));
        assert!(store.get(&format!("{}:lock", fp.count_key())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_count_is_not_cached_and_releases_lock() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(Arc::clone(&store), ReservationConfig::default());
        let fp = fingerprint();

        let err = coord
            .count(&fp, || async { Err(BackendError::Timeout) })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(coord.cached(&fp).await.is_none());
        assert!(store.get(&format!("{}:lock", fp.count_key())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiter_reuses_holders_count() {
        let store = Arc::new(MemoryStore::new());
        let config = ReservationConfig::default().with_poll_interval(Duration::from_millis(5));
        let coord = coordinator(Arc::clone(&store), config);
        let fp = fingerprint();
        let runs = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coord = coord.clone();
            let fp = fp.clone();
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                coord
                    .count(&fp, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let config = ReservationConfig::default()
            .with_wait_timeout(Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(5));
        let coord = coordinator(Arc::clone(&store), config);
        let fp = fingerprint();

        // A stuck holder elsewhere.
        store
            .set(&format!("{}:lock", fp.count_key()), "other", Duration::from_secs(60))
            .await
            .unwrap();
        let n = coord.count(&fp, || async { Ok(3) }).await.unwrap();
        assert_eq!(n, 3);
    }
}
