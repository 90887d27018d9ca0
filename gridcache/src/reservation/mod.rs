//! Cross-process reservations.
//!
//! A [`Reservation`] is a named, expiring claim on a unit of expensive work,
//! held in a [`CoordinationStore`]. The same type guards both the global
//! grid-population lock (over a [`FileStore`](crate::store::FileStore) at the
//! cache root) and per-fingerprint count locks (over the shared
//! coordination store).
//!
//! # Protocol
//!
//! ```text
//!            acquire()
//!   caller ───────────► Acquired(guard) ──► do work ──► guard.release()
//!      │
//!      ├──────────────► Held ──► wait(timeout, poll) ──► Released | TimedOut
//!      │                                                     │
//!      │                               re-check outcome, or run the work
//!      │                               directly once the wait times out
//!      │
//!      └──────────────► Unavailable(err)   store failure: not reserved
//! ```
//!
//! The claim always carries an expiry, so a holder that crashes only blocks
//! others until the TTL elapses. Release only removes the claim while it
//! still carries the holder's token.

mod count;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::store::{CoordinationStore, StoreError};

pub use count::{CountCoordinator, ReservationConfig};

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Result of trying to take a reservation.
#[derive(Debug)]
pub enum Acquire {
    /// The caller owns the work.
    Acquired(ReservationGuard),
    /// Someone else holds a live claim.
    Held,
    /// The store failed; the work is not reserved.
    Unavailable(StoreError),
}

/// Result of waiting for another holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The claim disappeared (released or expired).
    Released,
    /// The claim was still present when the wait ceiling elapsed.
    TimedOut,
}

/// A named, expiring claim in a coordination store.
#[derive(Clone)]
pub struct Reservation {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Reservation {
    /// # Arguments
    ///
    /// * `store` - Store holding the claim
    /// * `key` - Name of the claim
    /// * `ttl` - Expiry of the claim; required so crashed holders self-heal
    pub fn new(store: Arc<dyn CoordinationStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to take the claim.
    pub async fn acquire(&self) -> Acquire {
        let token = new_token();
        match self.store.set_if_absent(&self.key, &token, self.ttl).await {
            Ok(true) => {
                debug!(key = %self.key, ttl_secs = self.ttl.as_secs(), "reservation acquired");
                Acquire::Acquired(ReservationGuard {
                    store: Arc::clone(&self.store),
                    key: self.key.clone(),
                    ttl: self.ttl,
                    token,
                    released: false,
                })
            }
            Ok(false) => {
                trace!(key = %self.key, "reservation held elsewhere");
                Acquire::Held
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "reservation store unavailable");
                Acquire::Unavailable(e)
            }
        }
    }

    /// True when a live claim exists. Store errors read as "not held".
    pub async fn is_held(&self) -> bool {
        match self.store.contains(&self.key).await {
            Ok(held) => held,
            Err(e) => {
                warn!(key = %self.key, error = %e, "reservation check failed, treating as free");
                false
            }
        }
    }

    /// Polls until the claim is gone or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration, poll_interval: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_held().await {
                return WaitOutcome::Released;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key = %self.key, "reservation wait timed out");
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Ownership of an acquired reservation.
///
/// Release explicitly with [`release`](Self::release). A guard dropped
/// without release schedules the release on the current runtime.
pub struct ReservationGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
    token: String,
    released: bool,
}

impl std::fmt::Debug for ReservationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl ReservationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extends the claim by another TTL.
    ///
    /// # Returns
    ///
    /// `false` when the claim was lost (expired and taken by someone else).
    pub async fn renew(&mut self) -> Result<bool, StoreError> {
        match self.store.get(&self.key).await? {
            Some(ref current) if *current == self.token => {
                self.store.set(&self.key, &self.token, self.ttl).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            // Expired but unclaimed: take it back.
            None => self.store.set_if_absent(&self.key, &self.token, self.ttl).await,
        }
    }

    /// Removes the claim if it is still ours.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        release_claim(&*self.store, &self.key, &self.token).await
    }
}

async fn release_claim(store: &dyn CoordinationStore, key: &str, token: &str) -> Result<bool, StoreError> {
    match store.get(key).await? {
        Some(ref current) if current == token => {
            let removed = store.delete(key).await?;
            debug!(key = %key, "reservation released");
            Ok(removed)
        }
        _ => Ok(false),
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_claim(&*store, &key, &token).await {
                        warn!(key = %key, error = %e, "deferred reservation release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "reservation dropped outside a runtime; it will expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn reservation(store: &Arc<MemoryStore>, ttl: Duration) -> Reservation {
        Reservation::new(Arc::clone(store) as Arc<dyn CoordinationStore>, "work", ttl)
    }

    #[tokio::test]
    async fn test_acquire_then_held() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::from_secs(60));
        let guard = match r.acquire().await {
            Acquire::Acquired(g) => g,
            other => panic!("expected acquired, got {:?}", other),
        };
        assert!(matches!(r.acquire().await, Acquire::Held));
        assert!(r.is_held().await);
        assert!(guard.release().await.unwrap());
        assert!(!r.is_held().await);
    }

    #[tokio::test]
    async fn test_release_does_not_remove_foreign_claim() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::ZERO);
        let guard = match r.acquire().await {
            Acquire::Acquired(g) => g,
            other => panic!("expected acquired, got {:?}", other),
        };
        // Expired immediately; another caller takes it over.
        let long = reservation(&store, Duration::from_secs(60));
        let other = match long.acquire().await {
            Acquire::Acquired(g) => g,
            o => panic!("expected acquired, got {:?}", o),
        };
        assert!(!guard.release().await.unwrap());
        assert!(long.is_held().await);
        other.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::from_secs(60));
        let mut guard = match r.acquire().await {
            Acquire::Acquired(g) => g,
            other => panic!("expected acquired, got {:?}", other),
        };
        assert!(guard.renew().await.unwrap());
        store.set("work", "someone-else", Duration::from_secs(60)).await.unwrap();
        assert!(!guard.renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::from_secs(60));
        match r.acquire().await {
            Acquire::Acquired(g) => drop(g),
            other => panic!("expected acquired, got {:?}", other),
        }
        let outcome = r.wait(Duration::from_secs(1), Duration::from_millis(5)).await;
        assert_eq!(outcome, WaitOutcome::Released);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_held() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::from_secs(60));
        let _guard = match r.acquire().await {
            Acquire::Acquired(g) => g,
            other => panic!("expected acquired, got {:?}", other),
        };
        let outcome = r.wait(Duration::from_millis(30), Duration::from_millis(5)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wait_observes_release() {
        let store = Arc::new(MemoryStore::new());
        let r = reservation(&store, Duration::from_secs(60));
        let guard = match r.acquire().await {
            Acquire::Acquired(g) => g,
            other => panic!("expected acquired, got {:?}", other),
        };
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            guard.release().await.unwrap();
        });
        let outcome = r.wait(Duration::from_secs(5), Duration::from_millis(5)).await;
        assert_eq!(outcome, WaitOutcome::Released);
        releaser.await.unwrap();
    }
}
