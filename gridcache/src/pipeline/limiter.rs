//! Bounded write pool for cell files.
//!
//! A full-grid fan-out touches thousands of cell files. The limiter caps how
//! many appends are in flight at once so a population run cannot exhaust
//! file handles or the blocking thread pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent cell writes.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 5;

/// Semaphore-backed limiter with in-flight tracking.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    label: String,
}

impl ConcurrencyLimiter {
    /// # Arguments
    ///
    /// * `max_concurrent` - Maximum operations in flight; raised to 1 if zero
    /// * `label` - Name used in logs
    pub fn new(max_concurrent: usize, label: impl Into<String>) -> Self {
        let max_permits = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            label: label.into(),
        }
    }

    /// Waits for a permit. The permit is returned when dropped.
    ///
    /// The returned permit is `'static` so it can move into spawned tasks.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        Ok(ConcurrencyPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneous operations observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// Permit for one operation.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_is_raised_to_one() {
        let limiter = ConcurrencyLimiter::new(0, "cells");
        assert_eq!(limiter.max_concurrent(), 1);
        assert_eq!(limiter.label(), "cells");
    }

    #[tokio::test]
    async fn test_permit_tracking() {
        let limiter = ConcurrencyLimiter::new(2, "cells");
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);
        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        drop(b);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_never_exceeds_width() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3, "cells"));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let permit = limiter.acquire().await.unwrap();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(permit);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(limiter.peak_in_flight() <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }
}
