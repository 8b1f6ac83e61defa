//! Concurrency limits for worker poll loops
//!
//! Each poll loop owns one limiter. A slot is taken before polling so a
//! worker never leases more tasks than it can run.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of tasks a poll loop runs at once
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
}

/// One occupied slot; released on drop
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Create a limiter; at least one slot is always available
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Wait for a free slot
    ///
    /// Returns `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<SlotGuard> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| SlotGuard { _permit: permit })
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SlotGuard { _permit: permit })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.semaphore.available_permits()
    }

    /// Wake pending `acquire` calls with `None`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_slots_are_bounded() {
        let limiter = ConcurrencyLimiter::new(2);

        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.in_flight(), 2);

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_zero_is_raised_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.max_in_flight(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let limiter = ConcurrencyLimiter::new(1);
        let slot = limiter.acquire().await.unwrap();

        let waiter = limiter.clone();
        let handle = tokio::spawn(async move { waiter.acquire().await.is_some() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(slot);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let limiter = ConcurrencyLimiter::new(1);
        let _slot = limiter.acquire().await.unwrap();

        limiter.close();
        assert!(limiter.acquire().await.is_none());
    }
}
