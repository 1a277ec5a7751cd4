//! Bounded-concurrency executor shared by bulk loads and ad hoc fetches.
//!
//! Waiters are served in arrival order, so callers get priority purely by
//! submitting in the order they want work to start.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};

/// Fixed-ceiling limiter. Clones share the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// A limiter with `limit` slots (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.limit - self.available_permits()
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Run `fut` inside a slot.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    /// Wait for a slot, then spawn `fut` holding it. Returning only after
    /// the slot is taken keeps start order equal to call order.
    pub async fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.acquire().await?;
        Ok(tokio::spawn(async move {
            let out = fut.await;
            drop(permit);
            out
        }))
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(crate::config::BootstrapConfig::default().concurrency_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_ceiling() {
        let limiter = ConcurrencyLimiter::new(50);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                limiter
                    .run(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 50);
        assert_eq!(limiter.available_permits(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_starts_in_submission_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            handles.push(
                limiter
                    .spawn(async move {
                        order.lock().unwrap().push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
        assert_eq!(ConcurrencyLimiter::default().limit(), 50);
    }
}
