//! Per-command concurrency isolation.
//!
//! A [`Bulkhead`] bounds how many attempts run at once for one command
//! name. Submissions past capacity either wait in a bounded queue (pool
//! isolation) or are rejected immediately (semaphore isolation, queue
//! capacity zero). Permits are RAII guards, so a panicking attempt can
//! never leak a slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Where an attempt runs relative to the submitting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Spawn the attempt onto the runtime; submissions may queue.
    Pool,
    /// Run the attempt on the submitting task; no queue, reject at capacity.
    Semaphore,
}

/// Typed rejection produced when the bulkhead is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejection {
    pub in_flight: usize,
    pub max: usize,
}

/// Concurrency bound with an optional bounded wait queue.
#[derive(Debug)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    core_size: usize,
    queue_limit: usize,
    queued: AtomicUsize,
}

/// RAII slot; dropping it releases the slot on every exit path.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the queued count even when the waiting future is dropped.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Bulkhead admitting `core_size` concurrent attempts with up to
    /// `queue_limit` submissions waiting behind them.
    pub fn new(core_size: usize, queue_limit: usize) -> Self {
        let core_size = core_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(core_size)),
            core_size,
            queue_limit,
            queued: AtomicUsize::new(0),
        }
    }

    /// Maximum concurrent attempts.
    pub fn core_size(&self) -> usize {
        self.core_size
    }

    /// Attempts currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.core_size.saturating_sub(self.permits.available_permits())
    }

    /// Submissions currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Acquire a slot, waiting in the queue when one is configured.
    ///
    /// Returns immediately with a rejection when capacity and queue are
    /// both exhausted. The wait itself is bounded by permit turnover, not
    /// by time; per-attempt budgets bound the holders.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit });
        }

        if self.queue_limit == 0 {
            return Err(self.rejection());
        }

        let position = self.queued.fetch_add(1, Ordering::AcqRel);
        let guard = QueuedGuard(&self.queued);
        if position >= self.queue_limit {
            drop(guard);
            return Err(self.rejection());
        }

        match self.permits.clone().acquire_owned().await {
            Ok(permit) => {
                drop(guard);
                Ok(BulkheadPermit { _permit: permit })
            }
            // The semaphore is never closed; treat it as saturation anyway.
            Err(_) => {
                drop(guard);
                Err(self.rejection())
            }
        }
    }

    fn rejection(&self) -> BulkheadRejection {
        BulkheadRejection { in_flight: self.in_flight(), max: self.core_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_core_size() {
        let bulkhead = Bulkhead::new(3, 0);
        let p1 = bulkhead.acquire().await.unwrap();
        let p2 = bulkhead.acquire().await.unwrap();
        let p3 = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 3);

        drop((p1, p2, p3));
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test]
    async fn rejects_at_capacity_without_queue() {
        let bulkhead = Bulkhead::new(1, 0);
        let held = bulkhead.acquire().await.unwrap();

        let rejection = bulkhead.acquire().await.unwrap_err();
        assert_eq!(rejection, BulkheadRejection { in_flight: 1, max: 1 });

        drop(held);
        assert!(bulkhead.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn queued_submission_proceeds_when_slot_frees() {
        let bulkhead = Arc::new(Bulkhead::new(1, 1));
        let held = bulkhead.acquire().await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.queued(), 1);

        drop(held);
        assert!(waiter.await.unwrap());
        assert_eq!(bulkhead.queued(), 0);
    }

    #[tokio::test]
    async fn queue_overflow_is_rejected() {
        let bulkhead = Arc::new(Bulkhead::new(1, 1));
        let _held = bulkhead.acquire().await.unwrap();

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                // Occupies the single queue slot until the test ends.
                let _ = bulkhead.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejection = bulkhead.acquire().await.unwrap_err();
        assert_eq!(rejection.max, 1);

        queued.abort();
    }

    #[tokio::test]
    async fn dropped_waiter_releases_queue_slot() {
        let bulkhead = Arc::new(Bulkhead::new(1, 1));
        let _held = bulkhead.acquire().await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let _ = bulkhead.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.queued(), 1);

        waiter.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.queued(), 0);
    }

    #[tokio::test]
    async fn capacity_bound_holds_under_parallel_wave() {
        let bulkhead = Arc::new(Bulkhead::new(5, 0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..20 {
            let bulkhead = bulkhead.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                match bulkhead.acquire().await {
                    Ok(_permit) => {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        true
                    }
                    Err(_) => false,
                }
            }));
        }

        let results = futures::future::join_all(handles).await;
        let admitted = results.iter().filter(|r| *r.as_ref().unwrap()).count();
        let rejected = results.len() - admitted;

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(admitted + rejected, 20);
        assert!(admitted >= 5);
    }

    #[tokio::test]
    async fn zero_core_size_is_coerced_to_one() {
        let bulkhead = Bulkhead::new(0, 0);
        assert_eq!(bulkhead.core_size(), 1);
        assert!(bulkhead.acquire().await.is_ok());
    }
}
