//! Bounded-parallelism task runner
//!
//! Tasks start immediately while fewer than `limit` are running and queue in
//! FIFO order otherwise. A queued task has not been polled yet, so
//! [`ConcurrencyLimiter::clear`] can drop it without side effects; tasks that
//! already started always run to completion.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::debug;

use crate::error::{EgressError, Result};

pub struct ConcurrencyLimiter {
    limit: usize,
    // tokio's semaphore hands out permits in request order.
    slots: Semaphore,
    active: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
    epoch: watch::Sender<u64>,
    queue_timeout: Option<Duration>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        let (epoch, _) = watch::channel(0);
        Self {
            limit,
            slots: Semaphore::new(limit),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            epoch,
            queue_timeout: None,
        }
    }

    /// Queued tasks fail with [`EgressError::QueueTimeout`] when no slot
    /// frees up within `timeout`
    pub fn with_queue_timeout(limit: usize, timeout: Duration) -> Self {
        Self {
            queue_timeout: Some(timeout),
            ..Self::new(limit)
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running tasks seen so far
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Run `task` once a slot is free
    pub async fn run<F>(&self, task: F) -> Result<F::Output>
    where
        F: Future,
    {
        let mut cleared = self.epoch.subscribe();
        cleared.borrow_and_update();

        let queued_at = Instant::now();
        self.queued.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::select! {
            biased;
            _ = cleared.changed() => Err(EgressError::Cancelled),
            permit = self.acquire(queued_at) => permit,
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let _permit = acquired?;
        let _slot = ActiveSlot::enter(self);
        Ok(task.await)
    }

    async fn acquire(&self, queued_at: Instant) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let acquire = self.slots.acquire();
        let permit = match self.queue_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                EgressError::QueueTimeout {
                    waited_ms: queued_at.elapsed().as_millis() as u64,
                }
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| EgressError::Cancelled)
    }

    /// Drop every queued task. Running tasks are unaffected. Returns how many
    /// tasks were waiting.
    pub fn clear(&self) -> usize {
        let dropped = self.queued();
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        if dropped > 0 {
            debug!(dropped, "Cleared queued tasks");
        }
        dropped
    }
}

struct ActiveSlot<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl<'a> ActiveSlot<'a> {
    fn enter(limiter: &'a ConcurrencyLimiter) -> Self {
        let now = limiter.active.fetch_add(1, Ordering::SeqCst) + 1;
        limiter.peak.fetch_max(now, Ordering::SeqCst);
        Self { limiter }
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let limiter = ConcurrencyLimiter::new(3);
        let (running, observed) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (running, observed) = (&running, &observed);

        let tasks = (0..10).map(|i| {
            limiter.run(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i
            })
        });
        let results = futures::future::join_all(tasks).await;

        assert_eq!(results.into_iter().map(|r| r.unwrap()).sum::<i32>(), 45);
        assert_eq!(observed.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.peak(), 3);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_queued_tasks_start_in_fifo_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let started = parking_lot::Mutex::new(Vec::new());

        let tasks = (0..5).map(|i| {
            let started = &started;
            limiter.run(async move {
                started.lock().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
        });
        futures::future::join_all(tasks).await;

        assert_eq!(*started.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_clear_drops_queued_but_not_running() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));

        let running = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        "done"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.run(async { "never" }).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.queued(), 2);

        assert_eq!(limiter.clear(), 2);
        for task in queued {
            assert!(matches!(task.await.unwrap(), Err(EgressError::Cancelled)));
        }
        assert_eq!(running.await.unwrap().unwrap(), "done");

        // The limiter stays usable after a clear.
        assert_eq!(limiter.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let limiter = Arc::new(ConcurrencyLimiter::with_queue_timeout(
            1,
            Duration::from_millis(30),
        ));

        let holder = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .run(tokio::time::sleep(Duration::from_millis(200)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = limiter.run(async {}).await.unwrap_err();
        assert!(matches!(err, EgressError::QueueTimeout { waited_ms } if waited_ms >= 30));
        assert!(holder.await.unwrap().is_ok());
    }
}
