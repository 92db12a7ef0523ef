//! Bounded pool for fire-and-forget work.
//!
//! Publish/Enqueue deliveries and `start` triggers run here instead of being
//! spawned blindly. A `TaskTracker` keeps a completion handle for every task
//! so callers can await a full drain, and a semaphore caps how many of them
//! run at once.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Executor for detached work with an explicit drain handle.
///
/// Cloning is cheap; clones share the same tracker and permits.
#[derive(Debug, Clone)]
pub struct DetachedPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl DetachedPool {
    /// Creates a pool that runs at most `max_concurrent` tasks at a time.
    /// A limit of zero is raised to one.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Submits a unit of work and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = permits.acquire_owned().await.ok();
            work.await;
        });
    }

    /// Number of submitted tasks that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every task submitted so far has finished.
    ///
    /// Work submitted while draining is awaited as well. The pool stays
    /// usable afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for DetachedPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_all_tasks() {
        let pool = DetachedPool::new(8);
        let done = Arc::new(AtomicU32::new(0));

        for i in 0..5u64 {
            let done = done.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn pool_is_reusable_after_drain() {
        let pool = DetachedPool::new(2);
        let done = Arc::new(AtomicU32::new(0));

        let d = done.clone();
        pool.spawn(async move {
            d.fetch_add(1, Ordering::SeqCst);
        });
        pool.drain().await;

        let d = done.clone();
        pool.spawn(async move {
            d.fetch_add(1, Ordering::SeqCst);
        });
        pool.drain().await;

        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = DetachedPool::new(2);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn drain_on_idle_pool_returns() {
        let pool = DetachedPool::default();
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);
    }
}
