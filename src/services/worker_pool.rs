//! Bounded worker pool for evaluation jobs.
//!
//! Enforces the controller's concurrency ceiling. Submission blocks under
//! saturation; a closed pool rejects new work with a distinguished error
//! the queue dispatcher treats as its stop signal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};

/// Bounded concurrent executor.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    /// Create a pool with a fixed concurrency ceiling.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a unit of work.
    ///
    /// Blocks while the pool is saturated. Returns `DomainError::PoolClosed`
    /// once `graceful_stop` has been called, including for callers that were
    /// already blocked waiting for a permit.
    pub async fn submit<F>(&self, job: F) -> DomainResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(DomainError::PoolClosed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DomainError::PoolClosed)?;

        let active = self.active.clone();
        let idle = self.idle.clone();
        active.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            job.await;
            drop(permit);
            active.fetch_sub(1, Ordering::AcqRel);
            idle.notify_waiters();
        });

        Ok(())
    }

    /// Close the pool to new work and await in-flight completion up to the
    /// given deadline. Returns whether the pool drained in time.
    pub async fn graceful_stop(&self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::Release);
        // Fail blocked and future acquirers immediately.
        self.permits.close();

        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() > 0 {
            let notified = self.idle.notified();
            if self.active() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    in_flight = self.active(),
                    "worker pool drain deadline exceeded"
                );
                return false;
            }
        }
        debug!("worker pool drained");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::new(4);
        let (tx, rx) = oneshot::channel();

        pool.submit(async move {
            let _ = tx.send(42);
        })
        .await
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn saturation_blocks_submit_until_a_worker_frees() {
        let pool = Arc::new(WorkerPool::new(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        // The pool is saturated: a second submit must not complete yet.
        let pool2 = pool.clone();
        let blocked = tokio::spawn(async move { pool2.submit(async {}).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        release_tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_submissions() {
        let pool = WorkerPool::new(2);
        assert!(pool.graceful_stop(Duration::from_millis(100)).await);

        let result = pool.submit(async {}).await;
        assert!(matches!(result, Err(DomainError::PoolClosed)));
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_in_flight_jobs() {
        let pool = WorkerPool::new(4);
        let (done_tx, done_rx) = oneshot::channel();

        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = done_tx.send(());
        })
        .await
        .unwrap();

        assert!(pool.graceful_stop(Duration::from_secs(5)).await);
        assert_eq!(pool.active(), 0);
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn graceful_stop_reports_deadline_overrun() {
        let pool = WorkerPool::new(1);
        let (hold_tx, hold_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = hold_rx.await;
        })
        .await
        .unwrap();

        assert!(!pool.graceful_stop(Duration::from_millis(50)).await);
        drop(hold_tx);
    }
}
