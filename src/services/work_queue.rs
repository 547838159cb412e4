//! Deduplicating, rate-limited work queue of invocations awaiting
//! evaluation.
//!
//! The queue holds invocation ids, not jobs. Re-adding a pending item is a
//! no-op; re-adding an item that is currently being processed parks it in
//! the dirty set and requeues it when the processor calls `done`. Repeated
//! failures for the same key grow its re-add delay exponentially until
//! `forget` resets the counter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::trace;
use uuid::Uuid;

/// Configuration of the per-key backoff applied by `add_rate_limited`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the n-th consecutive failure (1-based): doubling growth
    /// with a ceiling.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(32);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

#[derive(Default)]
struct QueueState {
    /// Items eligible for `get`, in add order.
    pending: VecDeque<Uuid>,
    /// Items added but not yet handed out; membership gate for dedup.
    dirty: HashSet<Uuid>,
    /// Items handed out and not yet `done`.
    processing: HashSet<Uuid>,
    /// Consecutive failures per key.
    failures: HashMap<Uuid, u32>,
    shut_down: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    wakeup: Notify,
    backoff: BackoffPolicy,
}

/// Rate-limited work queue keyed by invocation id. Cheap to clone; all
/// clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                backoff,
            }),
        }
    }

    /// Enqueue an item.
    ///
    /// Deduplicates against items that are already pending; an item under
    /// processing is parked and requeued on `done`.
    pub async fn add(&self, item: Uuid) {
        let mut state = self.inner.state.lock().await;
        if state.shut_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item);
        if state.processing.contains(&item) {
            trace!(%item, "re-added while in flight; parked");
            return;
        }
        state.pending.push_back(item);
        drop(state);
        self.inner.wakeup.notify_one();
    }

    /// Enqueue an item after a delay. A zero delay adds immediately.
    pub fn add_after(&self, item: Uuid, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(item).await;
        });
    }

    /// Count a failure for the key and enqueue it after its backoff delay.
    pub async fn add_rate_limited(&self, item: Uuid) {
        let failures = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return;
            }
            let counter = state.failures.entry(item).or_insert(0);
            *counter += 1;
            *counter
        };
        let delay = self.inner.backoff.delay_for(failures);
        trace!(%item, failures, ?delay, "rate-limited re-add");
        self.add_after(item, delay);
    }

    /// Reset the key's backoff counter. Called after a successful
    /// evaluation.
    pub async fn forget(&self, item: Uuid) {
        self.inner.state.lock().await.failures.remove(&item);
    }

    /// Consecutive failures recorded for the key.
    pub async fn retries(&self, item: Uuid) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(&item)
            .copied()
            .unwrap_or(0)
    }

    /// Block until an item is available or the queue shuts down.
    ///
    /// The returned item is marked in-flight until `done` releases it.
    pub async fn get(&self) -> Option<Uuid> {
        loop {
            let wakeup = self.inner.wakeup.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(item) = state.pending.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item);
                    return Some(item);
                }
                if state.shut_down {
                    return None;
                }
            }
            wakeup.await;
        }
    }

    /// Release an in-flight item. Requeues it when it was re-added during
    /// processing.
    pub async fn done(&self, item: Uuid) {
        let requeued = {
            let mut state = self.inner.state.lock().await;
            state.processing.remove(&item);
            if state.dirty.contains(&item) && !state.shut_down {
                state.pending.push_back(item);
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.wakeup.notify_one();
        }
    }

    /// Number of items waiting for `get`.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.pending.is_empty()
    }

    /// Stop the queue: pending items drain, blocked getters wake with
    /// `None`, further adds are dropped.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.shut_down = true;
        self.inner.wakeup.notify_waiters();
        self.inner.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        q.add(item).await;
        assert_eq!(q.get().await, Some(item));
    }

    #[tokio::test]
    async fn pending_items_deduplicate() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        q.add(item).await;
        q.add(item).await;
        q.add(item).await;

        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some(item));
        q.done(item).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn re_add_during_flight_requeues_on_done() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        q.add(item).await;
        let got = q.get().await.unwrap();
        assert_eq!(got, item);

        // Re-added while in flight: parked, not pending.
        q.add(item).await;
        assert!(q.is_empty().await);

        q.done(item).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some(item));
    }

    #[tokio::test]
    async fn get_blocks_until_item_arrives() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!getter.is_finished());

        q.add(item).await;
        assert_eq!(getter.await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = WorkQueue::default();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.shutdown().await;
        assert_eq!(getter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn add_after_delays_eligibility() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        q.add_after(item, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.is_empty().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(q.get().await, Some(item));
    }

    #[tokio::test]
    async fn rate_limited_adds_grow_and_forget_resets() {
        let q = WorkQueue::default();
        let item = Uuid::new_v4();

        q.add_rate_limited(item).await;
        q.add_rate_limited(item).await;
        q.add_rate_limited(item).await;
        assert_eq!(q.retries(item).await, 3);

        q.forget(item).await;
        assert_eq!(q.retries(item).await, 0);
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(10), Duration::from_millis(100));
    }
}
