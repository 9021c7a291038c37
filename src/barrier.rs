//! Rendezvous barrier
//!
//! A fixed number of named arrivals meet at the barrier. Completion latches
//! until `reset`; once complete, `wait` returns immediately.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

struct BarrierInner {
    name: String,
    expected: usize,
    arrived: Mutex<HashSet<String>>,
    completed: watch::Sender<bool>,
}

/// Rendezvous for a fixed set of arrivals.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SyncBarrier {
    inner: Arc<BarrierInner>,
}

impl SyncBarrier {
    /// Create a barrier expecting `expected` distinct arrivals.
    pub fn new(name: impl Into<String>, expected: usize) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            inner: Arc::new(BarrierInner {
                name: name.into(),
                expected,
                arrived: Mutex::new(HashSet::new()),
                completed,
            }),
        }
    }

    /// Record an arrival. Duplicate names are idempotent.
    ///
    /// Returns `true` once the arrival count reaches the expected count,
    /// which also releases every pending `wait`.
    pub fn arrive(&self, agent_name: &str) -> bool {
        let mut arrived = self.inner.arrived.lock();
        arrived.insert(agent_name.to_string());
        debug!(
            "barrier {}: {} arrived ({}/{})",
            self.inner.name,
            agent_name,
            arrived.len(),
            self.inner.expected
        );
        if arrived.len() >= self.inner.expected {
            self.inner.completed.send_replace(true);
            true
        } else {
            false
        }
    }

    /// Wait until the barrier is complete.
    ///
    /// Returns `false` on timeout. If the barrier already completed, returns
    /// immediately.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut completed = self.inner.completed.subscribe();
        let latched = completed.wait_for(|complete| *complete);
        match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, latched).await, Ok(Ok(_))),
            None => latched.await.is_ok(),
        }
    }

    /// Empty the arrival set and re-arm the completion latch.
    pub fn reset(&self) {
        self.inner.arrived.lock().clear();
        self.inner.completed.send_replace(false);
    }

    /// Number of distinct arrivals so far.
    pub fn arrived_count(&self) -> usize {
        self.inner.arrived.lock().len()
    }

    /// Whether the expected count has been reached.
    pub fn is_complete(&self) -> bool {
        self.arrived_count() >= self.inner.expected
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn expected(&self) -> usize {
        self.inner.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rendezvous() {
        let barrier = SyncBarrier::new("sync", 2);

        assert!(!barrier.arrive("a"));
        // Duplicate arrival is idempotent.
        assert!(!barrier.arrive("a"));
        assert_eq!(barrier.arrived_count(), 1);

        assert!(barrier.arrive("b"));
        assert!(barrier.is_complete());
        assert!(barrier.wait(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_complete() {
        let barrier = SyncBarrier::new("sync", 2);
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        barrier.arrive("a");
        barrier.arrive("b");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let barrier = SyncBarrier::new("sync", 2);
        barrier.arrive("a");
        assert!(!barrier.wait(Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn test_completion_latches_until_reset() {
        let barrier = SyncBarrier::new("sync", 1);
        barrier.arrive("a");
        // Latched: repeated waits return immediately.
        assert!(barrier.wait(Some(Duration::from_millis(10))).await);
        assert!(barrier.wait(Some(Duration::from_millis(10))).await);

        barrier.reset();
        assert_eq!(barrier.arrived_count(), 0);
        assert!(!barrier.is_complete());
        assert!(!barrier.wait(Some(Duration::from_millis(20))).await);
    }
}
