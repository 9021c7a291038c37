//! Named exclusive lock
//!
//! A mutex over an abstract resource with owner tracking: only the agent
//! that holds the lock may release it, which prevents accidental release by
//! non-owners.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

struct LockInner {
    resource_name: String,
    holder: Mutex<Option<String>>,
    released: Notify,
}

/// Exclusive lock over a named resource.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MutexLock {
    inner: Arc<LockInner>,
}

impl MutexLock {
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                resource_name: resource_name.into(),
                holder: Mutex::new(None),
                released: Notify::new(),
            }),
        }
    }

    /// Acquire the lock, waiting until it is free or the timeout elapses.
    ///
    /// Records the caller as holder on success. Note the lock is not
    /// reentrant: a second acquire by the current holder waits like any
    /// other caller.
    pub async fn acquire(&self, agent_name: &str, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            {
                let mut holder = self.inner.holder.lock();
                if holder.is_none() {
                    *holder = Some(agent_name.to_string());
                    debug!(
                        "lock acquired: {} -> {}",
                        agent_name, self.inner.resource_name
                    );
                    return true;
                }
            }

            let released = self.inner.released.notified();
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return false;
                    }
                }
                None => released.await,
            }
        }
    }

    /// Release the lock. Succeeds only for the current holder; any other
    /// caller gets `false` and the holder is unchanged.
    pub fn release(&self, agent_name: &str) -> bool {
        let mut holder = self.inner.holder.lock();
        if holder.as_deref() != Some(agent_name) {
            return false;
        }
        *holder = None;
        self.inner.released.notify_one();
        debug!(
            "lock released: {} -> {}",
            agent_name, self.inner.resource_name
        );
        true
    }

    /// The agent currently holding the lock.
    pub fn holder(&self) -> Option<String> {
        self.inner.holder.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.holder.lock().is_some()
    }

    pub fn resource_name(&self) -> &str {
        &self.inner.resource_name
    }
}
