//! Per-thread mutual exclusion. At most one in-flight operation per
//! conversation; excess requests are rejected, never queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

use murmur_core::lock_or_recover_mutex;

use crate::state::ThreadKey;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Keyed lock table. Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct ThreadLocks {
    held: Arc<Mutex<HashSet<ThreadKey>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking probe. `None` means the thread is busy.
    pub fn try_acquire(&self, key: &ThreadKey) -> Option<ThreadLockGuard> {
        let mut held = lock_or_recover_mutex(&self.held);
        if held.contains(key) {
            return None;
        }
        held.insert(key.clone());
        Some(ThreadLockGuard {
            held: Arc::clone(&self.held),
            key: key.clone(),
        })
    }

    /// Polls until the lock frees up or `timeout` elapses. A zero timeout
    /// is the same single probe as `try_acquire`.
    pub async fn acquire(&self, key: &ThreadKey, timeout: Duration) -> Option<ThreadLockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_acquire(key) {
                return Some(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(now);
            sleep(remaining.min(ACQUIRE_POLL_INTERVAL)).await;
        }
    }

    pub fn is_locked(&self, key: &ThreadKey) -> bool {
        lock_or_recover_mutex(&self.held).contains(key)
    }
}

/// Scoped thread lock. Dropping the guard releases the thread, so release
/// happens on every exit path and exactly once per acquire.
#[derive(Debug)]
pub struct ThreadLockGuard {
    held: Arc<Mutex<HashSet<ThreadKey>>>,
    key: ThreadKey,
}

impl ThreadLockGuard {
    pub fn key(&self) -> &ThreadKey {
        &self.key
    }
}

impl Drop for ThreadLockGuard {
    fn drop(&mut self) {
        let mut held = lock_or_recover_mutex(&self.held);
        if !held.remove(&self.key) {
            warn!(thread = %self.key, "released a thread lock that was not held");
        }
    }
}
