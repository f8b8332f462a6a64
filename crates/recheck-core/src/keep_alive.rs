//! Scoped accounting of outstanding work.
//!
//! Agents and pools acquire a guard while they have work in flight and drop
//! it when they go idle. A host program waits on [`KeepAlive::wait_idle`]
//! before exiting instead of being held open by idle processes or threads.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Cloneable counter of outstanding work.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    count: Arc<watch::Sender<usize>>,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepAlive {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Increment the counter until the returned guard is dropped.
    pub fn acquire(&self) -> KeepAliveGuard {
        self.count.send_modify(|count| *count += 1);
        trace!(count = self.count(), "KeepAlive acquired");
        KeepAliveGuard {
            count: self.count.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Whether any guard is currently held.
    pub fn is_referenced(&self) -> bool {
        self.count() > 0
    }

    /// Wait until no guard is held.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Holds one unit of a [`KeepAlive`] counter.
#[derive(Debug)]
pub struct KeepAliveGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}
