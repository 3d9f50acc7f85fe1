//! Tracking of local edits that are stamped with a tick but not yet committed.
//!
//! When a push starts, the current tick is advanced. Any write that read the
//! old tick but has not committed yet would be invisible to the snapshot and
//! then skipped forever by the next push. The pusher waits on
//! [`PendingEdits::wait_for`] until every such write has finished.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use edgesync_common::SyncTick;

#[derive(Default)]
struct Inner {
    in_flight: Mutex<BTreeMap<SyncTick, usize>>,
    drained: Notify,
}

/// Counter of in-flight local edits keyed by the tick they were stamped with.
#[derive(Clone, Default)]
pub struct PendingEdits {
    inner: Arc<Inner>,
}

impl PendingEdits {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an edit stamped with `tick`.
    ///
    /// The edit counts as pending until the returned guard is dropped.
    pub fn begin(&self, tick: SyncTick) -> PendingEditGuard {
        *self.lock().entry(tick).or_insert(0) += 1;
        PendingEditGuard {
            inner: Arc::clone(&self.inner),
            tick,
        }
    }

    /// Number of edits stamped with a tick at or below `tick` still in flight.
    pub fn in_flight(&self, tick: SyncTick) -> usize {
        self.lock().range(..=tick).map(|(_, n)| n).sum()
    }

    /// Wait until no edit stamped with a tick at or below `tick` is in flight.
    pub async fn wait_for(&self, tick: SyncTick) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight(tick) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SyncTick, usize>> {
        lock_counts(&self.inner)
    }
}

fn lock_counts(inner: &Inner) -> MutexGuard<'_, BTreeMap<SyncTick, usize>> {
    // The map only holds counters, so a poisoned lock still has usable state.
    inner
        .in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks one edit as in flight until dropped.
pub struct PendingEditGuard {
    inner: Arc<Inner>,
    tick: SyncTick,
}

impl Drop for PendingEditGuard {
    fn drop(&mut self) {
        {
            let mut counts = lock_counts(&self.inner);
            if let Some(n) = counts.get_mut(&self.tick) {
                *n -= 1;
                if *n == 0 {
                    counts.remove(&self.tick);
                }
            }
        }
        self.inner.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_nothing_pending() {
        let pending = PendingEdits::new();
        tokio::time::timeout(Duration::from_secs(1), pending.wait_for(SyncTick::new(5)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_guard_dropped() {
        let pending = PendingEdits::new();
        let guard = pending.begin(SyncTick::new(3));
        assert_eq!(pending.in_flight(SyncTick::new(3)), 1);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait_for(SyncTick::new(3)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.in_flight(SyncTick::new(3)), 0);
    }

    #[tokio::test]
    async fn test_edits_at_later_ticks_do_not_block() {
        let pending = PendingEdits::new();
        let _later = pending.begin(SyncTick::new(9));

        tokio::time::timeout(Duration::from_secs(1), pending.wait_for(SyncTick::new(8)))
            .await
            .unwrap();
        assert_eq!(pending.in_flight(SyncTick::new(9)), 1);
    }
}
