//! Per-queue serialisation.
//!
//! Handler bodies contain Git side effects on a shared local mirror that are
//! not transactional, so queues serialise on an async lock keyed by merge
//! queue id rather than relying on store isolation alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct QueueLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl QueueLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a merge queue, waiting if another handler for
    /// the same queue is in flight.
    pub async fn acquire(&self, merge_queue_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("mutex poisoned");
            Arc::clone(
                locks
                    .entry(merge_queue_id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_queue_serialises() {
        let locks = QueueLocks::new();
        let guard = locks.acquire(1).await;
        // A second acquisition of the same queue must not be available.
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.acquire(1),
        )
        .await;
        assert!(second.is_err());
        drop(guard);
        locks.acquire(1).await;
    }

    #[tokio::test]
    async fn different_queues_are_independent() {
        let locks = QueueLocks::new();
        let _one = locks.acquire(1).await;
        let _two = locks.acquire(2).await;
    }
}
