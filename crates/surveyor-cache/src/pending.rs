// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Per-key singleflight tracker.
///
/// The first caller that misses on a key becomes the producer and fetches
/// upstream; callers that arrive while the fetch is in flight block on the
/// entry's done signal instead of issuing their own fetch. At most one live
/// entry exists per key string at any instant.
pub(crate) struct PendingWork {
    inflight: Mutex<HashMap<String, Arc<PendingEntry>>>,
}

pub(crate) struct PendingEntry {
    /// Fires exactly once, when the producer completes or cancels.
    done: watch::Sender<bool>,
    cancelled: AtomicBool,
}

impl PendingWork {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `key`. Returns `(true, entry)` if the caller
    /// should do the upstream work itself, `(false, entry)` if another
    /// caller already owns it and this one should [`wait`](Self::wait).
    pub fn start_work(&self, key: String) -> (bool, Arc<PendingEntry>) {
        let mut inflight = self.inflight.lock();
        if let Some(entry) = inflight.get(&key) {
            return (false, entry.clone());
        }
        let (done, _) = watch::channel(false);
        let entry = Arc::new(PendingEntry {
            done,
            cancelled: AtomicBool::new(false),
        });
        inflight.insert(key, entry.clone());
        (true, entry)
    }

    /// Blocks until the producer completes or cancels. Returns `true` if the
    /// work completed (the caller should re-read the cache), `false` if it
    /// was cancelled. Waiters never touch the map; dropping a waiting future
    /// detaches it without affecting the producer or other waiters.
    pub async fn wait(&self, entry: &Arc<PendingEntry>) -> bool {
        let mut done = entry.done.subscribe();
        let result = match done.wait_for(|fired| *fired).await {
            Ok(_) => !entry.cancelled.load(Ordering::Acquire),
            // The producer dropped its entry without signalling. Treat it
            // as cancelled so the caller falls back to its own fetch.
            Err(_) => false,
        };
        result
    }

    /// Removes the entry for `key` and wakes its waiters as completed.
    /// No-op if the entry is already gone.
    pub fn complete(&self, key: &str) {
        let entry = self.inflight.lock().remove(key);
        if let Some(entry) = entry {
            entry.done.send_replace(true);
        }
    }

    /// Removes the entry for `key` and wakes its waiters as cancelled.
    /// No-op if the entry is already gone.
    pub fn cancel(&self, key: &str) {
        let entry = self.inflight.lock().remove(key);
        if let Some(entry) = entry {
            entry.cancelled.store(true, Ordering::Release);
            entry.done.send_replace(true);
        }
    }

    /// Cancels only if `entry` is still the live entry for `key`. Used by
    /// [`WorkGuard`] so that a guard dropped late cannot cancel work started
    /// by a successor under the same key.
    fn cancel_entry(&self, key: &str, entry: &Arc<PendingEntry>) {
        let removed = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(live) if Arc::ptr_eq(live, entry) => inflight.remove(key),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!(key, "cancelling pending work");
            entry.cancelled.store(true, Ordering::Release);
            entry.done.send_replace(true);
        }
    }
}

/// Ownership of the upstream fetch for one cache key.
///
/// Returned by a cache miss to the single caller that should fetch
/// upstream. Storing an item or an error under the key completes the
/// pending work; dropping the guard without storing cancels it, waking
/// waiters so they can fall back to their own fetches. Either way the
/// signal fires exactly once.
pub struct WorkGuard {
    pending: Arc<PendingWork>,
    key: String,
    entry: Arc<PendingEntry>,
}

impl WorkGuard {
    pub(crate) fn new(pending: Arc<PendingWork>, key: String, entry: Arc<PendingEntry>) -> Self {
        Self {
            pending,
            key,
            entry,
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.pending.cancel_entry(&self.key, &self.entry);
    }
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{PendingWork, WorkGuard};

    #[tokio::test]
    async fn first_caller_works_later_callers_wait() {
        let pending = PendingWork::new();
        let (should_work, _entry) = pending.start_work("k".into());
        assert!(should_work);
        let (should_work, _entry) = pending.start_work("k".into());
        assert!(!should_work);
        // A different key is independent.
        let (should_work, _entry) = pending.start_work("other".into());
        assert!(should_work);
    }

    #[tokio::test]
    async fn complete_wakes_waiters_ok() {
        let pending = Arc::new(PendingWork::new());
        let (_, entry) = pending.start_work("k".into());

        let waiter = {
            let pending = pending.clone();
            let entry = entry.clone();
            tokio::spawn(async move { pending.wait(&entry).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pending.complete("k");
        assert!(waiter.await.unwrap());

        // Idempotent.
        pending.complete("k");
        pending.cancel("k");
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_not_ok() {
        let pending = Arc::new(PendingWork::new());
        let (_, entry) = pending.start_work("k".into());

        let waiter = {
            let pending = pending.clone();
            let entry = entry.clone();
            tokio::spawn(async move { pending.wait(&entry).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pending.cancel("k");
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_after_completion_returns_immediately() {
        let pending = PendingWork::new();
        let (_, entry) = pending.start_work("k".into());
        pending.complete("k");
        assert!(pending.wait(&entry).await);
    }

    #[tokio::test]
    async fn dropped_guard_cancels() {
        let pending = Arc::new(PendingWork::new());
        let (_, entry) = pending.start_work("k".into());
        let guard = WorkGuard::new(pending.clone(), "k".into(), entry.clone());
        drop(guard);
        assert!(!pending.wait(&entry).await);
        // The slot is free again.
        let (should_work, _) = pending.start_work("k".into());
        assert!(should_work);
    }

    #[tokio::test]
    async fn stale_guard_does_not_cancel_successor() {
        let pending = Arc::new(PendingWork::new());
        let (_, first) = pending.start_work("k".into());
        let guard = WorkGuard::new(pending.clone(), "k".into(), first.clone());
        // The producer completed via the keyed path, then a new round of
        // work started under the same key.
        pending.complete("k");
        let (should_work, second) = pending.start_work("k".into());
        assert!(should_work);
        // Dropping the stale guard must leave the new entry alone.
        drop(guard);
        pending.complete("k");
        assert!(pending.wait(&second).await);
    }
}
