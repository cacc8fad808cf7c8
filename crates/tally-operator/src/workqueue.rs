//! Rate-limited, deduplicated work queue
//!
//! The queue holds `namespace/name` keys and guarantees at most one
//! in-flight copy of a key: a key re-added while a worker is processing it
//! is parked and re-queued when the worker calls [`WorkQueue::done`].
//! Failed keys come back through [`WorkQueue::add_rate_limited`] with
//! per-key exponential backoff; [`WorkQueue::forget`] resets the backoff.
//! After [`WorkQueue::shutdown`], `get` drains the remaining keys and then
//! returns `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Base delay for the first rate-limited retry of a key.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap on the per-key exponential backoff.
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, including parked re-adds
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    /// Per-key rate-limited retry count
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key, deduplicating against queued and in-flight copies.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if inner.processing.contains(key) {
            // Parked; done() will re-queue it.
            return;
        }
        inner.queue.push_back(key.to_string());
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueue a key after its per-key exponential backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let failures = inner.requeues.entry(key.to_string()).or_insert(0);
            let exp = (*failures).min(31);
            *failures += 1;
            let delay = BASE_DELAY
                .checked_mul(1u32 << exp)
                .unwrap_or(MAX_DELAY)
                .min(MAX_DELAY);
            delay
        };
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Number of rate-limited retries recorded for a key.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Reset a key's backoff state.
    pub fn forget(&self, key: &str) {
        self.inner.lock().requeues.remove(key);
    }

    /// Pop the next key, suspending until one is available.
    ///
    /// Returns `None` once the queue is shut down and drained. Callers must
    /// invoke [`WorkQueue::done`] exactly once per returned key.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    // Wake another waiter in case more keys remain.
                    if !inner.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing finished, re-queueing it if it was re-added
    /// while in flight.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys; pending `get` calls drain then return `None`.
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
