//! A work queue of object keys.
//!
//! Items are processed in FIFO order. An item which is already queued is not queued again, and
//! an item which is being processed is held back until `done` is called for it, so that at most
//! one worker handles a given item at a time. Delayed adds are driven by a `RateLimiter`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A policy deciding how long an item must wait before being re-queued.
pub trait RateLimiter<T>: Send + Sync {
    /// The delay to apply to the given item, recording a requeue.
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking the given item.
    fn forget(&self, item: &T);
    /// The number of times the given item has been requeued since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// A rate limiter which always waits the same interval.
///
/// There is no backoff: a periodic reprocess of every item is the steady state.
pub struct FixedIntervalRateLimiter<T: Hash + Eq> {
    interval: Duration,
    requeues: DashMap<T, u32>,
}

impl<T: Hash + Eq> FixedIntervalRateLimiter<T> {
    /// Create a new instance.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            requeues: DashMap::new(),
        }
    }
}

impl<T> RateLimiter<T> for FixedIntervalRateLimiter<T>
where
    T: Clone + Hash + Eq + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        *self.requeues.entry(item.clone()).or_insert(0) += 1;
        self.interval
    }

    fn forget(&self, item: &T) {
        self.requeues.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.requeues.get(item).map(|count| *count).unwrap_or(0)
    }
}

/// A pending delayed add.
struct Delayed {
    ready_at: Instant,
    seq: u64,
    handle: JoinHandle<()>,
}

struct Inner<T> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<T>,
    /// Items which need processing, whether queued or held back while processing.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    /// Items waiting on a delay.
    delayed: HashMap<T, Delayed>,
    next_seq: u64,
    shutting_down: bool,
}

/// A FIFO work queue with deduplication, an in-flight guard and delayed adds.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Hash + Eq + Send + Sync + 'static,
{
    /// Create a new instance.
    pub fn new(limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: HashMap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        }
    }

    /// Mark the given item as needing processing.
    pub async fn add(&self, item: T) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down || inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            return; // Re-queued by `done`.
        }
        inner.queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next item to process.
    ///
    /// Returns `None` once the queue is shut down. The caller must call `done` with the item
    /// when finished with it.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.shutting_down {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release an item obtained from `get`, re-queuing it if it was added during processing.
    pub async fn done(&self, item: &T) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(item);
        if inner.dirty.contains(item) && !inner.shutting_down {
            inner.queue.push_back(item.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop tracking the given item in the rate limiter and cancel any pending delayed add.
    pub async fn forget(&self, item: &T) {
        self.limiter.forget(item);
        let mut inner = self.inner.lock().await;
        if let Some(delayed) = inner.delayed.remove(item) {
            delayed.handle.abort();
        }
    }

    /// Add the given item after the given delay.
    ///
    /// If the item is already waiting on a delay, the earlier of the two deadlines wins.
    pub async fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item).await;
            return;
        }
        let ready_at = Instant::now() + delay;
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        if let Some(existing) = inner.delayed.get(&item) {
            if existing.ready_at <= ready_at {
                return;
            }
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let (queue, delayed_item) = (self.clone(), item.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            {
                let mut inner = queue.inner.lock().await;
                if inner.delayed.get(&delayed_item).map(|delayed| delayed.seq == seq).unwrap_or(false) {
                    inner.delayed.remove(&delayed_item);
                }
            }
            queue.add(delayed_item).await;
        });
        if let Some(replaced) = inner.delayed.insert(item, Delayed { ready_at, seq, handle }) {
            replaced.handle.abort();
        }
    }

    /// Add the given item once the rate limiter says it may be processed again.
    pub async fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay).await;
    }

    /// The number of times the given item has been re-queued through the rate limiter.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Shut down the queue, waking all waiting workers.
    ///
    /// Items still queued are dropped, and pending delayed adds are cancelled.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        for (_, delayed) in inner.delayed.drain() {
            delayed.handle.abort();
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Check if the queue has been shut down.
    #[cfg(test)]
    pub async fn is_shutting_down(&self) -> bool {
        self.inner.lock().await.shutting_down
    }

    /// The number of items ready to be handed out.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}
