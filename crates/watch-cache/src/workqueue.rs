//! Keyed work queue.
//!
//! Semantics follow the classic controller queue:
//! - an item is queued at most once, however often it is added (`dirty`)
//! - an item handed to a worker is not handed to another one until `done`
//!   is called for it (`processing`); adds in between are replayed by `done`
//! - `add_rate_limited` requeues with a per-item exponential backoff that
//!   `forget` resets

use crate::backoff::{ExponentialBackoff, ItemBackoff};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

struct Inner<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    backoff: ItemBackoff<T>,
    shutting_down: bool,
}

/// Queue of keys waiting to be reconciled.
pub struct WorkQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("WorkQueue")
            .field("queued", &inner.queue.len())
            .field("processing", &inner.processing.len())
            .field("shutting_down", &inner.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                backoff: ItemBackoff::new(backoff),
                shutting_down: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing work.
    pub fn add(&self, item: T) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            return;
        }
        inner.queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds `item` after its next backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.lock().backoff.next_delay(item.clone());
        self.add_after(item, delay);
    }

    /// Clears the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().backoff.forget(item);
    }

    /// Rate-limited requeues of `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().backoff.failures(item)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Releases `item`; if it was added while being processed it is queued again.
    pub fn done(&self, item: &T) {
        let mut inner = self.lock();
        inner.processing.remove(item);
        if inner.dirty.contains(item) && !inner.shutting_down {
            inner.queue.push_back(item.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out items and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
