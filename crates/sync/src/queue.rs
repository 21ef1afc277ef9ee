//! Rate-limit-friendly async work queue.
//!
//! Guarantees: an item queued multiple times before processing is handed
//! out once; an item re-added while a worker holds it is re-queued when
//! that worker calls `done`, never handed to a second worker concurrently.
//! Per-key ordering therefore follows drain order.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

struct Inner<T> {
    queue: VecDeque<T>,
    /// Items needing processing (queued or re-added mid-processing).
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    shutdown: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Eq + Hash + Clone + Send + 'static> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown || inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            // Re-queued by done() once the holder finishes.
            return;
        }
        inner.queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Add after a delay; used with the retry limiter's backoff.
    pub fn add_after(self: Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(item);
        });
    }

    /// Next item to process, or `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    if !inner.queue.is_empty() {
                        drop(inner);
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark an item finished. If it went dirty while processing it goes
    /// back on the queue.
    pub fn done(&self, item: &T) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(item);
        if inner.dirty.contains(item) && !inner.shutdown {
            inner.queue.push_back(item.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every blocked `get` with `None` and reject further adds.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
    }
}

impl<T: Eq + Hash + Clone + Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
