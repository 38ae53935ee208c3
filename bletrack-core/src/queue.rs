//! FIFO hand-off between the capture loop and notifiers.
//!
//! One producer enqueues; any number of consumers drain on their own
//! schedule. A capacity of zero means unbounded. A bounded queue never blocks
//! the producer: when full, the oldest item is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::types::Notification;

/// Default bound used when no capacity is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub type NotificationQueue = HandoffQueue<Notification>;

#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> HandoffQueue<T> {
    /// `capacity == 0` makes the queue unbounded.
    pub fn new(capacity: usize) -> Self {
        HandoffQueue {
            items: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn unbounded() -> Self {
        HandoffQueue::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Returns false if the oldest item was evicted to make room.
    pub fn enqueue(&self, item: T) -> bool {
        let mut items = self.lock();
        let mut kept_all = true;
        if self.capacity > 0 && items.len() >= self.capacity {
            items.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(capacity = self.capacity, dropped = total, "queue full, dropped oldest");
            kept_all = false;
        }
        items.push_back(item);
        kept_all
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain_all(&self) -> Vec<T> {
        let mut items = self.lock();
        std::mem::take(&mut *items).into()
    }

    /// Remove and return at most `max` items, oldest first.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut items = self.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Items evicted by the drop-oldest policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured bound, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        HandoffQueue::new(DEFAULT_QUEUE_CAPACITY)
    }
}
