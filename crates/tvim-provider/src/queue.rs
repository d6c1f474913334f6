//! Single-consumer FIFO with supersession.
//!
//! Used by the session worker (one queue per session) and by the
//! broker's watch-log recorder. Producers never block; the consumer
//! awaits [`DispatchQueue::pop`].

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An ordered queue with one consumer.
pub struct DispatchQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
}

impl<T> DispatchQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends an item. Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Drops every queued item matching `supersedes`, then appends `item`.
    ///
    /// Returns the number of dropped items, or `None` if the queue is closed.
    pub fn push_superseding<F>(&self, item: T, supersedes: F) -> Option<usize>
    where
        F: Fn(&T) -> bool,
    {
        let removed = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return None;
            }
            let before = inner.items.len();
            inner.items.retain(|queued| !supersedes(queued));
            let removed = before - inner.items.len();
            inner.items.push_back(item);
            removed
        };
        self.notify.notify_one();
        Some(removed)
    }

    /// Waits for the next item.
    ///
    /// After [`close`](Self::close), remaining items are still handed out;
    /// `None` means closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Rejects further pushes and wakes the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Closes the queue and discards whatever is still queued.
    pub fn close_and_clear(&self) -> usize {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let dropped = inner.items.len();
            inner.items.clear();
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
