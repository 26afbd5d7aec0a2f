//! Bounded event queue
//!
//! Shared by the live-state store and the notifier: senders never block,
//! and when the queue is full the oldest event is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// A bounded in-memory queue with drop-oldest overflow.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an event without blocking. Returns the number of events
    /// dropped to make room (0 or 1).
    pub fn push(&self, item: T) -> u64 {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0;
        if items.len() >= self.capacity {
            items.pop_front();
            dropped = 1;
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        dropped
    }

    /// Pop one event if present.
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.pop_front()
    }

    /// Drain up to `max` queued events.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let n = items.len().min(max);
        items.drain(..n).collect()
    }

    /// Wait until at least one event is queued.
    pub async fn wait(&self) {
        loop {
            {
                let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if !items.is_empty() {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(3);
        assert_eq!(queue.push(1), 0);
        assert_eq!(queue.push(2), 0);
        assert_eq!(queue.push(3), 0);
        assert_eq!(queue.push(4), 1);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(10), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_push() {
        use std::sync::Arc;
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(8));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait().await;
                queue.try_pop()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(9);
        assert_eq!(waiter.await.unwrap(), Some(9));
    }
}
