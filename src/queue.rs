use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;
use tracing::trace;

/// Bounded single-consumer queue that can be marked ended.
///
/// Capacities are chosen so that the queue never fills up; a put into a full
/// queue is an invariant violation and panics. Puts after the end are dropped.
pub struct BoundedQueue<T> {
    name: String,
    items: ArrayQueue<T>,
    ended: AtomicBool,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            items: ArrayQueue::new(capacity),
            ended: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Returns false when the item was dropped because the queue has ended.
    pub fn put(&self, item: T) -> bool {
        if self.is_ended() {
            trace!("{}: put after end dropped", self.name);
            return false;
        }
        if self.items.push(item).is_err() {
            panic!("{}: queue overflow (capacity {})", self.name, self.items.capacity());
        }
        self.notify.notify_one();
        true
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Next item, or `None` once the queue has ended and is drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            if self.is_ended() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// End the queue and throw away what is left in it.
    pub fn finish(&self) {
        self.end();
        while self.items.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::{spawn, time::sleep};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drains_before_end() {
        let queue = BoundedQueue::new("test", 4);
        assert!(queue.put(1));
        assert!(queue.put(2));
        queue.end();
        assert!(!queue.put(3));
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn get_waits_for_put() {
        let queue = Arc::new(BoundedQueue::new("test", 4));
        let consumer = spawn({
            let queue = queue.clone();
            async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.get().await {
                    seen.push(item);
                }
                seen
            }
        });
        sleep(Duration::from_millis(10)).await;
        queue.put("a");
        sleep(Duration::from_millis(10)).await;
        queue.put("b");
        queue.end();
        assert_eq!(consumer.await.unwrap(), ["a", "b"]);
    }

    #[test]
    #[should_panic(expected = "queue overflow")]
    fn overflow_panics() {
        let queue = BoundedQueue::new("test", 2);
        queue.put(1);
        queue.put(2);
        queue.put(3);
    }

    #[test]
    fn finish_discards() {
        let queue = BoundedQueue::new("test", 2);
        queue.put(1);
        queue.finish();
        assert!(queue.is_empty());
        assert!(queue.is_ended());
    }
}
