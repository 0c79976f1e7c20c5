use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// FIFO bounded blocking queue shared by the writer, prefetch, deletion and
/// completion pipelines. A full queue blocks producers (backpressure, not an
/// error); a closed queue refuses new items but still drains existing ones.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// Outcome of a non-blocking push, handing the item back to the caller.
pub enum TryPushError<T> {
    Full(T),
    Closed(T),
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Returns `false` if the queue was
    /// closed before the item could be enqueued.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.items.len() < state.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            self.not_full.wait(&mut state);
        }
    }

    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.items.len() >= state.capacity {
            return Err(TryPushError::Full(item));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Drops the oldest queued item to make room. Used by the deletion path,
    /// where losing a pending unlink only wastes disk space.
    pub fn pop_oldest(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Blocks while the queue is empty. Returns `None` once the queue is
    /// closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn preserves_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            assert!(queue.push(i));
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
    }

    #[test]
    fn full_queue_applies_backpressure() {
        let queue = Arc::new(BoundedQueue::new(1));
        assert!(queue.push(1u64));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2u64))
        };
        // Give the producer a moment to block on the full queue.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn close_drains_then_returns_none() {
        let queue = BoundedQueue::new(4);
        assert!(queue.push("a"));
        queue.close();
        assert!(!queue.push("b"));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(BoundedQueue::<u64>::new(4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn try_push_reports_full_with_item() {
        let queue = BoundedQueue::new(1);
        queue.try_push(7).ok().unwrap();
        match queue.try_push(8) {
            Err(TryPushError::Full(item)) => assert_eq!(item, 8),
            _ => panic!("expected full"),
        }
        assert_eq!(queue.pop_oldest(), Some(7));
        assert!(queue.try_push(8).is_ok());
    }
}
