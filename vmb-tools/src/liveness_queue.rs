//! Blocking queue with an edge-triggered wait
//!
//! [LivenessQueue::wait_for_new_item] only reports items that are already
//! queued or pushed after the wait started. Every push bumps a monotonic
//! counter under the queue lock, and the waiter compares it against the
//! value it saw when the wait began. A push racing with the condition check
//! is therefore never lost, and a stale wakeup never counts as progress.
//!
//! The queue is meant for monitors that need to tell "nothing happened for
//! too long" apart from "nothing is queued right now".

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    push_count: u64,
}

pub struct LivenessQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> Default for LivenessQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LivenessQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                push_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append an item. Returns false (and drops the item) if the queue is
    /// closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        state.push_count += 1;
        drop(state);
        self.cond.notify_one();
        true
    }

    /// Refuse further pushes and wake up every waiter. Queued items can
    /// still be taken.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful pushes since creation.
    pub fn push_count(&self) -> u64 {
        self.state.lock().unwrap().push_count
    }

    /// Take the next item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let state = self.state.lock().unwrap();
        let mut state = self
            .cond
            .wait_while(state, |state| state.items.is_empty() && !state.closed)
            .unwrap();
        state.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Wait up to `timeout` for an item.
    ///
    /// Returns an item that is already queued, or one pushed after the call
    /// started. Returns `None` on timeout, and immediately when the queue is
    /// empty and closed.
    pub fn wait_for_new_item(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        if let Some(item) = state.items.pop_front() {
            return Some(item);
        }
        let mut observed = state.push_count;

        loop {
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;

            if state.push_count != observed {
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                // another consumer was faster, keep waiting for the next push
                observed = state.push_count;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_item_pushed_after_wait_start() {
        let queue = Arc::new(LivenessQueue::new());

        let queue2 = Arc::clone(&queue);
        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            queue2.push(42u32)
        });

        let start = Instant::now();
        assert_eq!(queue.wait_for_new_item(Duration::from_millis(100)), Some(42));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(pusher.join().unwrap());
    }

    #[test]
    fn test_closed_and_drained_returns_promptly() {
        let queue = LivenessQueue::new();
        queue.push(1u32);
        queue.close();
        assert_eq!(queue.pop(), Some(1));

        let start = Instant::now();
        assert_eq!(queue.wait_for_new_item(Duration::from_secs(10)), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let queue = Arc::new(LivenessQueue::<u32>::new());

        let queue2 = Arc::clone(&queue);
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let item = queue2.wait_for_new_item(Duration::from_secs(10));
            (item, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        queue.close();

        let (item, elapsed) = waiter.join().unwrap();
        assert_eq!(item, None);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_without_push() {
        let queue = LivenessQueue::<u32>::new();

        let start = Instant::now();
        assert_eq!(queue.wait_for_new_item(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_queued_item_returned_immediately() {
        let queue = LivenessQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.push_count(), 2);

        assert_eq!(queue.wait_for_new_item(Duration::from_millis(1)), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_after_close_is_refused() {
        let queue = LivenessQueue::new();
        queue.close();
        assert!(!queue.push(1u32));
        assert_eq!(queue.push_count(), 0);
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0);
    }
}
