//! FIFO queues.
//!
//! Plain FIFO needs are served by `VecDeque`; this module adds the blocking
//! variant used by worker threads.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// A FIFO queue whose `pop` blocks until an item arrives or the queue is
/// interrupted.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    interrupted: bool,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                interrupted: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        self.state.lock().items.push_back(item);
        self.available.notify_one();
    }

    /// Take the head item, waiting until one is available.
    ///
    /// Returns `None` once the queue has been interrupted.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    /// Take the head item, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        if state.items.is_empty() && !state.interrupted {
            self.available.wait_for(&mut state, timeout);
        }
        if state.interrupted {
            return None;
        }
        state.items.pop_front()
    }

    /// Take the head item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wake every waiting consumer; subsequent pops return `None`.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.available.notify_all();
    }

    /// Remove and return every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.state.lock().items.clear();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}
