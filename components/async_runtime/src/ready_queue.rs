//! Ready queue management.
//!
//! Continuations that can run right away wait here in FIFO order together
//! with the value they are resumed with.

use std::collections::VecDeque;
use std::sync::Arc;

use core_types::Value;
use parking_lot::Mutex;

/// A shared FIFO of `(continuation, pending value)` pairs.
///
/// Clones share the same queue, so a completion handler running on another
/// thread can push work the event loop will pick up.
pub struct ReadyQueue<C> {
    queue: Arc<Mutex<VecDeque<(C, Value)>>>,
}

impl<C> ReadyQueue<C> {
    /// Creates a new empty ReadyQueue.
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Adds a continuation to the end of the queue.
    pub fn push(&self, continuation: C, pending: Value) {
        self.queue.lock().push_back((continuation, pending));
    }

    /// Removes and returns the next continuation.
    pub fn pop(&self) -> Option<(C, Value)> {
        self.queue.lock().pop_front()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Returns the number of queued continuations.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<C> Clone for ReadyQueue<C> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<C> Default for ReadyQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for ReadyQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadyQueue {{ len: {} }}", self.len())
    }
}
