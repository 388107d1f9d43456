//! Event loop implementation.
//!
//! The loop owns a ready queue and a completion channel. Each turn:
//! 1. Every ready continuation is handed to the driver, in FIFO order
//! 2. Finished deferred operations are moved onto the ready queue
//! 3. If nothing is ready but operations are outstanding, the loop blocks
//!    on the completion channel
//!
//! The loop stops when no work is ready and nothing is outstanding.

use std::sync::atomic::{AtomicUsize, Ordering};

use core_types::Value;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::budget::Budget;
use crate::ready_queue::ReadyQueue;
use crate::schedule::Schedule;

/// A reactor driving continuations of type `C`.
///
/// # Examples
///
/// ```
/// use async_runtime::{EventLoop, Schedule};
/// use core_types::Value;
///
/// let event_loop = EventLoop::new();
/// event_loop.add("first", Value::Int(1));
/// event_loop.defer("io", || Value::str("done"));
///
/// let mut seen = Vec::new();
/// event_loop.run(|name, value| seen.push((name, value)));
/// assert_eq!(seen.len(), 2);
/// assert_eq!(seen[0].0, "first");
/// ```
pub struct EventLoop<C> {
    ready: ReadyQueue<C>,
    budget: Budget,
    completions: (Sender<(C, Value)>, Receiver<(C, Value)>),
    outstanding: AtomicUsize,
}

impl<C: Send + 'static> EventLoop<C> {
    /// Creates an event loop that never preempts.
    pub fn new() -> Self {
        Self::with_budget(Budget::Unlimited)
    }

    /// Creates an event loop handing out `budget` to every run.
    pub fn with_budget(budget: Budget) -> Self {
        Self {
            ready: ReadyQueue::new(),
            budget,
            completions: channel::unbounded(),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Run `op` on a worker thread and make `continuation` ready with its
    /// result once it finishes.
    pub fn defer<F>(&self, continuation: C, op: F)
    where
        F: FnOnce() -> Value + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let sender = self.completions.0.clone();
        std::thread::spawn(move || {
            let value = op();
            if sender.send((continuation, value)).is_err() {
                warn!(target: "async_runtime::event_loop", "event loop gone, completion dropped");
            }
        });
    }

    /// Drive every continuation through `driver` until the loop is idle.
    ///
    /// The driver may add or defer more work through a shared reference to
    /// the loop. Returns the number of continuations driven.
    pub fn run<D>(&self, mut driver: D) -> usize
    where
        D: FnMut(C, Value),
    {
        let mut driven = 0;
        loop {
            while let Some((continuation, pending)) = self.ready.pop() {
                driver(continuation, pending);
                driven += 1;
            }
            self.collect_completions();
            if !self.ready.is_empty() {
                continue;
            }
            if self.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            trace!(target: "async_runtime::event_loop", "waiting for completions");
            match self.completions.1.recv() {
                Ok((continuation, value)) => self.complete(continuation, value),
                Err(_) => break,
            }
        }
        debug!(target: "async_runtime::event_loop", driven, "event loop idle");
        driven
    }

    /// Returns true if nothing is ready and nothing is outstanding.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Number of continuations ready to run.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of deferred operations not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn collect_completions(&self) {
        while let Ok((continuation, value)) = self.completions.1.try_recv() {
            self.complete(continuation, value);
        }
    }

    fn complete(&self, continuation: C, value: Value) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.ready.push(continuation, value);
    }
}

impl<C: Send + 'static> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + 'static> Schedule<C> for EventLoop<C> {
    fn budget(&self) -> Budget {
        self.budget.clone()
    }

    fn add(&self, continuation: C, pending: Value) {
        trace!(target: "async_runtime::event_loop", "continuation requeued");
        self.ready.push(continuation, pending);
    }
}

impl<C> std::fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("ready", &self.ready)
            .field("budget", &self.budget)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}
