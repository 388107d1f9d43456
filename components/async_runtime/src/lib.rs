//! Cooperative scheduling for the interpreter.
//!
//! This crate provides the pieces an interpreter needs to share a thread
//! with other work without ever blocking inside dispatch:
//! - Preemption budgets, either an instruction counter or a wall-clock deadline
//! - The [`Schedule`] contract a preempted continuation is handed to
//! - A FIFO ready queue and an event loop that also completes deferred
//!   blocking operations on worker threads
//!
//! # Overview
//!
//! - [`Budget`] / [`Quantum`] - How long one run may last
//! - [`Schedule`] - Where preempted continuations go
//! - [`ReadyQueue`] - Shared FIFO of runnable continuations
//! - [`EventLoop`] - Reactor draining ready work and completions
//!
//! # Examples
//!
//! ```
//! use async_runtime::{Budget, EventLoop, Schedule};
//! use core_types::Value;
//!
//! let event_loop = EventLoop::with_budget(Budget::Counter(100));
//! let mut quantum = event_loop.budget().start();
//! assert!(quantum.tick());
//!
//! event_loop.add(1u32, Value::Nil);
//! assert_eq!(event_loop.run(|_, _| {}), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod budget;
pub mod event_loop;
pub mod ready_queue;
pub mod schedule;

// Re-export main types at crate root
pub use budget::{Budget, Deadline, Quantum};
pub use event_loop::EventLoop;
pub use ready_queue::ReadyQueue;
pub use schedule::Schedule;
