//! The contract between the interpreter and whatever drives it.

use core_types::Value;

use crate::budget::Budget;

/// Where a preempted or parked continuation goes.
///
/// The interpreter asks for a [`Budget`] before each run. When the budget
/// runs out it stops dispatch, records its resume point and calls
/// [`Schedule::add`] with itself and the value it must be resumed with. The
/// implementation decides when that happens: immediately from a ready
/// queue, or later from an I/O completion.
pub trait Schedule<C>: Send + Sync {
    /// Budget for the next run.
    fn budget(&self) -> Budget;

    /// Take ownership of a continuation that must run again later.
    fn add(&self, continuation: C, pending: Value);
}
