//! Error values and trace bookkeeping.
//!
//! Program errors are ordinary data: primitives return a [`Value::Error`]
//! carrying an [`ErrorValue`], and the interpreter redirects control to the
//! active handler when it observes one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::{TraceEntry, Value};

/// Default bound on the number of trace entries kept per error.
pub const DEFAULT_MAX_TRACE_DEPTH: usize = 64;

/// Built-in error kinds.
pub mod kinds {
    /// Operation applied to a value of the wrong type
    pub const TYPE_ERROR: &str = "TypeError";
    /// Wrong number of arguments
    pub const ARITY_ERROR: &str = "ArityError";
    /// Unknown global name
    pub const NAME_ERROR: &str = "NameError";
    /// No method definition accepts the argument types
    pub const NO_METHOD_ERROR: &str = "NoMethodError";
    /// Read of a forward reference before it was bound
    pub const UNBOUND_ERROR: &str = "UnboundError";
    /// Malformed bytecode or a broken runtime invariant
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// User-raised value that is not itself an error
    pub const RAISED: &str = "Error";
}

/// An error: kind tag, message, optional payload and bounded trace.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorValue, TraceEntry};
///
/// let mut err = ErrorValue::new("RangeError", "index out of range").with_max_depth(2);
/// err.push_trace(TraceEntry::new("a.src", 1, 1));
/// err.push_trace(TraceEntry::new("a.src", 2, 2));
/// err.push_trace(TraceEntry::new("a.src", 3, 3));
///
/// // Oldest entries are dropped once the bound is exceeded.
/// let lines: Vec<u32> = err.trace().map(|e| e.line).collect();
/// assert_eq!(lines, vec![2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct ErrorValue {
    kind: Arc<str>,
    message: String,
    payload: Value,
    trace: VecDeque<TraceEntry>,
    max_depth: usize,
}

impl ErrorValue {
    /// Creates an error with no payload and an empty trace.
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: Value::Nil,
            trace: VecDeque::new(),
            max_depth: DEFAULT_MAX_TRACE_DEPTH,
        }
    }

    /// Wraps a raised value that is not itself an error.
    pub fn raised(payload: Value) -> Self {
        let message = payload.to_string();
        Self::new(kinds::RAISED, message).with_payload(payload)
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the trace bound, trimming existing entries if needed.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        while self.trace.len() > self.max_depth {
            self.trace.pop_front();
        }
        self
    }

    /// Short category string.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Value the error was raised with, nil for primitive errors.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Trace entries, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &TraceEntry> + '_ {
        self.trace.iter()
    }

    /// Number of trace entries currently kept.
    pub fn trace_len(&self) -> usize {
        self.trace.len()
    }

    /// Appends a trace entry.
    ///
    /// Returns false without recording anything when the newest entry already
    /// belongs to the same frame.
    pub fn push_trace(&mut self, entry: TraceEntry) -> bool {
        if self
            .trace
            .back()
            .is_some_and(|last| last.frame == entry.frame)
        {
            return false;
        }
        if self.trace.len() == self.max_depth {
            self.trace.pop_front();
        }
        self.trace.push_back(entry);
        true
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for entry in self.trace.iter().rev() {
            write!(f, "\n  at {}", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorValue {}
