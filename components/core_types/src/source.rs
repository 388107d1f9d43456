//! Source locations recorded in error traces.

use std::sync::Arc;

/// One (source-name, line) entry of an error trace.
///
/// `frame` identifies the activation that recorded the entry so that a frame
/// traversed twice by the same error (catch followed by re-raise) is only
/// recorded once.
///
/// # Examples
///
/// ```
/// use core_types::TraceEntry;
///
/// let entry = TraceEntry::new("main.src", 12, 1);
/// assert_eq!(entry.line, 12);
/// assert_eq!(entry.to_string(), "main.src:12");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Name of the source the instruction was compiled from
    pub source: Arc<str>,
    /// Line of the instruction that was executing
    pub line: u32,
    /// Identity of the frame that recorded this entry
    pub frame: u64,
}

impl TraceEntry {
    /// Creates a new trace entry.
    pub fn new(source: impl Into<Arc<str>>, line: u32, frame: u64) -> Self {
        Self {
            source: source.into(),
            line,
            frame,
        }
    }
}

impl std::fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}
