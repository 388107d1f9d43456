//! Debugger hook
//!
//! A [`Debugger`] attached to an execution context is consulted before each
//! instruction. It is invoked when execution reaches a new source line or a
//! line whose breakpoint bit is set. Breakpoint sets are fetched per frame
//! and cached until the debugger's revision counter moves.

use core_types::Value;

use crate::frame::Frame;

/// Debugger callbacks
pub trait Debugger: Send + Sync {
    /// Called before the instruction at the frame's current line executes.
    /// `value` is the top of the evaluation stack, or nil when it is empty.
    fn run(&self, frame: &Frame, value: &Value);

    /// Breakpoint lines for `source`, sized for lines `0..=max_line`
    fn breakpoints(&self, source: &str, max_line: u32) -> BitSet;

    /// Bumped whenever any breakpoint set changes
    fn revision(&self) -> u64;
}

/// Growable bit set indexed by line number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set able to hold `0..len` without growing
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    /// Set bit `index`, growing as needed
    pub fn insert(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    /// Clear bit `index`
    pub fn remove(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1u64 << (index % 64));
        }
    }

    /// Returns true if bit `index` is set
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1u64 << (index % 64)) != 0)
    }

    /// Returns true if no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| w * 64 + bit)
        })
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

// Per-frame debugger cache.
#[derive(Debug)]
pub(crate) struct DebugState {
    revision: Option<u64>,
    breakpoints: BitSet,
    last_line: Option<u32>,
}

impl DebugState {
    pub(crate) fn new() -> Self {
        Self {
            revision: None,
            breakpoints: BitSet::new(),
            last_line: None,
        }
    }

    /// Refresh the cached breakpoints if stale and decide whether the hook
    /// fires for `line`.
    pub(crate) fn should_stop(
        &mut self,
        debugger: &dyn Debugger,
        source: &str,
        max_line: u32,
        line: u32,
    ) -> bool {
        let revision = debugger.revision();
        if self.revision != Some(revision) {
            self.breakpoints = debugger.breakpoints(source, max_line);
            self.revision = Some(revision);
        }
        let moved = self.last_line != Some(line);
        self.last_line = Some(line);
        moved || self.breakpoints.contains(line as usize)
    }
}
