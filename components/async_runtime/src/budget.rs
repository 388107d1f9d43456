//! Preemption budgets.
//!
//! A [`Budget`] describes how long a fiber may run before it hands itself
//! back to its schedule. Each run starts a [`Quantum`] from the budget and
//! ticks it once per instruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::trace;

/// How long a fiber may run before yielding.
#[derive(Debug, Clone, Default)]
pub enum Budget {
    /// Never preempt.
    #[default]
    Unlimited,
    /// Yield after this many instructions.
    Counter(u64),
    /// Yield once the deadline fires after the quantum starts.
    Deadline(Deadline),
}

impl Budget {
    /// Start a quantum for one run.
    ///
    /// Every quantum lets at least one instruction through so a resumed
    /// fiber always makes progress.
    pub fn start(&self) -> Quantum {
        let kind = match self {
            Budget::Unlimited => QuantumKind::Unlimited,
            Budget::Counter(n) => QuantumKind::Counter((*n).max(1)),
            Budget::Deadline(deadline) => QuantumKind::Deadline {
                fired: Arc::clone(&deadline.fired),
                started: deadline.expirations(),
                progressed: false,
            },
        };
        Quantum { kind }
    }
}

/// A wall-clock preemption source.
///
/// The deadline counts how often it has fired. A quantum remembers the
/// count it started at and expires once the count moves, so quanta on
/// several threads sharing one deadline never reset each other. Cloned
/// handles share the count. [`Deadline::arm`] attaches a ticker thread
/// that fires every `period`; the ticker exits once every handle has been
/// dropped.
#[derive(Debug, Clone)]
pub struct Deadline {
    fired: Arc<AtomicU64>,
}

impl Deadline {
    /// A deadline that only fires through [`Deadline::expire`].
    pub fn manual() -> Self {
        Self {
            fired: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A deadline fired by a ticker thread every `period`.
    pub fn arm(period: Duration) -> Self {
        let deadline = Self::manual();
        let fired: Weak<AtomicU64> = Arc::downgrade(&deadline.fired);
        std::thread::spawn(move || loop {
            std::thread::sleep(period);
            match fired.upgrade() {
                Some(fired) => {
                    fired.fetch_add(1, Ordering::Release);
                }
                None => {
                    trace!(target: "async_runtime::budget", "deadline ticker stopped");
                    break;
                }
            }
        });
        deadline
    }

    /// Fire now, expiring every quantum started before this call.
    pub fn expire(&self) {
        self.fired.fetch_add(1, Ordering::Release);
    }

    /// Number of times the deadline has fired.
    pub fn expirations(&self) -> u64 {
        self.fired.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
enum QuantumKind {
    Unlimited,
    Counter(u64),
    Deadline {
        fired: Arc<AtomicU64>,
        started: u64,
        progressed: bool,
    },
}

/// The live budget of a single run.
#[derive(Debug)]
pub struct Quantum {
    kind: QuantumKind,
}

impl Quantum {
    /// A quantum that never expires.
    pub fn unlimited() -> Self {
        Self {
            kind: QuantumKind::Unlimited,
        }
    }

    /// Account for one instruction. Returns false once the quantum is spent.
    #[inline]
    pub fn tick(&mut self) -> bool {
        match &mut self.kind {
            QuantumKind::Unlimited => true,
            QuantumKind::Counter(remaining) => {
                if *remaining == 0 {
                    return false;
                }
                *remaining -= 1;
                true
            }
            QuantumKind::Deadline {
                fired,
                started,
                progressed,
            } => {
                if !*progressed {
                    *progressed = true;
                    return true;
                }
                fired.load(Ordering::Relaxed) == *started
            }
        }
    }

    /// Instructions left in a counter quantum.
    pub fn remaining(&self) -> Option<u64> {
        match self.kind {
            QuantumKind::Counter(remaining) => Some(remaining),
            _ => None,
        }
    }
}
