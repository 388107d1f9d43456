//! Runtime configuration
//!
//! Every field has a default, so a partial JSON document is a valid
//! configuration.

use std::time::Duration;

use async_runtime::{Budget, Deadline};
use core_types::DEFAULT_MAX_TRACE_DEPTH;
use memory_manager::{DEFAULT_POOL_SLOTS, DEFAULT_SIZE_CLASS};
use serde::{Deserialize, Serialize};

use crate::method_cache::POLYMORPHIC_WIDTH;

/// How a fiber is preempted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Preemption {
    /// Run to completion
    #[default]
    None,
    /// Yield after `quantum` instructions
    Counter {
        /// Instructions per run
        quantum: u64,
    },
    /// Yield when a ticker raises the deadline flag every `deadline_ms`
    Deadline {
        /// Ticker period in milliseconds
        deadline_ms: u64,
    },
}

/// Configuration for a [`Vm`](crate::Vm)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Preemption policy handed to every fiber run
    pub preemption: Preemption,
    /// Number of pooled frame buffers
    pub frame_pool_slots: usize,
    /// Largest frame size served from the pool
    pub frame_size_class: usize,
    /// Trace entries kept per error
    pub max_trace_depth: usize,
    /// Entries per polymorphic inline cache (at most 4)
    pub inline_cache_width: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preemption: Preemption::None,
            frame_pool_slots: DEFAULT_POOL_SLOTS,
            frame_size_class: DEFAULT_SIZE_CLASS,
            max_trace_depth: DEFAULT_MAX_TRACE_DEPTH,
            inline_cache_width: POLYMORPHIC_WIDTH,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Inline cache width clamped to what a call site can hold
    pub fn cache_width(&self) -> usize {
        self.inline_cache_width.clamp(1, POLYMORPHIC_WIDTH)
    }

    /// Build the scheduler budget for this policy.
    ///
    /// A deadline policy spawns a ticker thread that lives as long as the
    /// returned budget.
    pub fn budget(&self) -> Budget {
        match self.preemption {
            Preemption::None => Budget::Unlimited,
            Preemption::Counter { quantum } => Budget::Counter(quantum),
            Preemption::Deadline { deadline_ms } => {
                Budget::Deadline(Deadline::arm(Duration::from_millis(deadline_ms.max(1))))
            }
        }
    }
}
