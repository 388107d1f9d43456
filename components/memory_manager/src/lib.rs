//! Memory Manager - frame buffer pooling
//!
//! This component provides:
//! - A fixed set of reusable frame buffers of one size class
//! - Lock-free acquire and release over a tagged free-list head
//! - Generation-checked leases so a stale handle is rejected, never aliased
//! - Promotion of a leased buffer to heap lifetime for escaping frames

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame_pool;

pub use frame_pool::{FramePool, Lease, PoolError, PoolStats};

/// Default number of pooled frame buffers
pub const DEFAULT_POOL_SLOTS: usize = 256;

/// Default size class in values per buffer
pub const DEFAULT_SIZE_CLASS: usize = 32;
