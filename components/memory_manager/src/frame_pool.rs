//! Frame buffer pool
//!
//! Interpreter frames draw their slot buffers (locals plus evaluation stack)
//! from a fixed set of reusable slots of one size class. Free slots form a
//! lock-free Treiber stack over slot indices:
//!
//! - The head packs `(tag << 32) | (index + 1)`; an index field of zero means
//!   empty. The tag is bumped on every successful update so that a pop racing
//!   with a pop-push of the same index fails its compare-and-swap.
//! - Each slot carries a generation counter. A [`Lease`] records the
//!   generation it was issued at and releasing bumps it, so a stale or
//!   repeated release is rejected instead of recycling a buffer twice.
//!
//! Requests larger than the size class, or arriving while every slot is
//! leased, get an unpooled buffer (a *fallback*) that is simply dropped when
//! the frame ends.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use core_types::Value;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, trace};

const EMPTY: u32 = 0;

fn pack(tag: u32, link: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(link)
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// Errors reported by [`FramePool`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The lease was already released or promoted
    #[error("stale lease for slot {index} (generation {generation})")]
    StaleLease {
        /// Slot index
        index: u32,
        /// Generation recorded in the lease
        generation: u32,
    },
    /// The lease names a slot this pool does not have
    #[error("slot {index} does not belong to this pool")]
    UnknownSlot {
        /// Slot index
        index: u32,
    },
}

/// Proof of ownership of one pooled slot
///
/// Returned by [`FramePool::acquire`] and consumed by
/// [`FramePool::release`] or [`FramePool::promote`]. Copies of a lease are
/// only good for one of those calls; the rest fail with
/// [`PoolError::StaleLease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    index: u32,
    generation: u32,
}

impl Lease {
    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when the lease was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct PoolSlot {
    next: AtomicU32,
    generation: AtomicU32,
    // Parked buffer while the slot is free. Only the lease holder touches it,
    // so the lock is never contended.
    buffer: Mutex<Vec<Value>>,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total pooled slots
    pub capacity: usize,
    /// Slots currently free
    pub available: usize,
    /// Slots currently leased
    pub in_use: usize,
    /// Requests served without a pooled slot
    pub fallbacks: u64,
    /// Leases converted to heap lifetime
    pub promotions: u64,
}

/// Lock-free pool of frame buffers of one size class
///
/// # Examples
///
/// ```
/// use memory_manager::FramePool;
///
/// let pool = FramePool::new(4, 16);
/// let (lease, buffer) = pool.acquire(8);
/// assert!(lease.is_some());
/// assert!(buffer.capacity() >= 16);
/// assert_eq!(pool.stats().in_use, 1);
///
/// pool.release(lease.unwrap(), buffer).unwrap();
/// assert_eq!(pool.stats().available, 4);
/// ```
pub struct FramePool {
    head: CachePadded<AtomicU64>,
    slots: Box<[PoolSlot]>,
    size_class: usize,
    available: AtomicUsize,
    fallbacks: AtomicU64,
    promotions: AtomicU64,
}

impl FramePool {
    /// Create a pool of `slots` buffers, each able to hold `size_class` values
    pub fn new(slots: usize, size_class: usize) -> Self {
        let count = slots.min(u32::MAX as usize - 1);
        let slots: Box<[PoolSlot]> = (0..count)
            .map(|i| PoolSlot {
                // Thread every slot onto the initial free list.
                next: AtomicU32::new(if i + 1 < count { i as u32 + 2 } else { EMPTY }),
                generation: AtomicU32::new(0),
                buffer: Mutex::new(Vec::with_capacity(size_class)),
            })
            .collect();
        let first = if count > 0 { 1 } else { EMPTY };
        Self {
            head: CachePadded::new(AtomicU64::new(pack(0, first))),
            slots,
            size_class,
            available: AtomicUsize::new(count),
            fallbacks: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
        }
    }

    /// Values a pooled buffer holds without reallocating
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    /// Take a buffer able to hold `capacity` values.
    ///
    /// Returns the lease for pooled buffers and `None` for fallbacks. The
    /// buffer is always empty.
    pub fn acquire(&self, capacity: usize) -> (Option<Lease>, Vec<Value>) {
        if capacity > self.size_class {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "memory_manager::pool",
                capacity,
                size_class = self.size_class,
                "oversized frame, using unpooled buffer"
            );
            return (None, Vec::with_capacity(capacity));
        }
        match self.pop() {
            Some(index) => {
                let slot = &self.slots[index as usize];
                let generation = slot.generation.load(Ordering::Acquire);
                let buffer = std::mem::take(&mut *slot.buffer.lock());
                (Some(Lease { index, generation }), buffer)
            }
            None => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!(target: "memory_manager::pool", "frame pool exhausted, using unpooled buffer");
                (None, Vec::with_capacity(self.size_class))
            }
        }
    }

    /// Return a pooled buffer.
    ///
    /// The buffer is cleared and parked in the slot; the slot becomes
    /// available to the next [`acquire`](Self::acquire).
    pub fn release(&self, lease: Lease, mut buffer: Vec<Value>) -> Result<(), PoolError> {
        let slot = self.retire(lease)?;
        buffer.clear();
        *slot.buffer.lock() = buffer;
        self.push(lease.index);
        Ok(())
    }

    /// Give a leased slot back while the caller keeps its buffer.
    ///
    /// Used when a frame escapes (for example as a suspended generator) and
    /// its buffer must outlive the call. The slot is refilled with a fresh
    /// buffer.
    pub fn promote(&self, lease: Lease) -> Result<(), PoolError> {
        let slot = self.retire(lease)?;
        *slot.buffer.lock() = Vec::with_capacity(self.size_class);
        self.promotions.fetch_add(1, Ordering::Relaxed);
        trace!(target: "memory_manager::pool", index = lease.index, "promoted frame buffer");
        self.push(lease.index);
        Ok(())
    }

    /// Returns true if `lease` is still the live lease of its slot
    pub fn is_live(&self, lease: Lease) -> bool {
        self.slots
            .get(lease.index as usize)
            .is_some_and(|slot| slot.generation.load(Ordering::Acquire) == lease.generation)
            && !self.is_free(lease.index)
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        let available = self.available.load(Ordering::Acquire);
        PoolStats {
            capacity: self.slots.len(),
            available,
            in_use: self.slots.len().saturating_sub(available),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }

    // Validates the lease and invalidates every copy of it.
    fn retire(&self, lease: Lease) -> Result<&PoolSlot, PoolError> {
        let slot = self
            .slots
            .get(lease.index as usize)
            .ok_or(PoolError::UnknownSlot { index: lease.index })?;
        slot.generation
            .compare_exchange(
                lease.generation,
                lease.generation.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| PoolError::StaleLease {
                index: lease.index,
                generation: lease.generation,
            })?;
        Ok(slot)
    }

    fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, link) = unpack(head);
            if link == EMPTY {
                return None;
            }
            let index = link - 1;
            let next = self.slots[index as usize].next.load(Ordering::Acquire);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_sub(1, Ordering::AcqRel);
                    return Some(index);
                }
                Err(current) => head = current,
            }
        }
    }

    fn push(&self, index: u32) {
        let slot = &self.slots[index as usize];
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, link) = unpack(head);
            slot.next.store(link, Ordering::Release);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(current) => head = current,
            }
        }
    }

    // Walks the free list; only used by `is_live`, which is a diagnostic.
    fn is_free(&self, index: u32) -> bool {
        let (_, mut link) = unpack(self.head.load(Ordering::Acquire));
        let mut steps = 0;
        while link != EMPTY && steps <= self.slots.len() {
            if link - 1 == index {
                return true;
            }
            link = self.slots[(link - 1) as usize].next.load(Ordering::Acquire);
            steps += 1;
        }
        false
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("size_class", &self.size_class)
            .field("stats", &self.stats())
            .finish()
    }
}
