//! Method resolution caches
//!
//! Two layers sit in front of a full method search:
//!
//! - each [`MethodScope`](crate::methods::MethodScope) keeps a table of
//!   [`CacheEntry`]s keyed by method name and argument type tags;
//! - each `CallMethod` site carries an [`InlineCache`] that transitions
//!   through mono/poly/megamorphic states as it sees more type tuples.
//!
//! Entries are shared between both layers. Inserting a definition marks
//! every entry that consulted the method as untrusted, which both layers
//! observe on their next lookup. Reading a trusted entry takes no lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use core_types::{mix64, TypeTag, Value};
use parking_lot::Mutex;

use crate::methods::Definition;
use crate::published::Published;

/// Maximum number of entries a polymorphic inline cache holds
pub const POLYMORPHIC_WIDTH: usize = 4;

/// Table key for a method name and argument type tuple (FNV-1a, then mixed)
pub fn cache_key(method: &str, types: &[TypeTag]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in method.bytes().chain([0xff]).chain(types.iter().map(|t| *t as u8)) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    mix64(hash)
}

/// A memoized resolution for one scope, method and type tuple
#[derive(Debug)]
pub struct CacheEntry {
    scope: u64,
    method: Arc<str>,
    types: Box<[TypeTag]>,
    // Serial of the trusted definition; zero when untrusted.
    resolved: AtomicU64,
    definition: Published<Option<Arc<Definition>>>,
    // Set once every method the entry consults knows about it.
    registered: AtomicBool,
}

impl CacheEntry {
    pub(crate) fn new(scope: u64, method: Arc<str>, types: Box<[TypeTag]>) -> Self {
        Self {
            scope,
            method,
            types,
            resolved: AtomicU64::new(0),
            definition: Published::new(None),
            registered: AtomicBool::new(false),
        }
    }

    /// Returns true if this entry describes `method` called with `types`
    /// in scope `scope`
    pub fn matches(&self, scope: u64, method: &str, types: &[TypeTag]) -> bool {
        self.scope == scope && &*self.method == method && &*self.types == types
    }

    fn matches_args(&self, scope: u64, method: &str, args: &[Value]) -> bool {
        self.scope == scope
            && &*self.method == method
            && self.types.len() == args.len()
            && self
                .types
                .iter()
                .zip(args)
                .all(|(tag, arg)| *tag == arg.type_tag())
    }

    /// Argument type tags
    pub fn types(&self) -> &[TypeTag] {
        &self.types
    }

    /// The cached definition, if the entry is still trusted
    pub fn trusted(&self) -> Option<Arc<Definition>> {
        let serial = self.resolved.load(Ordering::Acquire);
        if serial == 0 {
            return None;
        }
        self.definition.read(|definition| {
            definition
                .as_ref()
                .filter(|definition| definition.serial() == serial)
                .cloned()
        })
    }

    /// Returns true if the entry may be used without re-resolving
    pub fn is_trusted(&self) -> bool {
        self.resolved.load(Ordering::Acquire) != 0
    }

    // Racing publishers can leave the serial naming a definition other than
    // the stored one; `trusted` then reports a miss.
    pub(crate) fn publish(&self, definition: &Arc<Definition>) {
        self.definition.replace(Some(Arc::clone(definition)));
        self.resolved.store(definition.serial(), Ordering::SeqCst);
    }

    pub(crate) fn invalidate(&self) {
        self.resolved.store(0, Ordering::SeqCst);
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Returns true once invalidation can reach this entry
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

/// Per-site cache state
#[derive(Debug, Default)]
pub enum CacheState {
    /// Nothing cached yet
    #[default]
    Uninitialized,
    /// One type tuple seen
    Monomorphic(Arc<CacheEntry>),
    /// Several type tuples seen
    Polymorphic(ArrayVec<Arc<CacheEntry>, POLYMORPHIC_WIDTH>),
    /// Too many type tuples; the site always goes to the scope table
    Megamorphic,
}

/// Inline cache attached to a `CallMethod` site
///
/// Sites may be shared by fibers on several threads. A site that is busy
/// is simply skipped rather than waited on.
#[derive(Debug, Default)]
pub struct InlineCache {
    state: Mutex<CacheState>,
}

impl InlineCache {
    /// Create an uninitialized cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a trusted resolution for `args`
    pub fn lookup(&self, scope: u64, method: &str, args: &[Value]) -> Option<Arc<Definition>> {
        let state = self.state.try_lock()?;
        let hit = |entry: &Arc<CacheEntry>| {
            if entry.matches_args(scope, method, args) {
                entry.trusted()
            } else {
                None
            }
        };
        match &*state {
            CacheState::Uninitialized | CacheState::Megamorphic => None,
            CacheState::Monomorphic(entry) => hit(entry),
            CacheState::Polymorphic(entries) => entries.iter().find_map(hit),
        }
    }

    /// Record `entry`, widening the cache state as needed.
    ///
    /// `width` caps the polymorphic state below [`POLYMORPHIC_WIDTH`].
    pub fn record(&self, entry: Arc<CacheEntry>, width: usize) {
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        let width = width.clamp(1, POLYMORPHIC_WIDTH);
        let same = |cached: &Arc<CacheEntry>| Arc::ptr_eq(cached, &entry);

        match &mut *state {
            CacheState::Uninitialized => {
                *state = CacheState::Monomorphic(entry);
            }
            CacheState::Monomorphic(cached) => {
                if same(cached) {
                    return;
                }
                if cached.matches(entry.scope, &entry.method, &entry.types) {
                    // Replaced by a fresh entry for the same tuple.
                    *cached = entry;
                } else if width == 1 {
                    *state = CacheState::Megamorphic;
                } else {
                    let mut entries = ArrayVec::new();
                    entries.push(Arc::clone(cached));
                    entries.push(entry);
                    *state = CacheState::Polymorphic(entries);
                }
            }
            CacheState::Polymorphic(entries) => {
                if entries.iter().any(same) {
                    return;
                }
                if entries.len() < width {
                    entries.push(entry);
                } else {
                    *state = CacheState::Megamorphic;
                }
            }
            CacheState::Megamorphic => {}
        }
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            CacheState::Uninitialized | CacheState::Megamorphic => 0,
            CacheState::Monomorphic(_) => 1,
            CacheState::Polymorphic(entries) => entries.len(),
        }
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the site has given up on caching
    pub fn is_megamorphic(&self) -> bool {
        matches!(*self.state.lock(), CacheState::Megamorphic)
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a cache
    pub hits: u64,
    /// Lookups that required a full search
    pub misses: u64,
    /// Full searches that found a definition
    pub resolutions: u64,
    /// Entries invalidated by definition inserts
    pub invalidations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    resolutions: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resolved(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn invalidated(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
