//! Multi-argument method dispatch
//!
//! A method is a named, append-only list of [`Definition`]s, each declaring
//! the type tags of its parameters. A call picks the applicable definition
//! with the highest score, where more specific parameter tags and an exact
//! arity match score higher. Ties prefer non-variadic definitions, then the
//! earliest one.
//!
//! Methods live in a [`MethodScope`]. Scopes form a parent-linked chain so
//! a sandboxed context can add or shadow definitions without touching its
//! parent: the child's best candidate wins unless a parent offers a
//! strictly better-scored one.
//!
//! Resolutions are memoized per scope in a table of [`CacheEntry`]s and per
//! call site in an [`InlineCache`]. Every entry is registered with each
//! method it consulted, and inserting a definition invalidates exactly
//! those entries.
//!
//! Lookups never take a lock. Definition lists, registration lists and
//! scope tables are copy-on-write values replaced with compare-and-swap;
//! a method's epoch is bumped after each insert so a resolution that raced
//! with it is published and then immediately withdrawn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use core_types::{kinds, IdTable, NameTable, TypeTag, Value};
use tracing::debug;

use crate::method_cache::{cache_key, CacheCounters, CacheEntry, CacheStats, InlineCache};
use crate::published::Published;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Bonus for an argument count equal to the fixed parameter count
const EXACT_ARITY: u32 = 1;

/// One definition of a method
#[derive(Debug, Clone)]
pub struct Definition {
    params: Box<[TypeTag]>,
    variadic: bool,
    callback: Value,
    serial: u64,
}

impl Definition {
    /// A definition taking exactly `params` and invoking `callback`
    pub fn new(params: impl Into<Box<[TypeTag]>>, callback: Value) -> Self {
        Self {
            params: params.into(),
            variadic: false,
            callback,
            serial: 0,
        }
    }

    /// Accept any number of extra arguments after the fixed ones
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Declared parameter tags
    pub fn params(&self) -> &[TypeTag] {
        &self.params
    }

    /// Returns true if surplus arguments are accepted
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// The function invoked when this definition is selected
    pub fn callback(&self) -> &Value {
        &self.callback
    }

    /// Unique, non-zero once inserted into a method
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Score against argument tags; zero when not applicable.
    pub fn score(&self, types: &[TypeTag]) -> u32 {
        let fixed = self.params.len();
        if types.len() < fixed || (!self.variadic && types.len() != fixed) {
            return 0;
        }
        let mut score = 1;
        for (arg, param) in types.iter().zip(self.params.iter()) {
            if !arg.is_a(*param) {
                return 0;
            }
            score += 1 + param.rank();
        }
        if types.len() == fixed {
            score += EXACT_ARITY;
        }
        score
    }

    fn same_signature(&self, other: &Definition) -> bool {
        self.variadic == other.variadic && self.params == other.params
    }
}

/// A named list of definitions
pub struct Method {
    name: Arc<str>,
    definitions: Published<Vec<Arc<Definition>>>,
    epoch: AtomicU64,
    entries: Published<Vec<Weak<CacheEntry>>>,
}

impl Method {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            definitions: Published::new(Vec::new()),
            epoch: AtomicU64::new(0),
            entries: Published::new(Vec::new()),
        }
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the definitions in insertion order
    pub fn definitions(&self) -> Vec<Arc<Definition>> {
        self.definitions.read(Vec::clone)
    }

    /// Best applicable definition and its score
    pub fn best(&self, types: &[TypeTag]) -> Option<(Arc<Definition>, u32)> {
        self.definitions.read(|definitions| {
            let mut best: Option<(&Arc<Definition>, u32)> = None;
            for definition in definitions.iter() {
                let score = definition.score(types);
                if score == 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((current, best_score)) => {
                        score > best_score
                            || (score == best_score && current.variadic && !definition.variadic)
                    }
                };
                if better {
                    best = Some((definition, score));
                }
            }
            best.map(|(definition, score)| (Arc::clone(definition), score))
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, entry: &Arc<CacheEntry>) {
        self.entries.update(|entries| {
            let mut next = Vec::with_capacity(entries.len() + 1);
            next.extend(entries.iter().filter(|e| e.strong_count() > 0).cloned());
            next.push(Arc::downgrade(entry));
            (Some(next), ())
        });
    }

    // Adds or replaces a definition and invalidates every entry that
    // consulted this method. Returns the number of entries invalidated.
    fn insert(&self, mut definition: Definition) -> (Arc<Definition>, usize) {
        definition.serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let definition = Arc::new(definition);
        self.definitions.update(|definitions| {
            let mut next = definitions.clone();
            match next
                .iter_mut()
                .find(|existing| existing.same_signature(&definition))
            {
                Some(existing) => *existing = Arc::clone(&definition),
                None => next.push(Arc::clone(&definition)),
            }
            (Some(next), ())
        });
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let invalidated = self.entries.read(|entries| {
            let mut invalidated = 0;
            for entry in entries.iter().filter_map(Weak::upgrade) {
                entry.invalidate();
                invalidated += 1;
            }
            invalidated
        });
        (definition, invalidated)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("definitions", &self.definitions.read(Vec::len))
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// A layer of method definitions with its resolution cache
pub struct MethodScope {
    id: u64,
    parent: Option<Arc<MethodScope>>,
    methods: Published<NameTable<Arc<Method>>>,
    cache: Published<IdTable<Arc<CacheEntry>>>,
    counters: CacheCounters,
}

impl MethodScope {
    /// A root scope
    pub fn new() -> Arc<Self> {
        Self::with_parent(None)
    }

    /// A scope layered over `parent`
    pub fn child(parent: &Arc<MethodScope>) -> Arc<Self> {
        Self::with_parent(Some(Arc::clone(parent)))
    }

    fn with_parent(parent: Option<Arc<MethodScope>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            parent,
            methods: Published::new(NameTable::new()),
            cache: Published::new(IdTable::new()),
            counters: CacheCounters::default(),
        })
    }

    /// Unique scope id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enclosing scope, if any
    pub fn parent(&self) -> Option<&Arc<MethodScope>> {
        self.parent.as_ref()
    }

    /// Add a definition for `name` in this scope.
    ///
    /// A definition with the same parameter tags and variadic flag replaces
    /// the existing one.
    pub fn define(&self, name: &str, definition: Definition) -> Arc<Definition> {
        let method = self.method_or_insert(name);
        let (definition, invalidated) = method.insert(definition);
        self.counters.invalidated(invalidated as u64);
        debug!(
            target: "interpreter::methods",
            method = name,
            scope = self.id,
            invalidated,
            "method defined"
        );
        definition
    }

    /// The method called `name` in this scope only
    pub fn method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.read(|methods| methods.get(name).cloned())
    }

    fn method_or_insert(&self, name: &str) -> Arc<Method> {
        if let Some(method) = self.method(name) {
            return method;
        }
        let fresh = Arc::new(Method::new(name.into()));
        self.methods.update(|methods| match methods.get(name) {
            Some(existing) => (None, Arc::clone(existing)),
            None => {
                let mut next = methods.clone();
                next.insert(name, Arc::clone(&fresh));
                (Some(next), Arc::clone(&fresh))
            }
        })
    }

    // This scope's method and every ancestor's, innermost first.
    fn chain(&self, name: &str) -> Vec<Arc<Method>> {
        let mut chain = vec![self.method_or_insert(name)];
        let mut scope = self.parent.as_ref();
        while let Some(current) = scope {
            chain.push(current.method_or_insert(name));
            scope = current.parent.as_ref();
        }
        chain
    }

    /// Resolve by full search, bypassing every cache
    pub fn resolve_uncached(&self, name: &str, types: &[TypeTag]) -> Option<Arc<Definition>> {
        let mut chain = Vec::new();
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(method) = current.method(name) {
                chain.push(method);
            }
            scope = current.parent.as_deref();
        }
        resolve_in(&chain, types)
    }

    /// Resolve `name` for `args`, consulting the call site's inline cache
    /// and this scope's cache table first.
    ///
    /// A miss with no applicable definition yields a `NoMethodError` value
    /// naming the argument types.
    pub fn lookup(
        &self,
        name: &str,
        args: &[Value],
        site: Option<&InlineCache>,
        width: usize,
    ) -> Result<Arc<Definition>, Value> {
        if let Some(definition) = site.and_then(|site| site.lookup(self.id, name, args)) {
            self.counters.hit();
            return Ok(definition);
        }

        let types: Box<[TypeTag]> = args.iter().map(Value::type_tag).collect();
        let key = cache_key(name, &types);
        let cached = self.cache.read(|cache| cache.get(key).cloned());
        if let Some(entry) = &cached {
            if entry.matches(self.id, name, &types) {
                if let Some(definition) = entry.trusted() {
                    self.counters.hit();
                    if let Some(site) = site {
                        site.record(Arc::clone(entry), width);
                    }
                    return Ok(definition);
                }
            }
        }

        self.counters.miss();
        let chain = self.chain(name);
        let entry = match cached {
            Some(entry) => entry,
            None => self.entry_for(key, name, &types, &chain),
        };
        // Another type tuple hashed to the same key, or the entry's creator
        // has not finished registering it: answer without caching.
        if !entry.matches(self.id, name, &types) || !entry.is_registered() {
            let definition = resolve_in(&chain, &types).ok_or_else(|| no_method(name, &types))?;
            self.counters.resolved();
            return Ok(definition);
        }

        let epochs: Vec<u64> = chain.iter().map(|method| method.epoch()).collect();
        let definition = resolve_in(&chain, &types).ok_or_else(|| no_method(name, &types))?;
        self.counters.resolved();

        entry.publish(&definition);
        let stale = chain
            .iter()
            .zip(&epochs)
            .any(|(method, epoch)| method.epoch() != *epoch);
        if stale {
            entry.invalidate();
        } else if let Some(site) = site {
            site.record(entry, width);
        }
        Ok(definition)
    }

    // The table's entry for `key`, creating and registering one if absent.
    fn entry_for(
        &self,
        key: u64,
        name: &str,
        types: &[TypeTag],
        chain: &[Arc<Method>],
    ) -> Arc<CacheEntry> {
        let fresh = Arc::new(CacheEntry::new(self.id, name.into(), types.into()));
        let entry = self.cache.update(|cache| match cache.get(key) {
            Some(existing) => (None, Arc::clone(existing)),
            None => {
                let mut next = cache.clone();
                next.insert(key, Arc::clone(&fresh));
                (Some(next), Arc::clone(&fresh))
            }
        });
        if Arc::ptr_eq(&entry, &fresh) {
            for method in chain {
                method.register(&entry);
            }
            entry.mark_registered();
        }
        entry
    }

    /// Cache counters for this scope
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for MethodScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodScope")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("methods", &self.methods.read(NameTable::len))
            .field("stats", &self.stats())
            .finish()
    }
}

// Innermost candidate wins unless an outer scope scores strictly higher.
fn resolve_in(chain: &[Arc<Method>], types: &[TypeTag]) -> Option<Arc<Definition>> {
    let mut best: Option<(Arc<Definition>, u32)> = None;
    for method in chain {
        if let Some((definition, score)) = method.best(types) {
            if best.as_ref().map_or(true, |(_, current)| score > *current) {
                best = Some((definition, score));
            }
        }
    }
    best.map(|(definition, _)| definition)
}

fn no_method(name: &str, types: &[TypeTag]) -> Value {
    let listed: Vec<&str> = types.iter().map(|tag| tag.name()).collect();
    Value::error(
        kinds::NO_METHOD_ERROR,
        format!("no method {} accepts ({})", name, listed.join(", ")),
    )
}
