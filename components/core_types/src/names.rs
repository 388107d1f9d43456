//! Ordered string-keyed table.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Balanced-tree table keyed by names.
///
/// Backs named exports, globals and method-name interning. Keys are stored
/// as `Arc<str>` so interned names can be handed out without copying.
///
/// # Examples
///
/// ```
/// use core_types::NameTable;
///
/// let mut exports = NameTable::new();
/// exports.insert("math.add", 1);
/// exports.insert("math.sub", 2);
/// exports.insert("io.read", 3);
///
/// let math: Vec<&str> = exports.prefixed("math.").map(|(k, _)| k).collect();
/// assert_eq!(math, vec!["math.add", "math.sub"]);
/// ```
#[derive(Debug, Clone)]
pub struct NameTable<V> {
    entries: BTreeMap<Arc<str>, V>,
}

impl<V> Default for NameTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> NameTable<V> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `name`.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.get(name)
    }

    /// Looks up `name` for mutation.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.entries.get_mut(name)
    }

    /// Returns the stored key for `name`, if present.
    pub fn intern(&self, name: &str) -> Option<Arc<str>> {
        self.entries
            .get_key_value(name)
            .map(|(key, _)| Arc::clone(key))
    }

    /// Inserts `value` under `name`, returning the previous value.
    pub fn insert(&mut self, name: impl Into<Arc<str>>, value: V) -> Option<V> {
        self.entries.insert(name.into(), value)
    }

    /// Returns the value under `name`, inserting `make()` first if absent.
    pub fn get_or_insert_with(&mut self, name: &str, make: impl FnOnce() -> V) -> &mut V {
        self.entries.entry(Arc::from(name)).or_insert_with(make)
    }

    /// Removes `name`.
    pub fn remove(&mut self, name: &str) -> Option<V> {
        self.entries.remove(name)
    }

    /// Iterates over all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> + '_ {
        self.entries.iter().map(|(k, v)| (&**k, v))
    }

    /// Iterates over entries whose name starts with `prefix`, in name order.
    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a V)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (&**k, v))
    }
}
