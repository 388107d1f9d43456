//! Open-addressing table keyed by integers or pointers.
//!
//! Used for per-type dispatch lookups, the scope-level method cache and
//! de-duplication of nested templates during decoding. Keys are arbitrary
//! `u64` values (pointer addresses, digests, hashed type tuples); they are
//! spread with [`mix64`](crate::mix64) before probing.

use crate::mix64;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
enum Slot<V> {
    Empty,
    Tombstone,
    Full(u64, V),
}

/// Linear-probing hash table with power-of-two capacity.
///
/// The table grows when live entries plus tombstones exceed three quarters of
/// the capacity. Removal leaves a tombstone so that collision chains stay intact.
///
/// # Examples
///
/// ```
/// use core_types::IdTable;
///
/// let mut table = IdTable::new();
/// table.insert(0xdead_beef, "entry");
/// assert_eq!(table.get(0xdead_beef), Some(&"entry"));
/// assert_eq!(table.remove(0xdead_beef), Some("entry"));
/// assert!(table.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct IdTable<V> {
    slots: Vec<Slot<V>>,
    len: usize,
    tombstones: usize,
}

impl<V> Default for IdTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IdTable<V> {
    /// Creates an empty table. No allocation happens until the first insert.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            tombstones: 0,
        }
    }

    /// Creates a table able to hold `capacity` entries without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = Self::new();
        if capacity > 0 {
            table.slots = empty_slots(slots_for(capacity));
        }
        table
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Looks up `key`.
    pub fn get(&self, key: u64) -> Option<&V> {
        let index = self.find(key)?;
        match &self.slots[index] {
            Slot::Full(_, value) => Some(value),
            _ => None,
        }
    }

    /// Looks up `key` for mutation.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let index = self.find(key)?;
        match &mut self.slots[index] {
            Slot::Full(_, value) => Some(value),
            _ => None,
        }
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: u64) -> bool {
        self.find(key).is_some()
    }

    /// Inserts `value` under `key`, returning the previous value if any.
    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        if let Some(index) = self.find(key) {
            if let Slot::Full(_, existing) = &mut self.slots[index] {
                return Some(std::mem::replace(existing, value));
            }
        }
        self.reserve_one();
        let index = self.vacant_for(key);
        if matches!(self.slots[index], Slot::Tombstone) {
            self.tombstones -= 1;
        }
        self.slots[index] = Slot::Full(key, value);
        self.len += 1;
        None
    }

    /// Returns the value under `key`, inserting the result of `make` first if absent.
    pub fn get_or_insert_with(&mut self, key: u64, make: impl FnOnce() -> V) -> &mut V {
        let index = match self.find(key) {
            Some(index) => index,
            None => {
                self.reserve_one();
                let index = self.vacant_for(key);
                if matches!(self.slots[index], Slot::Tombstone) {
                    self.tombstones -= 1;
                }
                self.slots[index] = Slot::Full(key, make());
                self.len += 1;
                index
            }
        };
        match &mut self.slots[index] {
            Slot::Full(_, value) => value,
            // find/vacant_for only ever hand back full slots here
            _ => unreachable!("slot {} is not occupied", index),
        }
    }

    /// Removes `key`, leaving a tombstone.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let index = self.find(key)?;
        match std::mem::replace(&mut self.slots[index], Slot::Tombstone) {
            Slot::Full(_, value) => {
                self.len -= 1;
                self.tombstones += 1;
                Some(value)
            }
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Drops every entry, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::Empty;
        }
        self.len = 0;
        self.tombstones = 0;
    }

    /// Iterates over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full(key, value) => Some((*key, value)),
            _ => None,
        })
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn find(&self, key: u64) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.mask();
        let mut index = mix64(key) as usize & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Full(k, _) if *k == key => return Some(index),
                _ => index = (index + 1) & mask,
            }
        }
        None
    }

    // First tombstone or empty slot on the search path. Callers have already
    // checked that `key` is absent and reserved room.
    fn vacant_for(&self, key: u64) -> usize {
        let mask = self.mask();
        let mut index = mix64(key) as usize & mask;
        loop {
            match &self.slots[index] {
                Slot::Empty | Slot::Tombstone => return index,
                Slot::Full(..) => index = (index + 1) & mask,
            }
        }
    }

    fn reserve_one(&mut self) {
        if self.slots.is_empty() {
            self.rehash(MIN_CAPACITY);
            return;
        }
        let capacity = self.slots.len();
        if (self.len + self.tombstones + 1) * 4 > capacity * 3 {
            // Mostly tombstones: rehash at the same size.
            let target = if (self.len + 1) * 4 > capacity * 3 {
                capacity * 2
            } else {
                capacity
            };
            self.rehash(target);
        }
    }

    fn rehash(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.slots, empty_slots(capacity));
        self.tombstones = 0;
        let mask = self.mask();
        for slot in old {
            if let Slot::Full(key, value) = slot {
                let mut index = mix64(key) as usize & mask;
                while matches!(self.slots[index], Slot::Full(..)) {
                    index = (index + 1) & mask;
                }
                self.slots[index] = Slot::Full(key, value);
            }
        }
    }
}

fn slots_for(entries: usize) -> usize {
    // Smallest power of two keeping `entries` at or under 3/4 load.
    let needed = (entries * 4).div_ceil(3);
    needed.next_power_of_two().max(MIN_CAPACITY)
}

fn empty_slots<V>(capacity: usize) -> Vec<Slot<V>> {
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || Slot::Empty);
    slots
}
