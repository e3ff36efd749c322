//! `List`, `Map`, and `Range` heap objects.

use crate::value::Value;

/// Growable sequence of values.
pub struct ObjList {
    pub items: Vec<Value>,
}

impl ObjList {
    pub fn new() -> Self {
        ObjList { items: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        ObjList { items: Vec::with_capacity(n) }
    }

    pub fn insert(&mut self, index: usize, value: Value) {
        self.items.insert(index, value);
    }

    pub fn remove_at(&mut self, index: usize) -> Value {
        self.items.remove(index)
    }
}

impl Default for ObjList {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel values for empty/tombstone map slots:
/// `key == Undefined, value == false` is empty; `key == Undefined,
/// value == true` is a tombstone.
const MIN_CAPACITY: usize = 16;
const LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

/// Open-addressed hash table keyed by [`Value`]. Not
/// `std::collections::HashMap` on purpose: load factor, growth/shrink
/// thresholds, and a minimum capacity are all observable invariants here,
/// which calls for owning the table shape outright.
pub struct ObjMap {
    entries: Vec<Entry>,
    count: usize, // live entries, not counting tombstones
}

impl ObjMap {
    pub fn new() -> Self {
        ObjMap { entries: Vec::new(), count: 0 }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn hash_value(key: &Value) -> u32 {
        match key {
            Value::Bool(b) => {
                if *b {
                    1
                } else {
                    0
                }
            }
            Value::Num(n) => {
                // Hash the bit pattern; -0.0 and 0.0 intentionally hash
                // differently from each other only if they compare unequal,
                // which they don't (IEEE says 0.0 == -0.0), so normalize.
                let bits = if *n == 0.0 { 0u64 } else { n.to_bits() };
                let mut h = bits as u32 ^ (bits >> 32) as u32;
                h ^= h >> 16;
                h
            }
            Value::Null => 2,
            Value::Undefined => 3,
            Value::Obj(o) if o.kind() == crate::object::ObjKind::String => o.as_string().hash,
            Value::Obj(o) => o.as_ptr() as usize as u32,
        }
    }

    fn is_empty_slot(entry: &Entry) -> bool {
        entry.key.is_undefined() && matches!(entry.value, Value::Bool(false))
    }

    fn is_tombstone(entry: &Entry) -> bool {
        entry.key.is_undefined() && matches!(entry.value, Value::Bool(true))
    }

    /// Find the slot a key occupies, or the first empty/tombstone slot it
    /// would be inserted into. Returns `None` only when the table has zero
    /// capacity.
    fn find_slot(entries: &[Entry], key: &Value) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        let cap = entries.len();
        let mut index = (Self::hash_value(key) as usize) % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if Self::is_empty_slot(entry) {
                return Some(first_tombstone.unwrap_or(index));
            } else if Self::is_tombstone(entry) {
                if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if entry.key.equals(key) {
                return Some(index);
            }
            index = (index + 1) % cap;
        }
    }

    fn grow_to(&mut self, new_capacity: usize) {
        let mut new_entries = vec![
            Entry { key: Value::Undefined, value: Value::Bool(false) };
            new_capacity
        ];
        for entry in self.entries.drain(..) {
            if Self::is_empty_slot(&entry) || Self::is_tombstone(&entry) {
                continue;
            }
            let slot = Self::find_slot(&new_entries, &entry.key).expect("non-empty capacity");
            new_entries[slot] = entry;
        }
        self.entries = new_entries;
    }

    fn ensure_capacity(&mut self) {
        let needed_cap = self.entries.len().max(MIN_CAPACITY);
        if self.entries.is_empty() {
            self.grow_to(needed_cap);
            return;
        }
        if (self.count + 1) as f64 > self.entries.len() as f64 * LOAD_FACTOR {
            self.grow_to(self.entries.len() * 2);
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        let slot = Self::find_slot(&self.entries, key)?;
        let entry = &self.entries[slot];
        if Self::is_empty_slot(entry) || Self::is_tombstone(entry) {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.ensure_capacity();
        let slot = Self::find_slot(&self.entries, &key).expect("capacity ensured above");
        let was_new = Self::is_empty_slot(&self.entries[slot]) || Self::is_tombstone(&self.entries[slot]);
        self.entries[slot] = Entry { key, value };
        if was_new {
            self.count += 1;
        }
    }

    /// Removes `key`, returning its value if present. Shrinks the table
    /// when the load factor drops below half of `LOAD_FACTOR` and the
    /// table is larger than the minimum capacity.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let slot = Self::find_slot(&self.entries, key)?;
        let entry = self.entries[slot];
        if Self::is_empty_slot(&entry) || Self::is_tombstone(&entry) {
            return None;
        }
        self.entries[slot] = Entry { key: Value::Undefined, value: Value::Bool(true) };
        self.count -= 1;
        if self.entries.len() > MIN_CAPACITY && (self.count as f64) < (self.entries.len() as f64 / 2.0) * LOAD_FACTOR {
            let mut new_cap = self.entries.len() / 2;
            if new_cap < MIN_CAPACITY {
                new_cap = MIN_CAPACITY;
            }
            self.grow_to(new_cap);
        }
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }

    /// Iterate live `(key, value)` pairs in slot order — the iteration
    /// order `Map.iterate`/`keyIteratorValue_` walk.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| !Self::is_empty_slot(e) && !Self::is_tombstone(e)).map(|e| (e.key, e.value))
    }

    /// Advance a map iterator slot index (as used by `CODE_` iterate
    /// primitives): returns the next occupied slot index at or after
    /// `start`, or `None` when iteration is finished.
    pub fn next_slot(&self, start: usize) -> Option<usize> {
        let mut i = start;
        while i < self.entries.len() {
            let e = &self.entries[i];
            if !Self::is_empty_slot(e) && !Self::is_tombstone(e) {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    pub fn entry_at(&self, slot: usize) -> (Value, Value) {
        let e = self.entries[slot];
        (e.key, e.value)
    }
}

impl Default for ObjMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable numeric range.
pub struct ObjRange {
    pub from: f64,
    pub to: f64,
    pub is_inclusive: bool,
}

impl ObjRange {
    pub fn new(from: f64, to: f64, is_inclusive: bool) -> Self {
        ObjRange { from, to, is_inclusive }
    }

    pub fn min(&self) -> f64 {
        self.from.min(self.to)
    }

    pub fn max(&self) -> f64 {
        self.from.max(self.to)
    }
}
