//! an [LruStore] is an Lru cache bounded by a fixed number of entries.
//!
//! This is implemented as a vec-backed linked list where the items are allocated on the heap behind `Arc`, plus an
//! auxiliary hash-based index.  Everything is O(1): lookups go through the index, and promotion/eviction are just
//! relinking at the head or the tail.
//!
//! Items handed out are `Arc`s, so an evicted value stays alive for as long as a caller holds onto it.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

use crate::ConfigError;

struct OccupiedEntry<K, V> {
    key: Arc<K>,
    item: Arc<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum StoreEntry<K, V> {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubly linked to the previous and next entry.
    Occupied(OccupiedEntry<K, V>),
}

impl<K, V> StoreEntry<K, V> {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry<K, V> {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            StoreEntry::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

pub struct LruStore<K: Hash + Eq, V> {
    entries: Vec<StoreEntry<K, V>>,
    /// Points at the index of the key.
    index: HashMap<Arc<K>, usize, RandomState>,
    capacity: usize,
    /// Most recently used.
    entries_head: Option<usize>,
    /// Least recently used, and the next thing to go.
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
    /// Total number of entries evicted over the lifetime of the store.
    evictions: u64,
}

impl<K: Hash + Eq, V> LruStore<K, V> {
    pub fn new(capacity: usize) -> Result<LruStore<K, V>, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }

        // Grow on demand: a huge capacity is a valid way of saying "effectively unbounded".
        Ok(LruStore {
            entries: Default::default(),
            index: Default::default(),
            capacity,
            entries_head: None,
            entries_tail: None,
            empty_head: None,
            evictions: 0,
        })
    }

    /// Entirely unlink an occupied index from the list.
    /// Used as a precursor step to lots of things such as patching up the head.
    fn unlink_index(&mut self, index: usize) {
        // Easiest to handle the tail first.
        if Some(index) == self.entries_tail {
            self.entries_tail = self.entries[index].as_occupied().prev;
        }

        if Some(index) == self.entries_head {
            // unlinking the head is special.
            self.entries_head = self.entries[index].as_occupied_mut().next;
            if let Some(n) = self.entries_head {
                self.entries[n].as_occupied_mut().prev = None;
            }

            return;
        }

        // Otherwise we just do a standard linked list unlink.
        let old_prev = self.entries[index]
            .as_occupied_mut()
            .prev
            .expect("Isn't the head");
        let old_next = self.entries[index].as_occupied_mut().next;
        self.entries[old_prev].as_occupied_mut().next = old_next;
        if let Some(n) = old_next {
            self.entries[n].as_occupied_mut().prev = Some(old_prev);
        }
    }

    /// Link an occupied but unlinked index in at the head.
    fn link_at_head(&mut self, index: usize) {
        {
            let entry = self.entries[index].as_occupied_mut();
            entry.prev = None;
            entry.next = self.entries_head;
        }
        if let Some(h) = self.entries_head {
            self.entries[h].as_occupied_mut().prev = Some(index);
        }
        self.entries_head = Some(index);

        // If there's no tail this is the only entry.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(index);
        }
    }

    /// Given the index of an occupied entry, make it the most recent item.
    fn make_most_recent(&mut self, index: usize) {
        if Some(index) == self.entries_head {
            return;
        }
        self.unlink_index(index);
        self.link_at_head(index);
    }

    /// Get an item, making it the most recently used one.
    pub fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        self.make_most_recent(ind);
        Some(self.entries[ind].as_occupied().item.clone())
    }

    /// Get an item without touching its position in the eviction order.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().item.clone())
    }

    /// Membership test.  Like [LruStore::peek], this doesn't count as a use.
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Make a specific index of the map become empty.
    fn become_empty(&mut self, index: usize) -> Arc<V> {
        self.unlink_index(index);
        let mut old = StoreEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            StoreEntry::Occupied(OccupiedEntry { key, item, .. }) => {
                self.index.remove(&key);
                item
            }
            _ => panic!("Should have been occupied"),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.become_empty(ind))
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(StoreEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }

    /// Add an entry to the store.  Return the old value if this key was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<Arc<V>> {
        self.insert_shared(key, Arc::new(value))
    }

    /// Like [LruStore::insert], for values which are already behind an `Arc`.
    pub fn insert_shared(&mut self, key: K, item: Arc<V>) -> Option<Arc<V>> {
        // Replacing keeps the slot and just swaps the item out.
        if let Some(&ind) = self.index.get(&key) {
            let old = std::mem::replace(&mut self.entries[ind].as_occupied_mut().item, item);
            self.make_most_recent(ind);
            return Some(old);
        }

        let key_arc = Arc::new(key);
        let ind = self.find_empty();
        self.entries[ind] = StoreEntry::Occupied(OccupiedEntry {
            key: key_arc.clone(),
            item,
            prev: None,
            next: None,
        });
        self.link_at_head(ind);
        self.index.insert(key_arc, ind);

        self.maybe_evict();
        None
    }

    /// Run a cache eviction if required.
    ///
    /// The new entry is at the head, so with a capacity of at least 1 it is never the one to go.
    fn maybe_evict(&mut self) {
        while self.index.len() > self.capacity {
            let cur = match self.entries_tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain the length"),
            };

            self.become_empty(cur);
            self.evictions += 1;
        }
    }

    /// Drop everything.  The capacity stays as it was.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.entries_head = None;
        self.entries_tail = None;
        self.empty_head = None;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many entries have been pushed out by newer ones, ever.  [LruStore::clear] and [LruStore::remove] don't
    /// count.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.entries_head;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.next;
            Some((&*ret.key, &*ret.item))
        })
    }
}
