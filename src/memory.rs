//! The [MemoryCache] maps [ResourceKey]s to live [ObjectHandle]s, counts how many consumers are displaying each one,
//! and bounds its own growth.
//!
//! This is implemented as a vec-backed linked list in insertion order plus an auxiliary hash-based index, so that
//! eviction can walk from the oldest entry without scanning the map.  Lookups never reorder the list: eviction removes
//! the oldest *unreferenced* entries first, which is FIFO among unreferenced entries rather than LRU.
//!
//! Eviction only runs right before a new key is inserted and only once the cache is at capacity, so the cache may
//! exceed its capacity by the one entry being inserted.  Entries with a non-zero reference count are never evicted;
//! if too few entries are evictable, the insert happens anyway.
use std::collections::HashMap;

use ahash::RandomState;
use log::{debug, trace};

use crate::{ObjectHandle, ResourceKey};

struct OccupiedEntry {
    key: ResourceKey,
    handle: ObjectHandle,
    ref_count: u32,
    /// Toward the head (newer).
    prev: Option<usize>,
    /// Toward the tail (older).
    next: Option<usize>,
}

struct EmptyEntry {
    next_empty: Option<usize>,
}

enum CacheEntry {
    /// This entry is empty, possibly with a pointer at the next empty entry.
    Empty(EmptyEntry),
    /// This entry is occupied, and doubly linked to its insertion-order neighbours.
    Occupied(OccupiedEntry),
}

impl CacheEntry {
    fn as_occupied_mut(&mut self) -> &mut OccupiedEntry {
        match self {
            Self::Occupied(ref mut x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_occupied(&self) -> &OccupiedEntry {
        match self {
            Self::Occupied(ref x) => x,
            _ => panic!("Entry should be occupied"),
        }
    }

    fn as_empty_mut(&mut self) -> &mut EmptyEntry {
        match self {
            CacheEntry::Empty(ref mut x) => x,
            _ => panic!("Entry should be empty"),
        }
    }
}

pub struct MemoryCache {
    entries: Vec<CacheEntry>,
    /// Points at the index of the key.
    index: HashMap<ResourceKey, usize, RandomState>,
    /// Inserting at this size triggers an eviction pass.
    capacity: usize,
    /// Most entries removed by one eviction pass.
    eviction_batch: usize,
    /// Newest entry.
    entries_head: Option<usize>,
    /// Oldest entry.
    entries_tail: Option<usize>,
    empty_head: Option<usize>,
}

impl MemoryCache {
    pub fn new(capacity: usize, eviction_batch: usize) -> MemoryCache {
        MemoryCache {
            entries: Default::default(),
            index: Default::default(),
            capacity: capacity.max(1),
            eviction_batch: eviction_batch.max(1),
            entries_head: None,
            entries_tail: None,
            empty_head: None,
        }
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

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    /// Look an entry up without touching its reference count.
    pub fn get(&self, key: &ResourceKey) -> Option<ObjectHandle> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().handle.clone())
    }

    pub fn ref_count(&self, key: &ResourceKey) -> Option<u32> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].as_occupied().ref_count)
    }

    /// Number of entries somebody is currently displaying.
    pub fn referenced_len(&self) -> usize {
        self.iter_oldest_first().filter(|e| e.ref_count > 0).count()
    }

    /// Start displaying an entry that is already cached.
    pub fn acquire_existing(&mut self, key: &ResourceKey) -> Option<ObjectHandle> {
        let ind = *self.index.get(key)?;
        let entry = self.entries[ind].as_occupied_mut();
        entry.ref_count += 1;
        Some(entry.handle.clone())
    }

    /// Start displaying `key`, inserting `handle` if the key isn't cached yet.
    ///
    /// If the key is already cached under a different handle, the caller's handle is revoked and the cached one is
    /// returned, so there is never more than one live object per key.
    pub fn acquire(&mut self, key: ResourceKey, handle: ObjectHandle) -> ObjectHandle {
        self.insert_or_merge(key, handle, 1)
    }

    /// Make `handle` available under `key` without displaying it.  Same merge rules as [MemoryCache::acquire].
    pub fn register(&mut self, key: ResourceKey, handle: ObjectHandle) -> ObjectHandle {
        self.insert_or_merge(key, handle, 0)
    }

    /// Stop displaying `key`.  The count is floored at zero and nothing is evicted here.
    pub fn release(&mut self, key: &ResourceKey) {
        if let Some(&ind) = self.index.get(key) {
            let entry = self.entries[ind].as_occupied_mut();
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Like [MemoryCache::release], but only if `key` still maps to this exact handle.
    ///
    /// Returns whether a count was decremented.
    pub fn release_handle(&mut self, key: &ResourceKey, handle: &ObjectHandle) -> bool {
        let Some(&ind) = self.index.get(key) else {
            return false;
        };
        let entry = self.entries[ind].as_occupied_mut();
        if !entry.handle.ptr_eq(handle) {
            return false;
        }
        entry.ref_count = entry.ref_count.saturating_sub(1);
        true
    }

    fn insert_or_merge(&mut self, key: ResourceKey, handle: ObjectHandle, refs: u32) -> ObjectHandle {
        if let Some(&ind) = self.index.get(&key) {
            let entry = self.entries[ind].as_occupied_mut();
            entry.ref_count += refs;
            if !entry.handle.ptr_eq(&handle) {
                handle.revoke();
            }
            return entry.handle.clone();
        }

        self.evict_if_over_capacity();

        let ind = self.find_empty();
        let old_head = self.entries_head;
        self.entries[ind] = CacheEntry::Occupied(OccupiedEntry {
            key: key.clone(),
            handle: handle.clone(),
            ref_count: refs,
            prev: None,
            next: old_head,
        });
        self.entries_head = Some(ind);
        self.index.insert(key, ind);

        // Link up the prev of the old head.
        if let Some(h) = old_head {
            self.entries[h].as_occupied_mut().prev = Some(ind);
        }

        // If there's no tail this was the first insert and we need one.
        if self.entries_tail.is_none() {
            self.entries_tail = Some(ind);
        }

        handle
    }

    /// Once the cache is at capacity, drop up to one batch of unreferenced entries, oldest first.
    ///
    /// Returns how many entries were evicted.
    pub fn evict_if_over_capacity(&mut self) -> usize {
        if self.len() < self.capacity {
            return 0;
        }

        let mut victims = Vec::with_capacity(self.eviction_batch);
        let mut cursor = self.entries_tail;
        while let Some(ind) = cursor {
            if victims.len() >= self.eviction_batch {
                break;
            }
            let entry = self.entries[ind].as_occupied();
            if entry.ref_count == 0 {
                victims.push(ind);
            }
            cursor = entry.prev;
        }

        for &ind in &victims {
            let entry = self.become_empty(ind);
            trace!("Evicting {}", entry.key);
            entry.handle.revoke();
        }

        debug!(
            "Evicted {} of {} entries ({} referenced)",
            victims.len(),
            self.len() + victims.len(),
            self.referenced_len()
        );
        victims.len()
    }

    /// Revoke every handle regardless of reference count and empty the cache.
    ///
    /// Returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        for entry in self.entries.drain(..) {
            if let CacheEntry::Occupied(x) = entry {
                x.handle.revoke();
            }
        }
        self.index.clear();
        self.entries_head = None;
        self.entries_tail = None;
        self.empty_head = None;
        count
    }

    /// Cached keys, oldest insertion first.
    pub fn keys_oldest_first(&self) -> Vec<ResourceKey> {
        self.iter_oldest_first().map(|e| e.key.clone()).collect()
    }

    fn iter_oldest_first(&self) -> impl Iterator<Item = &OccupiedEntry> {
        let mut ind = self.entries_tail;
        std::iter::from_fn(move || {
            let next = ind?;
            let ret = self.entries[next].as_occupied();
            ind = ret.prev;
            Some(ret)
        })
    }

    /// Entirely unlink an occupied index from the list.
    fn unlink_index(&mut self, index: usize) {
        let (prev, next) = {
            let entry = self.entries[index].as_occupied();
            (entry.prev, entry.next)
        };

        match prev {
            Some(p) => self.entries[p].as_occupied_mut().next = next,
            None => self.entries_head = next,
        }
        match next {
            Some(n) => self.entries[n].as_occupied_mut().prev = prev,
            None => self.entries_tail = prev,
        }
    }

    /// Make a specific index of the list become empty, returning what was there.
    fn become_empty(&mut self, index: usize) -> OccupiedEntry {
        self.unlink_index(index);
        let mut old = CacheEntry::Empty(EmptyEntry {
            next_empty: self.empty_head,
        });
        std::mem::swap(&mut old, &mut self.entries[index]);
        self.empty_head = Some(index);
        match old {
            CacheEntry::Occupied(x) => {
                self.index.remove(&x.key);
                x
            }
            _ => panic!("Should have been occupied"),
        }
    }

    /// Find an available empty index, or make one if necessary.
    fn find_empty(&mut self) -> usize {
        if let Some(e) = self.empty_head {
            self.empty_head = self.entries[e].as_empty_mut().next_empty;
            return e;
        }

        self.entries
            .push(CacheEntry::Empty(EmptyEntry { next_empty: None }));
        self.entries.len() - 1
    }
}
