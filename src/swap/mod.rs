//! Resident-set priority table.
//!
//! The swap is a fixed-capacity table of page identifiers ordered by an
//! indexed binary min-heap over their priorities. Touching a page raises
//! its priority (a monotone tick supplied by the tree, yielding LRU);
//! admitting a new page into a full table pops the minimum-priority
//! entry and reports it as the eviction victim.
//!
//! The table is single-threaded; the tree mutates it only while holding
//! its tree-lock in write mode and reads it under read mode.

use log::warn;

use crate::types::PageId;

const NO_POS: usize = usize::MAX;

/// Fixed-capacity priority table over resident page ids
pub struct Swap {
    /// slot -> tracked page id (`PageId::NONE` when the slot is free)
    ids: Vec<PageId>,
    /// slot -> current priority
    keys: Vec<u64>,
    /// 1-based heap: position -> slot
    heap: Vec<usize>,
    /// slot -> heap position (`NO_POS` when not in the heap)
    pos: Vec<usize>,
    size: usize,
    capacity: usize,
}

impl Swap {
    /// Create a table admitting at most `capacity` page ids
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "swap capacity must be positive");
        Self {
            ids: vec![PageId::NONE; capacity],
            keys: vec![0; capacity],
            heap: vec![NO_POS; capacity + 1],
            pos: vec![NO_POS; capacity],
            size: 0,
            capacity,
        }
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the table tracks nothing
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Maximum number of tracked ids
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Membership query
    pub fn is_active(&self, id: PageId) -> bool {
        self.slot_of(id).is_some()
    }

    /// Track `id` at `priority`, or raise its priority if already
    /// tracked. Returns the evicted minimum-priority id when admission
    /// overflows the table.
    pub fn set_priority(&mut self, id: PageId, priority: u64) -> Option<PageId> {
        if let Some(slot) = self.slot_of(id) {
            self.increase_key(slot, priority);
            None
        } else if self.size < self.capacity {
            let slot = self.free_slot();
            self.ids[slot] = id;
            self.insert(slot, priority);
            None
        } else {
            let slot = self.pop_min();
            let victim = self.ids[slot];
            assert!(victim.is_valid() && victim != id, "swap slot reuse mismatch");
            self.ids[slot] = id;
            self.insert(slot, priority);
            Some(victim)
        }
    }

    /// Stop tracking `id`; returns whether it was present
    pub fn unset_priority(&mut self, id: PageId) -> bool {
        match self.slot_of(id) {
            Some(slot) => {
                self.remove(slot);
                self.ids[slot] = PageId::NONE;
                true
            }
            None => false,
        }
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.ids.fill(PageId::NONE);
        self.pos.fill(NO_POS);
        self.size = 0;
    }

    /// Tracked ids in no particular order
    pub fn active_ids(&self) -> impl Iterator<Item = PageId> + '_ {
        self.ids.iter().copied().filter(|id| id.is_valid())
    }

    fn slot_of(&self, id: PageId) -> Option<usize> {
        // the table is deliberately small; a scan beats bookkeeping
        self.ids.iter().position(|&tracked| tracked == id)
    }

    fn free_slot(&self) -> usize {
        self.ids
            .iter()
            .position(|id| !id.is_valid())
            .expect("swap below capacity must have a free slot")
    }

    fn greater(&self, i: usize, j: usize) -> bool {
        self.keys[self.heap[i]] > self.keys[self.heap[j]]
    }

    fn exch(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.pos[self.heap[i]] = i;
        self.pos[self.heap[j]] = j;
    }

    fn swim(&mut self, mut k: usize) {
        while k > 1 && self.greater(k / 2, k) {
            self.exch(k, k / 2);
            k /= 2;
        }
    }

    fn sink(&mut self, mut k: usize) {
        loop {
            let mut j = 2 * k;
            if j > self.size {
                break;
            }
            if j < self.size && self.greater(j, j + 1) {
                j += 1;
            }
            if !self.greater(k, j) {
                break;
            }
            self.exch(k, j);
            k = j;
        }
    }

    fn insert(&mut self, slot: usize, key: u64) {
        assert!(self.size < self.capacity, "swap heap overflow");
        self.size += 1;
        self.keys[slot] = key;
        self.pos[slot] = self.size;
        self.heap[self.size] = slot;
        self.swim(self.size);
    }

    fn increase_key(&mut self, slot: usize, key: u64) {
        if key > self.keys[slot] {
            self.keys[slot] = key;
            let p = self.pos[slot];
            self.sink(p);
        } else if key < self.keys[slot] {
            warn!("ignored attempt to lower swap priority of {}", self.ids[slot]);
        }
    }

    /// Pop the minimum-priority entry and return its slot
    fn pop_min(&mut self) -> usize {
        assert!(self.size > 0, "swap underflow");
        let slot = self.heap[1];
        self.exch(1, self.size);
        self.size -= 1;
        self.sink(1);
        self.pos[slot] = NO_POS;
        slot
    }

    /// Remove the entry at `slot` from an arbitrary heap position
    fn remove(&mut self, slot: usize) {
        let p = self.pos[slot];
        self.exch(p, self.size);
        self.size -= 1;
        if p <= self.size {
            self.swim(p);
            self.sink(p);
        }
        self.pos[slot] = NO_POS;
    }
}
