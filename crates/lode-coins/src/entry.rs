//! Cache entry storage and the intrusive dirty-entry list.
//!
//! Entries live in an arena indexed by [`EntryIndex`]; the cache's map
//! stores indices, never references, so entries can link to each other
//! without raw pointers. A reserved sentinel slot anchors a circular
//! singly-linked list threading through every dirty entry, giving O(1)
//! insertion at the head and O(1) unlink given the predecessor, with no
//! allocation beyond the entries themselves.
//!
//! The list is pure bookkeeping: an entry is linked iff its DIRTY flag is
//! set, and traversal from the sentinel visits dirty entries in
//! most-recently-dirtied-first order. FRESH refines DIRTY — the entry did
//! not exist in the backing store before this cache generation, so a
//! spend of it never becomes a store delete.
//!
//! Entries are only ever destroyed wholesale ([`EntryArena::clear`] on
//! flush or reset), so slots are never individually reclaimed and an
//! index stays valid for the whole cache generation.
//!
//! Not thread-safe; the owning cache is single-writer.

use lode_core::types::{Coin, OutPoint};

/// Index of an entry slot inside an [`EntryArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryIndex(u32);

/// The reserved sentinel slot: head and tail of the circular dirty list.
pub(crate) const SENTINEL: EntryIndex = EntryIndex(0);

const DIRTY: u8 = 1 << 0;
const FRESH: u8 = 1 << 1;

/// A coin plus the cache's per-entry bookkeeping.
///
/// The entry carries its own outpoint so a dirty-list walk can build a
/// store batch without consulting the map.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub outpoint: OutPoint,
    pub coin: Coin,
    flags: u8,
    next: EntryIndex,
}

impl CacheEntry {
    fn new(outpoint: OutPoint, coin: Coin) -> Self {
        Self {
            outpoint,
            coin,
            flags: 0,
            next: SENTINEL,
        }
    }

    /// Whether this entry needs writing to the backing store on flush.
    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    /// Whether this entry's outpoint was absent from the backing store
    /// before this cache generation. Only meaningful while dirty.
    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }
}

/// Slab of cache entries with the dirty-list sentinel at slot 0.
pub(crate) struct EntryArena {
    slots: Vec<CacheEntry>,
}

impl EntryArena {
    /// Create an arena holding only the self-referencing sentinel.
    pub fn new() -> Self {
        // The sentinel holds no real coin and initially links to itself.
        Self {
            slots: vec![CacheEntry::new(OutPoint::null(), Coin::new_spent())],
        }
    }

    /// Borrow the entry at `index`. Must not be the sentinel.
    pub fn entry(&self, index: EntryIndex) -> &CacheEntry {
        debug_assert_ne!(index, SENTINEL);
        &self.slots[index.0 as usize]
    }

    /// Mutably borrow the entry at `index`. Must not be the sentinel.
    pub fn entry_mut(&mut self, index: EntryIndex) -> &mut CacheEntry {
        debug_assert_ne!(index, SENTINEL);
        &mut self.slots[index.0 as usize]
    }

    /// Raw successor link. Traversal starts at `next(SENTINEL)` and ends
    /// when the returned index equals [`SENTINEL`].
    pub fn next(&self, index: EntryIndex) -> EntryIndex {
        self.slots[index.0 as usize].next
    }

    /// Store a clean entry and return its slot index.
    pub fn insert(&mut self, outpoint: OutPoint, coin: Coin) -> EntryIndex {
        self.slots.push(CacheEntry::new(outpoint, coin));
        EntryIndex((self.slots.len() - 1) as u32)
    }

    /// Mark an entry dirty, linking it at the list head.
    ///
    /// On an already-dirty entry this only upgrades the FRESH flag
    /// (logical OR — fresh is never cleared here) and leaves the list
    /// position unchanged.
    pub fn set_dirty(&mut self, index: EntryIndex, fresh: bool) {
        debug_assert_ne!(index, SENTINEL);
        if self.entry(index).is_dirty() {
            if fresh {
                self.entry_mut(index).flags |= FRESH;
            }
            return;
        }
        let head = self.next(SENTINEL);
        let entry = self.entry_mut(index);
        entry.flags = DIRTY | if fresh { FRESH } else { 0 };
        entry.next = head;
        self.slots[SENTINEL.0 as usize].next = index;
    }

    /// Unlink an entry and clear both DIRTY and FRESH.
    ///
    /// `prev` must be the entry currently linking to `index` (the
    /// sentinel for the list head). Idempotent: a second call on an
    /// already-clean entry is a no-op. The unlinked entry's own `next`
    /// link is left stale.
    pub fn set_clean(&mut self, prev: EntryIndex, index: EntryIndex) {
        debug_assert_ne!(index, SENTINEL);
        if !self.entry(index).is_dirty() {
            return;
        }
        debug_assert_eq!(self.next(prev), index, "predecessor does not link to entry");
        let successor = self.entry(index).next;
        self.slots[prev.0 as usize].next = successor;
        self.entry_mut(index).flags = 0;
    }

    /// Walk the dirty list head to tail.
    pub fn dirty_iter(&self) -> impl Iterator<Item = EntryIndex> + '_ {
        let mut current = self.next(SENTINEL);
        std::iter::from_fn(move || {
            if current == SENTINEL {
                None
            } else {
                let index = current;
                current = self.next(current);
                Some(index)
            }
        })
    }

    /// Drop every entry, releasing slot storage, and re-initialize the
    /// sentinel's self-reference.
    pub fn clear(&mut self) {
        self.slots = vec![CacheEntry::new(OutPoint::null(), Coin::new_spent())];
    }

    /// Bytes allocated for slot storage, for cache memory accounting.
    pub fn allocated_bytes(&self) -> usize {
        self.slots.capacity() * std::mem::size_of::<CacheEntry>()
    }
}
