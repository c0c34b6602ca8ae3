//! Write-back coin cache.
//!
//! [`CoinsCache`] maps outpoints to cached coins backed by any
//! [`CoinsView`]. Mutations (adds, spends) are tracked through the
//! intrusive dirty-entry list so a flush can batch exactly the entries
//! that need persisting, and a running byte estimate lets block-connection
//! logic stage flushes against a memory budget without ever walking the
//! cache.
//!
//! Single-writer: wrap in a lock for cross-thread use. A
//! [`SharedCoinsCache`] (a locked cache handle) itself implements
//! [`CoinsView`], so one cache can serve as the backing view of another —
//! the ephemeral per-block cache layers on the main cache this way.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use lode_core::error::{CoinsError, LodeError};
use lode_core::types::{Coin, Hash256, OutPoint};
use lode_core::view::CoinsView;

use crate::entry::{EntryArena, EntryIndex, SENTINEL};

/// Utilization share of the configured budget at which the cache reports
/// [`CacheSizeState::Large`].
pub const LARGE_CACHE_PERCENT: usize = 90;

/// Staged report of cache size against a configured budget.
///
/// The cache only reports; callers decide whether to flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheSizeState {
    /// Within budget.
    Ok,
    /// Above [`LARGE_CACHE_PERCENT`] of the combined budget; a flush soon
    /// would be prudent.
    Large,
    /// Above the combined budget; the caller should flush before
    /// proceeding.
    Critical,
}

/// In-memory write-back cache of coins keyed by outpoint.
pub struct CoinsCache {
    backend: Arc<dyn CoinsView>,
    map: HashMap<OutPoint, EntryIndex>,
    arena: EntryArena,
    best_block: Hash256,
    /// Heap bytes attributable to cached coins, maintained incrementally.
    cached_coins_usage: usize,
}

impl CoinsCache {
    /// Create an empty cache over the given backing view.
    pub fn new(backend: Arc<dyn CoinsView>) -> Self {
        Self {
            backend,
            map: HashMap::new(),
            arena: EntryArena::new(),
            best_block: Hash256::ZERO,
            cached_coins_usage: 0,
        }
    }

    /// The backing view this cache falls through to on a miss.
    pub fn backend(&self) -> &Arc<dyn CoinsView> {
        &self.backend
    }

    /// Repoint the backing view without dropping cached entries.
    pub fn set_backend(&mut self, backend: Arc<dyn CoinsView>) {
        self.backend = backend;
    }

    /// Hash of the block this cache's state is current up to.
    pub fn best_block(&self) -> Hash256 {
        self.best_block
    }

    /// Advance the best-block marker; persisted by the next flush.
    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    /// Number of entries currently cached, spent tombstones included.
    pub fn cache_size(&self) -> usize {
        self.map.len()
    }

    /// The coin cached for `outpoint`, spent or not, without consulting
    /// the backing view.
    pub fn cached_coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.map
            .get(outpoint)
            .map(|&index| &self.arena.entry(index).coin)
    }

    /// Whether an unspent coin for `outpoint` is present in the cache.
    /// Never queries the backing view.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cached_coin(outpoint).is_some_and(|coin| !coin.is_spent())
    }

    /// Look up a coin, populating the cache from the backing view on a
    /// miss.
    ///
    /// An outpoint the backing view knows nothing about is cached as a
    /// spent tombstone, so repeated lookups for the same id never query
    /// the view twice; callers must check [`Coin::is_spent`]. The returned
    /// reference points into entry storage and is stable for the life of
    /// the entry.
    ///
    /// # Errors
    ///
    /// Propagates backing-view I/O failures.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<&Coin, LodeError> {
        let index = self.fetch_entry(outpoint)?;
        Ok(&self.arena.entry(index).coin)
    }

    /// Insert or overwrite the coin for `outpoint`, marking it dirty.
    ///
    /// Overwriting an existing unspent entry requires
    /// `possible_overwrite`; without it the call fails with
    /// [`CoinsError::OverwriteUnspent`] — silently allowing it would
    /// corrupt the UTXO set. Entries the backing store has never seen are
    /// marked fresh so their eviction never turns into a store delete.
    ///
    /// # Errors
    ///
    /// - [`CoinsError::AddSpentCoin`] if `coin` is a tombstone
    /// - [`CoinsError::OverwriteUnspent`] on a forbidden overwrite
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> Result<(), LodeError> {
        if coin.is_spent() {
            return Err(CoinsError::AddSpentCoin(outpoint.to_string()).into());
        }
        let mut fresh = false;
        let index = match self.map.get(&outpoint).copied() {
            Some(index) => {
                if !possible_overwrite {
                    let entry = self.arena.entry(index);
                    if !entry.coin.is_spent() {
                        return Err(CoinsError::OverwriteUnspent(outpoint.to_string()).into());
                    }
                    // The entry is a spent tombstone being recreated. If
                    // the spend never needed to reach the store, neither
                    // does the history of this outpoint.
                    fresh = !entry.is_dirty();
                }
                let entry = self.arena.entry_mut(index);
                let old_usage = entry.coin.dynamic_memory_usage();
                let new_usage = coin.dynamic_memory_usage();
                entry.coin = coin;
                self.cached_coins_usage = self.cached_coins_usage - old_usage + new_usage;
                index
            }
            None => {
                if !possible_overwrite {
                    fresh = true;
                }
                self.insert_clean(outpoint, coin)
            }
        };
        self.arena.set_dirty(index, fresh);
        Ok(())
    }

    /// Mark the coin for `outpoint` as spent, in place.
    ///
    /// The entry keeps its position in the dirty list; a fresh entry stays
    /// fresh, so the flush drops the create/spend pair without the store
    /// ever hearing about it. Returns the consumed coin for undo
    /// bookkeeping, or `None` if nothing unspent was found.
    ///
    /// # Errors
    ///
    /// Propagates backing-view I/O failures from the populate-on-miss path.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
        let index = self.fetch_entry(outpoint)?;
        Ok(self.spend_entry(index))
    }

    /// Warm the cache with a coin known to match the backing view.
    ///
    /// Try-emplace semantics: an existing entry — including a spent
    /// tombstone — is never overwritten, which is what keeps a prefetch
    /// from resurrecting an already-spent coin. The inserted entry is
    /// clean: it mirrors the store, so there is nothing to flush.
    pub fn prime_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        if self.map.contains_key(&outpoint) {
            return;
        }
        self.insert_clean(outpoint, coin);
    }

    /// Persist all dirty entries to the backing view in one batch and
    /// empty the cache.
    ///
    /// Spent tombstones become deletes; entries that are fresh *and*
    /// spent were created and consumed entirely within this cache
    /// generation, so they are dropped without any store write. The
    /// best-block marker is persisted in the same batch.
    ///
    /// # Errors
    ///
    /// - [`CoinsError::BestBlockUnset`] if no best block was recorded
    /// - the backing view's write error, in which case the cache is left
    ///   unflushed and intact — never silently partially flushed
    pub fn flush(&mut self) -> Result<(), LodeError> {
        if self.best_block.is_zero() {
            return Err(CoinsError::BestBlockUnset.into());
        }
        let mut batch = Vec::new();
        let mut dropped_fresh = 0usize;
        for index in self.arena.dirty_iter() {
            let entry = self.arena.entry(index);
            if entry.is_fresh() && entry.coin.is_spent() {
                dropped_fresh += 1;
                continue;
            }
            batch.push((entry.outpoint.clone(), entry.coin.clone()));
        }
        let written = batch.len();
        self.backend.batch_write(batch, self.best_block)?;
        tracing::debug!(written, dropped_fresh, "flushed coins cache");
        self.deallocate();
        Ok(())
    }

    /// Persist all dirty entries like [`flush`](Self::flush), but keep
    /// the cache populated and clear only the dirty bookkeeping.
    ///
    /// For periodic write-back where dropping the hot working set would
    /// cost more than the memory it frees.
    ///
    /// # Errors
    ///
    /// Same contract as [`flush`](Self::flush); on a backend failure all
    /// dirty state is preserved.
    pub fn sync(&mut self) -> Result<(), LodeError> {
        if self.best_block.is_zero() {
            return Err(CoinsError::BestBlockUnset.into());
        }
        let mut batch = Vec::new();
        for index in self.arena.dirty_iter() {
            let entry = self.arena.entry(index);
            if entry.is_fresh() && entry.coin.is_spent() {
                continue;
            }
            batch.push((entry.outpoint.clone(), entry.coin.clone()));
        }
        let written = batch.len();
        self.backend.batch_write(batch, self.best_block)?;
        tracing::debug!(written, "synced coins cache");

        // Unlink from the head until the list self-references again. The
        // entries now mirror the store, so they stay cached as clean.
        let mut head = self.arena.next(SENTINEL);
        while head != SENTINEL {
            let next = self.arena.next(head);
            self.arena.set_clean(SENTINEL, head);
            head = next;
        }
        Ok(())
    }

    /// Drop all entries and bookkeeping, staying bound to the same
    /// backing view. Nothing is written: dirty state is discarded.
    pub fn reset(&mut self) {
        self.deallocate();
        self.best_block = Hash256::ZERO;
    }

    /// Release entry storage outright. Clearing the map in place would
    /// keep its capacity counted against the memory budget.
    fn deallocate(&mut self) {
        self.map = HashMap::new();
        self.arena.clear();
        self.cached_coins_usage = 0;
    }

    /// Running estimate of this cache's memory footprint in bytes.
    ///
    /// Maintained incrementally on every insert, overwrite, and spend —
    /// block-connection logic queries this after every transaction, so a
    /// traversal here would dominate validation time.
    pub fn dynamic_memory_usage(&self) -> usize {
        let map_overhead = self.map.capacity()
            * (std::mem::size_of::<OutPoint>() + std::mem::size_of::<EntryIndex>() + std::mem::size_of::<u64>());
        map_overhead + self.arena.allocated_bytes() + self.cached_coins_usage
    }

    /// Stage the current footprint against a cache budget plus headroom
    /// the caller is willing to borrow (typically unused mempool space).
    pub fn size_state(&self, max_cache_bytes: usize, headroom_bytes: usize) -> CacheSizeState {
        let budget = max_cache_bytes.saturating_add(headroom_bytes);
        let usage = self.dynamic_memory_usage();
        if usage > budget {
            CacheSizeState::Critical
        } else if usage > budget / 100 * LARGE_CACHE_PERCENT {
            CacheSizeState::Large
        } else {
            CacheSizeState::Ok
        }
    }

    // --- Crate-internal plumbing shared with the ephemeral cache ---

    /// Index of the cached entry for `outpoint`, if any.
    pub(crate) fn entry_index(&self, outpoint: &OutPoint) -> Option<EntryIndex> {
        self.map.get(outpoint).copied()
    }

    /// The coin stored at a known entry index.
    pub(crate) fn coin_at(&self, index: EntryIndex) -> &Coin {
        &self.arena.entry(index).coin
    }

    /// Insert a clean (not dirty, not fresh) entry for a new outpoint.
    pub(crate) fn insert_clean(&mut self, outpoint: OutPoint, coin: Coin) -> EntryIndex {
        debug_assert!(!self.map.contains_key(&outpoint));
        self.cached_coins_usage += coin.dynamic_memory_usage();
        let index = self.arena.insert(outpoint.clone(), coin);
        self.map.insert(outpoint, index);
        index
    }

    /// Tombstone the entry at `index` if it holds an unspent coin.
    pub(crate) fn spend_entry(&mut self, index: EntryIndex) -> Option<Coin> {
        let (spent, usage) = {
            let entry = self.arena.entry_mut(index);
            if entry.coin.is_spent() {
                return None;
            }
            let usage = entry.coin.dynamic_memory_usage();
            (std::mem::replace(&mut entry.coin, Coin::new_spent()), usage)
        };
        self.cached_coins_usage -= usage;
        self.arena.set_dirty(index, false);
        Some(spent)
    }

    /// Dirty/fresh flags for a cached outpoint, for tests.
    #[cfg(test)]
    pub(crate) fn entry_flags(&self, outpoint: &OutPoint) -> Option<(bool, bool)> {
        let index = self.entry_index(outpoint)?;
        let entry = self.arena.entry(index);
        Some((entry.is_dirty(), entry.is_fresh()))
    }

    fn fetch_entry(&mut self, outpoint: &OutPoint) -> Result<EntryIndex, LodeError> {
        if let Some(&index) = self.map.get(outpoint) {
            return Ok(index);
        }
        let coin = self
            .backend
            .get_coin(outpoint)?
            .unwrap_or_else(Coin::new_spent);
        Ok(self.insert_clean(outpoint.clone(), coin))
    }
}

/// Shared, lockable handle to a [`CoinsCache`].
///
/// A shared cache is itself a coins view: lookups serve cached entries —
/// spent tombstones included, so a recorded spend stops the chain — and
/// fall through to the cache's own backing view otherwise, without
/// promoting anything into the cache. This is how the ephemeral per-block
/// view layers on the main cache.
#[derive(Clone)]
pub struct SharedCoinsCache {
    inner: Arc<RwLock<CoinsCache>>,
}

impl SharedCoinsCache {
    /// Wrap a cache for shared use.
    pub fn new(cache: CoinsCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    /// Lock the cache for reading.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, CoinsCache> {
        self.inner.read()
    }

    /// Lock the cache for writing.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, CoinsCache> {
        self.inner.write()
    }
}

impl CoinsView for SharedCoinsCache {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
        let cache = self.inner.read();
        if let Some(coin) = cache.cached_coin(outpoint) {
            return Ok(Some(coin.clone()));
        }
        cache.backend().get_coin(outpoint)
    }

    fn batch_write(
        &self,
        coins: Vec<(OutPoint, Coin)>,
        best_block: Hash256,
    ) -> Result<(), LodeError> {
        let mut cache = self.inner.write();
        for (outpoint, coin) in coins {
            if coin.is_spent() {
                cache.spend_coin(&outpoint)?;
            } else {
                cache.add_coin(outpoint, coin, true)?;
            }
        }
        cache.set_best_block(best_block);
        Ok(())
    }

    fn best_block(&self) -> Result<Hash256, LodeError> {
        Ok(self.inner.read().best_block())
    }
}
