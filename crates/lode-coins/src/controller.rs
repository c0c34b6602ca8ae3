//! Ephemeral per-block coin view with scoped rollback.
//!
//! [`AsyncCoinsCache`] specializes the write-back cache for block
//! connection: before serial validation starts, it pre-resolves every
//! input of the block from the backing chain (parent cache, then store)
//! into a per-input slot list, filtering out inputs created inside the
//! block itself via sorted short txids. The miss path then consumes those
//! slots in block order instead of promoting anything into the layers
//! beneath, so the whole view can be discarded if the block turns out to
//! be invalid.
//!
//! [`AsyncCacheController`] owns one such cache and hands out a single
//! scope-bound [`CacheHandle`] at a time; dropping the handle
//! unconditionally resets the cache, which is how a failed connection
//! attempt is prevented from leaking coin state into the next one. The
//! exclusive borrow makes a second concurrent handle unrepresentable.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use lode_core::error::LodeError;
use lode_core::types::{Block, Coin, OutPoint};
use lode_core::view::CoinsView;

use crate::cache::{CacheSizeState, CoinsCache};

/// Canonical absent-coin result. Callers check [`Coin::is_spent`].
static TOMBSTONE: Coin = Coin::new_spent();

/// One block input awaiting consumption.
struct InputSlot {
    outpoint: OutPoint,
    /// Resolved during [`AsyncCoinsCache::start_fetching`]; taken by the
    /// first access. May hold a spent tombstone fetched from a parent
    /// cache — the consume path re-checks.
    coin: Option<Coin>,
}

/// Ephemeral coin cache that serves a single block connection attempt.
///
/// Lookups hit, in order: entries already materialized here, the
/// prefetched input slots, and finally the backing chain directly. Missing
/// or spent coins never create entries, so the cache size counts exactly
/// the coins the block can actually consume.
pub struct AsyncCoinsCache {
    cache: CoinsCache,
    inputs: Vec<InputSlot>,
    /// First slot not yet consumed. Block connection touches inputs in
    /// block order, so consumption only ever scans forward.
    tail: usize,
    /// Sorted first-8-byte ids of the block's transactions. A match means
    /// the input spends an output created inside this block (or collides
    /// with one — the consume path's fallback probe disambiguates).
    short_txids: Vec<u64>,
}

impl AsyncCoinsCache {
    /// Create an empty ephemeral cache over the given backing chain.
    pub fn new(backend: Arc<dyn CoinsView>) -> Self {
        Self {
            cache: CoinsCache::new(backend),
            inputs: Vec::new(),
            tail: 0,
            short_txids: Vec::new(),
        }
    }

    /// Pre-resolve every input of `block` on the calling thread.
    ///
    /// Inputs matching a block transaction's short txid are left
    /// unresolved — they exist nowhere outside the block. Backing-chain
    /// failures are logged and deferred to the access path rather than
    /// failing the whole prefetch.
    ///
    /// # Errors
    ///
    /// Only transaction-id serialization failures propagate.
    pub fn start_fetching(&mut self, block: &Block) -> Result<(), LodeError> {
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                self.inputs.push(InputSlot {
                    outpoint: input.previous_output.clone(),
                    coin: None,
                });
            }
            self.short_txids.push(tx.txid()?.short_id());
        }
        if self.inputs.is_empty() {
            return Ok(());
        }
        self.short_txids.sort_unstable();

        for i in 0..self.inputs.len() {
            let outpoint = self.inputs[i].outpoint.clone();
            if self.short_txids.binary_search(&outpoint.txid.short_id()).is_ok() {
                continue;
            }
            match self.cache.backend().get_coin(&outpoint) {
                Ok(coin) => self.inputs[i].coin = coin,
                Err(e) => {
                    tracing::warn!(%outpoint, error = %e, "input prefetch failed, deferring to access path");
                }
            }
        }
        Ok(())
    }

    /// Look up a coin for this block, materializing it in the ephemeral
    /// cache.
    ///
    /// Returns a spent tombstone when nothing unspent exists anywhere; no
    /// entry is created in that case.
    ///
    /// # Errors
    ///
    /// Propagates backing-chain I/O failures from the fallback probe.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<&Coin, LodeError> {
        match self.fetch_entry(outpoint)? {
            Some(index) => Ok(self.cache.coin_at(index)),
            None => Ok(&TOMBSTONE),
        }
    }

    /// Mark the coin for `outpoint` as spent within this block attempt.
    /// Returns the consumed coin, or `None` if nothing unspent was found.
    ///
    /// # Errors
    ///
    /// Propagates backing-chain I/O failures from the fallback probe.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
        match self.fetch_entry(outpoint)? {
            Some(index) => Ok(self.cache.spend_entry(index)),
            None => Ok(None),
        }
    }

    /// Insert a coin created by this block. See [`CoinsCache::add_coin`].
    ///
    /// # Errors
    ///
    /// Same contract as the underlying cache.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> Result<(), LodeError> {
        self.cache.add_coin(outpoint, coin, possible_overwrite)
    }

    /// Whether an unspent coin is materialized for `outpoint`.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.cache.have_coin_in_cache(outpoint)
    }

    /// The coin materialized for `outpoint`, spent or not.
    pub fn cached_coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.cache.cached_coin(outpoint)
    }

    /// Number of materialized entries.
    pub fn cache_size(&self) -> usize {
        self.cache.cache_size()
    }

    /// Memory footprint estimate of the ephemeral state.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.cache.dynamic_memory_usage()
    }

    /// Stage the footprint against a budget. See [`CoinsCache::size_state`].
    pub fn size_state(&self, max_cache_bytes: usize, headroom_bytes: usize) -> CacheSizeState {
        self.cache.size_state(max_cache_bytes, headroom_bytes)
    }

    /// Drop all materialized coins, prefetch slots, and filters.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.inputs.clear();
        self.tail = 0;
        self.short_txids.clear();
    }

    fn set_backend(&mut self, backend: Arc<dyn CoinsView>) {
        self.cache.set_backend(backend);
    }

    /// Take the prefetched coin for `outpoint`, scanning forward from the
    /// last consumed slot.
    fn take_prefetched(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        for i in self.tail..self.inputs.len() {
            if self.inputs[i].outpoint == *outpoint {
                self.tail = i + 1;
                return self.inputs[i].coin.take();
            }
        }
        None
    }

    fn fetch_entry(&mut self, outpoint: &OutPoint) -> Result<Option<crate::entry::EntryIndex>, LodeError> {
        if let Some(index) = self.cache.entry_index(outpoint) {
            return Ok(Some(index));
        }
        let coin = match self.take_prefetched(outpoint) {
            Some(coin) if !coin.is_spent() => coin,
            // Unresolved slot (in-block output, short-id collision, or a
            // prefetch error), a spent prefetch, or an outpoint that was
            // never a block input: one direct probe of the backing chain.
            _ => match self.cache.backend().get_coin(outpoint)? {
                Some(coin) if !coin.is_spent() => coin,
                _ => return Ok(None),
            },
        };
        Ok(Some(self.cache.insert_clean(outpoint.clone(), coin)))
    }
}

/// Owns one ephemeral cache and issues scope-bound handles to it.
pub struct AsyncCacheController {
    cache: AsyncCoinsCache,
}

impl AsyncCacheController {
    /// Create a controller over the given backing chain.
    pub fn new(backend: Arc<dyn CoinsView>) -> Self {
        Self {
            cache: AsyncCoinsCache::new(backend),
        }
    }

    /// Hand out the cache without prefetching anything.
    pub fn start(&mut self) -> CacheHandle<'_> {
        CacheHandle {
            cache: &mut self.cache,
        }
    }

    /// Prefetch `block`'s inputs, then hand out the cache.
    ///
    /// # Errors
    ///
    /// Transaction-id serialization failures; the cache is reset before
    /// the error is returned so no partial prefetch state survives.
    pub fn start_fetching(&mut self, block: &Block) -> Result<CacheHandle<'_>, LodeError> {
        if let Err(e) = self.cache.start_fetching(block) {
            self.cache.reset();
            return Err(e);
        }
        Ok(CacheHandle {
            cache: &mut self.cache,
        })
    }

    /// Repoint the underlying backing chain, e.g. after a reorg swaps the
    /// chainstate views. Cannot race a live handle: issuing one borrows
    /// the controller exclusively.
    pub fn set_backend(&mut self, backend: Arc<dyn CoinsView>) {
        self.cache.set_backend(backend);
    }
}

/// Scope-bound access to the controller's cache.
///
/// Dereferences to [`AsyncCoinsCache`]; on drop the cache is
/// unconditionally reset, on every exit path. Letting the handle fall out
/// of scope is the whole error-handling story for a failed block
/// connection.
pub struct CacheHandle<'a> {
    cache: &'a mut AsyncCoinsCache,
}

impl Deref for CacheHandle<'_> {
    type Target = AsyncCoinsCache;

    fn deref(&self) -> &AsyncCoinsCache {
        self.cache
    }
}

impl DerefMut for CacheHandle<'_> {
    fn deref_mut(&mut self) -> &mut AsyncCoinsCache {
        self.cache
    }
}

impl Drop for CacheHandle<'_> {
    fn drop(&mut self) {
        self.cache.reset();
    }
}
