//! Backing-view interface for coin storage layers.
//!
//! Provides the [`CoinsView`] trait that every coin source implements: the
//! durable store (lode-store), the in-memory write-back cache (lode-coins),
//! and the [`MemoryCoinsView`] test double defined here. Views layer:
//! a cache's miss path falls through to whatever view sits beneath it.
//!
//! Lookups are fallible only for I/O reasons. "Not found" is `Ok(None)`,
//! and a view MAY return a spent tombstone for an outpoint it knows was
//! consumed — callers must check [`Coin::is_spent`] rather than assume
//! `Some` means spendable. Surfacing tombstones is what lets a stacked
//! cache stop a lookup chain before it reaches a backing store that has
//! not seen the spend yet.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::LodeError;
use crate::types::{Coin, Hash256, OutPoint};

/// Read/write interface to a coin storage layer.
///
/// All methods take `&self`: implementations are expected to be usable from
/// multiple reader threads at once (the input fetcher probes the backing
/// view from its worker pool), so mutation goes through interior
/// mutability or a natively thread-safe handle.
pub trait CoinsView: Send + Sync {
    /// Look up the coin for an outpoint.
    ///
    /// Returns `Ok(None)` when the view has never heard of the outpoint.
    /// May return a spent tombstone; callers must check `is_spent()`.
    ///
    /// # Errors
    ///
    /// [`LodeError::Storage`] on an I/O failure. Prefetch paths degrade
    /// this to "not found"; consensus paths propagate it.
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError>;

    /// Persist a batch of coin mutations atomically.
    ///
    /// A spent coin in the batch deletes the outpoint from the view; an
    /// unspent coin upserts it. The best-block marker is advanced in the
    /// same batch so a crash cannot separate the two.
    fn batch_write(
        &self,
        coins: Vec<(OutPoint, Coin)>,
        best_block: Hash256,
    ) -> Result<(), LodeError>;

    /// Hash of the block up to which this view's coin set is complete.
    ///
    /// `Hash256::ZERO` for a view that has never been written to.
    fn best_block(&self) -> Result<Hash256, LodeError>;
}

/// In-memory coins view for tests.
///
/// Stores everything in a `HashMap` behind a `RwLock` with no persistence.
/// Spent tombstones written via [`CoinsView::batch_write`] delete the entry,
/// matching the durable store's behavior.
#[derive(Default)]
pub struct MemoryCoinsView {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    coins: HashMap<OutPoint, Coin>,
    best_block: Hash256,
}

impl MemoryCoinsView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an unspent coin directly, bypassing batch semantics.
    pub fn put_coin(&self, outpoint: OutPoint, coin: Coin) {
        self.inner.write().coins.insert(outpoint, coin);
    }

    /// Number of coins currently stored.
    pub fn coin_count(&self) -> usize {
        self.inner.read().coins.len()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
        Ok(self.inner.read().coins.get(outpoint).cloned())
    }

    fn batch_write(
        &self,
        coins: Vec<(OutPoint, Coin)>,
        best_block: Hash256,
    ) -> Result<(), LodeError> {
        let mut inner = self.inner.write();
        for (outpoint, coin) in coins {
            if coin.is_spent() {
                inner.coins.remove(&outpoint);
            } else {
                inner.coins.insert(outpoint, coin);
            }
        }
        inner.best_block = best_block;
        Ok(())
    }

    fn best_block(&self) -> Result<Hash256, LodeError> {
        Ok(self.inner.read().best_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxOutput;

    fn coin(value: u64) -> Coin {
        Coin::new(
            TxOutput { value, script_pubkey: vec![0x51; 10] },
            1,
            false,
        )
    }

    fn outpoint(tag: u8) -> OutPoint {
        OutPoint::new(Hash256([tag; 32]), 0)
    }

    #[test]
    fn get_coin_absent_is_none() {
        let view = MemoryCoinsView::new();
        assert!(view.get_coin(&outpoint(1)).unwrap().is_none());
    }

    #[test]
    fn batch_write_upserts_and_deletes() {
        let view = MemoryCoinsView::new();
        view.put_coin(outpoint(1), coin(5));

        let best = Hash256([0xBB; 32]);
        view.batch_write(
            vec![
                (outpoint(1), Coin::new_spent()),
                (outpoint(2), coin(7)),
            ],
            best,
        )
        .unwrap();

        assert!(view.get_coin(&outpoint(1)).unwrap().is_none());
        let fetched = view.get_coin(&outpoint(2)).unwrap().unwrap();
        assert_eq!(fetched.output.value, 7);
        assert_eq!(view.best_block().unwrap(), best);
        assert_eq!(view.coin_count(), 1);
    }

    #[test]
    fn best_block_defaults_to_zero() {
        let view = MemoryCoinsView::new();
        assert_eq!(view.best_block().unwrap(), Hash256::ZERO);
    }
}
