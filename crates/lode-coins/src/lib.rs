//! # lode-coins
//! The coin-cache engine: write-back [`CoinsCache`] with its intrusive
//! dirty-entry list, the worker-pool [`InputFetcher`] that pre-populates a
//! per-block scratch cache, and the [`AsyncCacheController`] handing out
//! scope-bound ephemeral cache handles that roll back on drop.

mod entry;

pub mod cache;
pub mod controller;
pub mod fetcher;

pub use cache::{CacheSizeState, CoinsCache, SharedCoinsCache, LARGE_CACHE_PERCENT};
pub use controller::{AsyncCacheController, AsyncCoinsCache, CacheHandle};
pub use fetcher::InputFetcher;
