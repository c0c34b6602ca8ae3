//! Store and cache-budget configuration.
//!
//! Provides [`StoreConfig`] with defaults for the data directory, the
//! coins-cache memory budget, and the input-fetch worker pool. Values can
//! be customized programmatically or loaded from a config file in the
//! future.

use std::path::PathBuf;

use lode_core::constants::{DEFAULT_COINS_CACHE_BYTES, MIB};

/// Configuration for the durable store and its caching layers.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Memory budget for the in-memory coins cache, in bytes.
    pub coins_cache_bytes: usize,
    /// Extra headroom the cache may borrow before reporting Critical,
    /// typically unused mempool budget.
    pub mempool_headroom_bytes: usize,
    /// Worker threads for the block-input fetcher. Zero disables
    /// prefetching; callers then resolve inputs inline.
    pub fetch_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lode");

        Self {
            data_dir,
            coins_cache_bytes: DEFAULT_COINS_CACHE_BYTES,
            mempool_headroom_bytes: 64 * MIB,
            fetch_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl StoreConfig {
    /// Path to the RocksDB coins database directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("coins")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_budget() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.coins_cache_bytes, DEFAULT_COINS_CACHE_BYTES);
    }

    #[test]
    fn default_data_dir_ends_with_lode() {
        let cfg = StoreConfig::default();
        assert!(
            cfg.data_dir.ends_with("lode"),
            "data_dir should end with 'lode': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn default_has_at_least_one_fetch_worker() {
        let cfg = StoreConfig::default();
        assert!(cfg.fetch_workers >= 1);
    }

    #[test]
    fn db_path_appends_coins() {
        let cfg = StoreConfig {
            data_dir: PathBuf::from("/tmp/lode-test"),
            ..StoreConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/lode-test/coins"));
    }

    #[test]
    fn config_is_clone_and_debug() {
        let cfg = StoreConfig::default();
        let cfg2 = cfg.clone();
        let debug = format!("{cfg2:?}");
        assert!(debug.contains("StoreConfig"));
    }
}
