//! RocksDB-backed persistent coins view.
//!
//! Implements [`CoinsView`] using RocksDB column families for coins and
//! metadata. All mutations go through one atomic [`WriteBatch`] per flush
//! so a crash can never separate coin updates from the best-block marker.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

use lode_core::error::LodeError;
use lode_core::types::{Coin, Hash256, OutPoint};
use lode_core::view::CoinsView;

// --- Column family names ---

const CF_COINS: &str = "coins";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_COINS, CF_METADATA];

// --- Metadata keys ---

const META_BEST_BLOCK: &[u8] = b"best_block";

/// RocksDB-backed persistent coins view.
///
/// Coins are keyed by `txid || output index` (36 bytes) and stored as
/// bincode. Spent coins in a batch delete the key: the store only ever
/// holds unspent outputs.
pub struct RocksCoinsStore {
    db: DB,
}

impl RocksCoinsStore {
    /// Open or create a coins database at the given path.
    ///
    /// Creates all column families if they don't exist.
    ///
    /// # Errors
    ///
    /// [`LodeError::Storage`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LodeError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| LodeError::Storage(e.to_string()))?;

        tracing::info!(path = %path.as_ref().display(), "opened coins store");
        Ok(Self { db })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), LodeError> {
        self.db
            .flush()
            .map_err(|e| LodeError::Storage(e.to_string()))
    }

    /// Number of coins currently stored. Full scan; test and tooling use
    /// only.
    pub fn coin_count(&self) -> Result<usize, LodeError> {
        let cf = self.cf_handle(CF_COINS)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start).count())
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, LodeError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LodeError::Storage(format!("missing column family: {name}")))
    }

    /// Fixed 36-byte coin key: txid followed by the little-endian index.
    fn coin_key(outpoint: &OutPoint) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(outpoint.txid.as_bytes());
        key[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        key
    }

    fn encode_coin(coin: &Coin) -> Result<Vec<u8>, LodeError> {
        bincode::encode_to_vec(coin, bincode::config::standard())
            .map_err(|e| LodeError::Storage(e.to_string()))
    }

    fn decode_coin(bytes: &[u8]) -> Result<Coin, LodeError> {
        let (coin, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LodeError::Storage(e.to_string()))?;
        Ok(coin)
    }
}

impl CoinsView for RocksCoinsStore {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
        let cf = self.cf_handle(CF_COINS)?;
        match self
            .db
            .get_cf(cf, Self::coin_key(outpoint))
            .map_err(|e| LodeError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(Self::decode_coin(&bytes)?)),
            None => Ok(None),
        }
    }

    fn batch_write(
        &self,
        coins: Vec<(OutPoint, Coin)>,
        best_block: Hash256,
    ) -> Result<(), LodeError> {
        let cf_coins = self.cf_handle(CF_COINS)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let count = coins.len();
        for (outpoint, coin) in coins {
            let key = Self::coin_key(&outpoint);
            if coin.is_spent() {
                batch.delete_cf(cf_coins, key);
            } else {
                batch.put_cf(cf_coins, key, Self::encode_coin(&coin)?);
            }
        }
        batch.put_cf(cf_meta, META_BEST_BLOCK, best_block.as_bytes());

        self.db
            .write(batch)
            .map_err(|e| LodeError::Storage(e.to_string()))?;
        tracing::debug!(count, best_block = %best_block, "wrote coin batch");
        Ok(())
    }

    fn best_block(&self) -> Result<Hash256, LodeError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self
            .db
            .get_cf(cf, META_BEST_BLOCK)
            .map_err(|e| LodeError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Hash256(hash))
            }
            Some(_) => Err(LodeError::Storage("invalid best block length".into())),
            None => Ok(Hash256::ZERO),
        }
    }
}
