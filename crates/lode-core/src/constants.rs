//! Protocol-wide constants.

/// Smallest unit conversion: 1 LODE = 10^8 lodes.
pub const COIN: u64 = 100_000_000;

/// Confirmations required before a coinbase output can be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// One mebibyte, for cache budget arithmetic.
pub const MIB: usize = 1024 * 1024;

/// Default in-memory coins cache budget in bytes.
pub const DEFAULT_COINS_CACHE_BYTES: usize = 450 * MIB;
