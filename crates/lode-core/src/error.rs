//! Error types for the Lode coin engine.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("value overflow")] ValueOverflow,
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinsError {
    #[error("overwriting unspent coin: {0}")] OverwriteUnspent(String),
    #[error("adding spent coin: {0}")] AddSpentCoin(String),
    #[error("best block not set before flush")] BestBlockUnset,
}

#[derive(Error, Debug)]
pub enum LodeError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Coins(#[from] CoinsError),
    #[error("storage: {0}")] Storage(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
}
