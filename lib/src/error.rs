use std::path::PathBuf;

use thiserror::Error;

use crate::sha256::Hash;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("ledger already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot open ledger store: {0}")]
    StoreFatal(String),

    #[error("ledger store i/o failed: {0}")]
    StoreIo(#[from] sled::Error),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("failed to serialise {0}")]
    Serialization(String),

    #[error("proof-of-work nonce search exhausted")]
    ExhaustedSearchSpace,

    #[error("chain tip moved to {0} during commit")]
    StaleTip(Hash),

    #[error("block {hash} rejected: {reason}")]
    InvalidBlock { hash: Hash, reason: String },

    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("external service failed: {0}")]
    ExternalService(String),

    #[error("cannot listen on {address}: {source}")]
    Listen {
        address: String,
        source: std::io::Error,
    },

    #[error("network i/o failed: {0}")]
    Network(#[from] std::io::Error),

    #[error("message of {0} bytes exceeds frame limit")]
    MessageTooLarge(u64),
}

pub type Result<T> = std::result::Result<T, ChainError>;
