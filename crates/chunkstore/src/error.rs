//! Error taxonomy for the chunk store.

use thiserror::Error;

use crate::address::Address;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Absent from the tier that was asked. From a MemStore this just means
    /// "try the next tier"; from a DbStore or LocalStore it is final.
    #[error("chunk not found: {0}")]
    NotFound(Address),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to decrypt chunk {0}: missing or invalid key")]
    Decryption(Address),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("corrupt tree at chunk {address}: {reason}")]
    CorruptTree { address: Address, reason: String },

    #[error("stored chunk {0} does not match its address")]
    InvalidChunk(Address),

    #[error("input ended after {read} of {expected} bytes")]
    UnexpectedEof { read: u64, expected: u64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Cancelled or past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Cancelled | StoreError::DeadlineExceeded)
    }

    pub(crate) fn corrupt(address: Address, reason: impl Into<String>) -> Self {
        StoreError::CorruptTree {
            address,
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
