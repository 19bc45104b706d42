//! Binlog error types.

use crate::address::RecordAddress;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during binlog operations.
#[derive(Debug, Error)]
pub enum BinlogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable at {}: {reason}", path.display())]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("address out of range: segment {segment}, offset {offset}")]
    AddressOutOfRange { segment: u64, offset: u64 },

    #[error("record not found: {0}")]
    RecordNotFound(RecordAddress),

    #[error("record {address} corrupted: {reason}")]
    CorruptRecord {
        address: RecordAddress,
        reason: String,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("no file handle available for {} ({limit} leases outstanding)", path.display())]
    LeaseExhausted { path: PathBuf, limit: usize },

    #[error("binlog is closed")]
    Closed,
}

impl BinlogError {
    /// Returns whether this error is retryable.
    ///
    /// Retrying an append after an `Io` error may leave a duplicate frame
    /// behind the torn one; that policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BinlogError::Io(_) | BinlogError::LeaseExhausted { .. })
    }

    pub(crate) fn corrupt(address: RecordAddress, reason: impl Into<String>) -> Self {
        BinlogError::CorruptRecord {
            address,
            reason: reason.into(),
        }
    }
}
