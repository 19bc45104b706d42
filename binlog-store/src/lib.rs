//! # binlog-store
//!
//! Segmented binary log for binlog.
//!
//! This crate provides a durable, append-only record store with:
//! - Self-validating frames (duplicated leading/trailing markers)
//! - Rotating fixed-capacity segment files
//! - 64-bit record addresses packing segment number and byte offset
//! - Bounded per-segment file handle leasing
//! - Sequential consumers and an integrity scan

pub mod address;
pub mod error;
pub mod frame;
pub mod lease;
pub mod manager;
pub mod reader;
pub mod segment;
pub mod verify;

pub use address::{RecordAddress, SegmentNumber};
pub use error::BinlogError;
pub use frame::{Frame, LogItem};
pub use lease::{HandleLease, HandlePool, LeaseConfig};
pub use manager::{BinlogConfig, BinlogStats, LogManager};
pub use reader::LogReader;
pub use segment::Segment;
pub use verify::{CorruptFrame, VerifyReport};

/// Default segment capacity before rotation (1 GiB).
pub const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Size of the first block read when fetching a record (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = 21;

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, BinlogError>;
