//! Record addresses.
//!
//! A record address packs the segment number and the byte offset at which
//! the record's frame ends into a single `u64`:
//!
//! ```text
//! 63                                            16 15            0
//! +-----------------------------------------------+---------------+
//! | offset after frame end (48 bits)              | segment (16)  |
//! +-----------------------------------------------+---------------+
//! ```
//!
//! This bounds a store to 65 536 segments and a segment to 256 TiB.

use crate::error::BinlogError;
use std::fmt;

/// Segment number (only the low 16 bits are addressable).
pub type SegmentNumber = u32;

/// Opaque handle returned by `append` and consumed by `get_by_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordAddress(u64);

impl RecordAddress {
    const SEGMENT_BITS: u64 = 16;
    const SEGMENT_MASK: u64 = (1 << Self::SEGMENT_BITS) - 1;

    /// Largest addressable segment number.
    pub const MAX_SEGMENT: SegmentNumber = Self::SEGMENT_MASK as SegmentNumber;
    /// Largest addressable byte offset (2^48 - 1).
    pub const MAX_OFFSET: u64 = (1 << (64 - Self::SEGMENT_BITS)) - 1;

    /// Packs a segment number and offset.
    pub fn new(segment: SegmentNumber, offset: u64) -> Result<Self, BinlogError> {
        if segment > Self::MAX_SEGMENT || offset > Self::MAX_OFFSET {
            return Err(BinlogError::AddressOutOfRange {
                segment: segment as u64,
                offset,
            });
        }
        Ok(Self((offset << Self::SEGMENT_BITS) | segment as u64))
    }

    pub fn segment(&self) -> SegmentNumber {
        (self.0 & Self::SEGMENT_MASK) as SegmentNumber
    }

    /// Offset immediately after the addressed frame.
    pub fn offset(&self) -> u64 {
        self.0 >> Self::SEGMENT_BITS
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Every `u64` decodes to some (segment, offset) pair; whether a record
    /// lives there is only known to the store.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl From<RecordAddress> for u64 {
    fn from(address: RecordAddress) -> Self {
        address.0
    }
}

impl fmt::Display for RecordAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.0, self.segment(), self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_layout() {
        let addr = RecordAddress::new(3, 100).unwrap();
        assert_eq!(addr.as_u64(), (100 << 16) | 3);
        assert_eq!(addr.segment(), 3);
        assert_eq!(addr.offset(), 100);
    }

    #[test]
    fn test_limits() {
        let addr = RecordAddress::new(RecordAddress::MAX_SEGMENT, RecordAddress::MAX_OFFSET).unwrap();
        assert_eq!(addr.as_u64(), u64::MAX);
        assert_eq!(addr.segment(), 65535);
        assert_eq!(addr.offset(), (1 << 48) - 1);
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            RecordAddress::new(65536, 0),
            Err(BinlogError::AddressOutOfRange { segment: 65536, .. })
        ));
        assert!(matches!(
            RecordAddress::new(0, 1 << 48),
            Err(BinlogError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn test_from_u64() {
        let addr = RecordAddress::from_u64((42 << 16) | 7);
        assert_eq!(addr.segment(), 7);
        assert_eq!(addr.offset(), 42);
        assert_eq!(u64::from(addr), (42 << 16) | 7);
    }

    #[test]
    fn test_display() {
        let addr = RecordAddress::new(1, 2).unwrap();
        assert_eq!(addr.to_string(), "131073 (1:2)");
    }
}
