//! Record frames.
//!
//! Each record has the following on-disk format (all integers little-endian):
//!
//! ```text
//! +----------+----------+-----------------+-----------+-----------------+
//! | status   | length   | leading marker  | payload   | trailing marker |
//! | 1 byte   | 4 bytes  | 8 bytes         | length    | 8 bytes         |
//! +----------+----------+-----------------+-----------+-----------------+
//! ```
//!
//! Both markers carry the same value, a nanosecond timestamp taken when the
//! frame was built. A frame whose markers differ was torn or overwritten.
//! Markers validate their own frame only; they do not order records.

use crate::address::RecordAddress;
use crate::error::BinlogError;
use crate::FRAME_OVERHEAD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes before the payload: status, length and leading marker.
pub const HEADER_SIZE: usize = 13;

/// Bytes needed to learn a frame's payload length.
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Maximum payload size (the length field is a signed 32-bit integer).
pub const MAX_PAYLOAD_SIZE: usize = i32::MAX as usize;

static LAST_MARKER: AtomicI64 = AtomicI64::new(0);

/// Returns a fresh marker: wall-clock nanoseconds, bumped to stay strictly
/// increasing within this process.
pub fn next_marker() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let mut last = LAST_MARKER.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.wrapping_add(1));
        match LAST_MARKER.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: i8,
    pub leading_marker: i64,
    pub trailing_marker: i64,
    pub payload: Bytes,
}

impl Frame {
    /// Encodes a payload into a frame stamped with a fresh marker.
    pub fn encode(payload: &[u8], status: i8) -> Result<BytesMut, BinlogError> {
        Self::encode_with_marker(payload, status, next_marker())
    }

    pub(crate) fn encode_with_marker(
        payload: &[u8],
        status: i8,
        marker: i64,
    ) -> Result<BytesMut, BinlogError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BinlogError::RecordTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.put_i8(status);
        buf.put_i32_le(payload.len() as i32);
        buf.put_i64_le(marker);
        buf.put_slice(payload);
        buf.put_i64_le(marker);
        Ok(buf)
    }

    /// Decodes a frame from the start of `buf`. Bytes past the frame are ignored.
    ///
    /// Marker equality is not checked here; see [`Frame::is_intact`].
    pub fn decode(buf: &[u8]) -> Result<Self, BinlogError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(BinlogError::MalformedFrame(format!(
                "{} bytes, need at least {}",
                buf.len(),
                FRAME_OVERHEAD
            )));
        }

        let payload_len = declared_len(buf)?;
        let total = frame_size(payload_len);
        if total > buf.len() {
            return Err(BinlogError::MalformedFrame(format!(
                "declared payload of {} bytes exceeds the {} bytes supplied",
                payload_len,
                buf.len()
            )));
        }

        let mut header = &buf[..HEADER_SIZE];
        let status = header.get_i8();
        header.advance(4);
        let leading_marker = header.get_i64_le();

        let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + payload_len]);
        let trailing_marker = (&buf[HEADER_SIZE + payload_len..total]).get_i64_le();

        Ok(Self {
            status,
            leading_marker,
            trailing_marker,
            payload,
        })
    }

    /// Returns whether the leading and trailing markers agree.
    pub fn is_intact(&self) -> bool {
        self.leading_marker == self.trailing_marker
    }

    /// Returns the total size of this frame on disk.
    pub fn disk_size(&self) -> usize {
        frame_size(self.payload.len())
    }
}

/// Reads the payload length from the first five bytes of a frame.
pub fn declared_len(buf: &[u8]) -> Result<usize, BinlogError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(BinlogError::MalformedFrame(format!(
            "{} bytes, need {} to read the length",
            buf.len(),
            LENGTH_PREFIX_SIZE
        )));
    }
    let len = (&buf[1..LENGTH_PREFIX_SIZE]).get_i32_le();
    if len < 0 {
        return Err(BinlogError::MalformedFrame(format!(
            "negative payload length {}",
            len
        )));
    }
    Ok(len as usize)
}

/// Total frame size for a payload of `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    /// Address the record was appended at.
    pub address: RecordAddress,
    /// Offset of the first frame byte within the segment.
    pub start: u64,
    pub status: i8,
    pub leading_marker: i64,
    pub trailing_marker: i64,
    pub payload: Bytes,
}

impl LogItem {
    pub(crate) fn from_frame(address: RecordAddress, start: u64, frame: Frame) -> Self {
        Self {
            address,
            start,
            status: frame.status,
            leading_marker: frame.leading_marker,
            trailing_marker: frame.trailing_marker,
            payload: frame.payload,
        }
    }
}
