//! Segment files.
//!
//! A binlog is split into numbered segment files named `<base>.<number>`:
//! - Rotation: a new segment is started once the tail reaches capacity
//! - Addressing: record offsets are local to their segment
//! - Indexing: each segment keeps the byte span of every frame it holds,
//!   rebuilt from frame headers when the segment is opened

use crate::address::{RecordAddress, SegmentNumber};
use crate::error::BinlogError;
use crate::frame::{declared_len, frame_size, Frame, LogItem, LENGTH_PREFIX_SIZE};
use crate::lease::{HandlePool, LeaseConfig};
use crate::DEFAULT_BLOCK_SIZE;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Segment file name format: `<base>.<number>` (decimal, no padding).
pub fn segment_filename(base: &str, number: SegmentNumber) -> String {
    format!("{}.{}", base, number)
}

/// Parse a segment number from a file name belonging to `base`.
pub fn parse_segment_filename(base: &str, name: &str) -> Option<SegmentNumber> {
    let digits = name.strip_prefix(base)?.strip_prefix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let number: u64 = digits.parse().ok()?;
    (number <= RecordAddress::MAX_SEGMENT as u64).then_some(number as SegmentNumber)
}

/// Byte range `[start, end)` occupied by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    pub start: u64,
    pub end: u64,
}

impl FrameSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A single binlog segment file.
pub struct Segment {
    number: SegmentNumber,
    pool: HandlePool,
    /// Bytes on disk; only grows while the segment is open.
    size: AtomicU64,
    /// Serializes seek + write + publish for appends.
    append_lock: Mutex<()>,
    /// Spans of well-formed frames, ordered by offset.
    index: RwLock<Vec<FrameSpan>>,
    /// Trailing bytes cut at open because they did not form a complete frame.
    torn_bytes: u64,
    block_size: usize,
    /// Appends registered through `begin_write` and not yet finished.
    writers: AtomicUsize,
}

impl Segment {
    /// Opens segment `number` of `base` in `dir`.
    ///
    /// A missing file is treated as an empty segment; it is created by the
    /// first append.
    pub fn open(
        dir: &Path,
        base: &str,
        number: SegmentNumber,
        lease: LeaseConfig,
    ) -> Result<Self, BinlogError> {
        let path = dir.join(segment_filename(base, number));
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut segment = Self {
            number,
            pool: HandlePool::new(path, lease),
            size: AtomicU64::new(size),
            append_lock: Mutex::new(()),
            index: RwLock::new(Vec::new()),
            torn_bytes: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            writers: AtomicUsize::new(0),
        };

        if size > 0 {
            let (spans, torn) = segment.scan_spans(size)?;
            if torn > 0 {
                let valid = size - torn;
                segment.truncate_at(valid)?;
                tracing::warn!(
                    "Truncated segment {} at offset {} (removed {} bytes)",
                    segment.path().display(),
                    valid,
                    torn
                );
            }
            segment.torn_bytes = torn;
            *segment.index.get_mut() = spans;
        }

        tracing::debug!(
            "Opened segment {} (size={}, frames={})",
            number,
            segment.size(),
            segment.frame_count()
        );
        Ok(segment)
    }

    /// Walks frame headers from the start of the file.
    fn scan_spans(&self, size: u64) -> Result<(Vec<FrameSpan>, u64), BinlogError> {
        let lease = self.pool.acquire()?;
        let mut reader = BufReader::new(&*lease);
        reader.seek(SeekFrom::Start(0))?;

        let mut spans = Vec::new();
        let mut pos = 0u64;
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];

        while pos + LENGTH_PREFIX_SIZE as u64 <= size {
            reader.read_exact(&mut prefix)?;
            let payload_len = match declared_len(&prefix) {
                Ok(len) => len,
                Err(_) => break,
            };
            let end = pos + frame_size(payload_len) as u64;
            if end > size {
                break;
            }
            spans.push(FrameSpan { start: pos, end });
            reader.seek_relative((end - pos) as i64 - LENGTH_PREFIX_SIZE as i64)?;
            pos = end;
        }

        Ok((spans, size - pos))
    }

    /// Cuts the file back to `offset`, dropping an incomplete trailing frame.
    fn truncate_at(&self, offset: u64) -> Result<(), BinlogError> {
        let lease = self.pool.acquire()?;
        lease.set_len(offset)?;
        lease.sync()?;
        self.size.store(offset, Ordering::Release);
        Ok(())
    }

    /// Returns the segment number.
    pub fn number(&self) -> SegmentNumber {
        self.number
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    /// Returns the current size of the segment.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Returns whether the segment has reached `capacity`.
    pub fn is_full(&self, capacity: u64) -> bool {
        self.size() >= capacity
    }

    /// Returns the number of indexed frames.
    pub fn frame_count(&self) -> usize {
        self.index.read().len()
    }

    /// Returns the bytes past the last complete frame cut when opening.
    pub fn torn_bytes(&self) -> u64 {
        self.torn_bytes
    }

    /// Registers an append in progress until the returned guard is dropped.
    pub(crate) fn begin_write(self: &Arc<Self>) -> WriteGuard {
        self.writers.fetch_add(1, Ordering::SeqCst);
        WriteGuard {
            segment: Arc::clone(self),
        }
    }

    /// Returns the number of appends registered and still running.
    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Appends an encoded frame and returns the address of its end.
    ///
    /// With `fsync`, the call returns only after the data reached stable
    /// storage. A failed write is rolled back so the file never keeps a
    /// partial frame from this process.
    pub fn append(&self, frame: &[u8], fsync: bool) -> Result<RecordAddress, BinlogError> {
        let mut lease = self.pool.acquire()?;
        let _guard = self.append_lock.lock();

        let start = lease.seek(SeekFrom::End(0))?;
        let end = start + frame.len() as u64;
        let address = RecordAddress::new(self.number, end)?;

        if let Err(e) = write_frame(&mut lease, frame, fsync) {
            if let Err(rollback) = lease.set_len(start) {
                tracing::warn!(
                    "Failed to roll back partial frame in {} at {}: {}",
                    self.path().display(),
                    start,
                    rollback
                );
            }
            return Err(e.into());
        }

        self.index.write().push(FrameSpan { start, end });
        self.size.store(end, Ordering::Release);
        Ok(address)
    }

    /// Syncs the segment to disk.
    pub fn sync(&self) -> Result<(), BinlogError> {
        if self.size() == 0 {
            return Ok(());
        }
        let lease = self.pool.acquire()?;
        lease.sync()?;
        Ok(())
    }

    /// Reads up to `max_len` bytes starting at `offset`. Short at end of file.
    pub fn read_block(&self, offset: u64, max_len: usize) -> Result<Vec<u8>, BinlogError> {
        let mut lease = self.pool.acquire()?;
        lease.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(max_len);
        read_into(&lease, max_len, &mut buf)?;
        Ok(buf)
    }

    /// Reads the frame ending at `end`.
    pub fn read_frame(&self, end: u64) -> Result<LogItem, BinlogError> {
        let address = RecordAddress::new(self.number, end)?;
        let span = self
            .find_span(end)
            .ok_or(BinlogError::RecordNotFound(address))?;
        self.read_span(span)
    }

    /// Reads and validates the frame occupying `span`.
    pub fn read_span(&self, span: FrameSpan) -> Result<LogItem, BinlogError> {
        let address = RecordAddress::new(self.number, span.end)?;
        let mut lease = self.pool.acquire()?;
        lease.seek(SeekFrom::Start(span.start))?;

        let mut buf = Vec::with_capacity(self.block_size);
        read_into(&lease, self.block_size, &mut buf)?;

        let payload_len =
            declared_len(&buf).map_err(|e| BinlogError::corrupt(address, e.to_string()))?;
        let total = frame_size(payload_len);
        if total as u64 != span.len() {
            return Err(BinlogError::corrupt(
                address,
                format!(
                    "declared frame size {} does not match indexed span of {} bytes",
                    total,
                    span.len()
                ),
            ));
        }

        while buf.len() < total {
            let held = buf.len();
            read_into(&lease, total - held, &mut buf)?;
            if buf.len() == held {
                return Err(BinlogError::corrupt(
                    address,
                    format!("end of file after {} of {} bytes", held, total),
                ));
            }
        }

        let frame =
            Frame::decode(&buf[..total]).map_err(|e| BinlogError::corrupt(address, e.to_string()))?;
        if !frame.is_intact() {
            return Err(BinlogError::corrupt(
                address,
                format!(
                    "marker mismatch (leading {:#x}, trailing {:#x})",
                    frame.leading_marker, frame.trailing_marker
                ),
            ));
        }

        Ok(LogItem::from_frame(address, span.start, frame))
    }

    /// Returns the span of the frame ending exactly at `end`.
    pub fn find_span(&self, end: u64) -> Option<FrameSpan> {
        let index = self.index.read();
        index
            .binary_search_by_key(&end, |span| span.end)
            .ok()
            .map(|i| index[i])
    }

    /// Returns the first frame ending after `offset`.
    pub fn next_span_after(&self, offset: u64) -> Option<FrameSpan> {
        let index = self.index.read();
        let i = index.partition_point(|span| span.end <= offset);
        index.get(i).copied()
    }

    /// Returns a copy of every indexed span.
    pub fn spans(&self) -> Vec<FrameSpan> {
        self.index.read().clone()
    }

    /// Releases the segment's handles. Safe to call more than once.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// An append registered on a segment. The frame is indexed before the
/// guard is dropped.
pub(crate) struct WriteGuard {
    segment: Arc<Segment>,
}

impl Deref for WriteGuard {
    type Target = Arc<Segment>;

    fn deref(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.segment.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists the segment numbers of `base` in a directory, sorted ascending.
    pub fn list_segments(dir: &Path, base: &str) -> Result<Vec<SegmentNumber>, BinlogError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(number) = parse_segment_filename(base, &name) {
                segments.push(number);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }
}

fn write_frame(file: &mut File, frame: &[u8], fsync: bool) -> std::io::Result<()> {
    file.write_all(frame)?;
    if fsync {
        file.sync_data()?;
    }
    Ok(())
}

/// Appends up to `max_len` bytes from the handle's position to `buf`.
fn read_into(file: &File, max_len: usize, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    file.take(max_len as u64).read_to_end(buf)
}
