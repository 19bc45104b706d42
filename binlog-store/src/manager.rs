//! Log manager: segment ownership, rotation and record routing.

use crate::address::{RecordAddress, SegmentNumber};
use crate::error::BinlogError;
use crate::frame::{Frame, LogItem};
use crate::lease::LeaseConfig;
use crate::reader::{Cursor, LogReader};
use crate::segment::{Segment, SegmentScanner, WriteGuard};
use crate::DEFAULT_CAPACITY;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Binlog configuration.
#[derive(Debug, Clone)]
pub struct BinlogConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Segment files are named `<base_name>.<number>`.
    pub base_name: String,
    /// Segment size that triggers rotation.
    pub capacity: u64,
    /// Whether [`LogManager::append`] fsyncs each record.
    pub sync_on_append: bool,
    /// Per-segment handle pool limits.
    pub lease: LeaseConfig,
}

impl BinlogConfig {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            capacity: DEFAULT_CAPACITY,
            sync_on_append: false,
            lease: LeaseConfig::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

/// I/O statistics for the binlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BinlogStats {
    /// Records appended.
    pub appends: u64,
    /// Frame bytes written.
    pub bytes_written: u64,
    /// Records read by address or by a consumer.
    pub reads: u64,
    /// Frame bytes read.
    pub bytes_read: u64,
    /// Explicit or per-append fsyncs.
    pub fsyncs: u64,
    /// Segment rotations.
    pub rotations: u64,
}

/// Segmented binary log.
///
/// Any number of threads may append and read concurrently. Appends to the
/// tail are serialized by the tail segment's lock; the manager-wide lock is
/// held only while deciding and performing a rotation. An append registers
/// on its segment first, and consumers do not move past a segment while an
/// append is registered on it.
///
/// Records appended without fsync can be lost on crash even though their
/// address was returned.
pub struct LogManager {
    config: BinlogConfig,
    capacity: AtomicU64,
    /// Every segment referenced so far, by number.
    segments: RwLock<BTreeMap<SegmentNumber, Arc<Segment>>>,
    head: SegmentNumber,
    tail: AtomicU32,
    rotate_lock: Mutex<()>,
    /// Shared consumer cursor used by `pop`.
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
    stats_appends: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_reads: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_rotations: AtomicU64,
}

impl LogManager {
    /// Opens or creates a binlog in the configured directory.
    pub fn open(config: BinlogConfig) -> Result<Self, BinlogError> {
        check_base_name(&config)?;
        ensure_writable(&config.dir)?;

        let numbers = SegmentScanner::list_segments(&config.dir, &config.base_name)?;
        let head = numbers.first().copied().unwrap_or(0);
        let tail = numbers.last().copied().unwrap_or(0);

        let manager = Self {
            capacity: AtomicU64::new(config.capacity),
            segments: RwLock::new(BTreeMap::new()),
            head,
            tail: AtomicU32::new(tail),
            rotate_lock: Mutex::new(()),
            cursor: Mutex::new(Cursor::at_start(head)),
            closed: AtomicBool::new(false),
            stats_appends: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_reads: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_rotations: AtomicU64::new(0),
            config,
        };

        manager.segment(head)?;
        let tail_size = manager.segment(tail)?.size();

        tracing::info!(
            "Binlog opened: {}/{}.{{{}..{}}}, tail size={}",
            manager.config.dir.display(),
            manager.config.base_name,
            head,
            tail,
            tail_size
        );

        Ok(manager)
    }

    /// Returns the segment with `number`, opening and caching it on first use.
    pub(crate) fn segment(&self, number: SegmentNumber) -> Result<Arc<Segment>, BinlogError> {
        if let Some(segment) = self.segments.read().get(&number) {
            return Ok(segment.clone());
        }

        let mut segments = self.segments.write();
        if let Some(segment) = segments.get(&number) {
            return Ok(segment.clone());
        }
        let segment = Arc::new(Segment::open(
            &self.config.dir,
            &self.config.base_name,
            number,
            self.config.lease,
        )?);
        segments.insert(number, segment.clone());
        Ok(segment)
    }

    fn ensure_open(&self) -> Result<(), BinlogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BinlogError::Closed);
        }
        Ok(())
    }

    /// Appends a record with status 0.
    ///
    /// Fsyncs only when the store was configured with `sync_on_append`.
    pub fn append(&self, payload: &[u8]) -> Result<RecordAddress, BinlogError> {
        self.append_with_status(payload, 0, self.config.sync_on_append)
    }

    /// Appends a record with a caller-defined status tag.
    ///
    /// With `fsync`, the address is returned only after the record reached
    /// stable storage. An I/O error is returned as is; retrying is up to the
    /// caller.
    pub fn append_with_status(
        &self,
        payload: &[u8],
        status: i8,
        fsync: bool,
    ) -> Result<RecordAddress, BinlogError> {
        self.ensure_open()?;

        let frame = Frame::encode(payload, status)?;

        let tail = self.writable_tail()?;
        let address = tail.append(&frame, fsync)?;
        drop(tail);

        self.stats_appends.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        if fsync {
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        Ok(address)
    }

    fn tail_segment(&self) -> Result<Arc<Segment>, BinlogError> {
        self.segment(self.tail_number())
    }

    /// Registers an append on the current tail, rotating first when it is full.
    ///
    /// The tail number is read again after registering: a consumer that saw
    /// a later tail and no writers on this segment has already left it, so
    /// the append moves on to the new tail instead.
    fn writable_tail(&self) -> Result<WriteGuard, BinlogError> {
        loop {
            let mut tail = self.tail_segment()?;
            if tail.is_full(self.capacity()) {
                tail = self.rotate(tail.number())?;
            }

            let guard = tail.begin_write();
            if self.tail_number() == guard.number() {
                return Ok(guard);
            }
        }
    }

    /// Makes segment `observed + 1` the tail, unless another thread already
    /// rotated past `observed` or the tail is no longer full.
    fn rotate(&self, observed: SegmentNumber) -> Result<Arc<Segment>, BinlogError> {
        let _guard = self.rotate_lock.lock();

        let current = self.tail_number();
        let tail = self.segment(current)?;
        if current != observed || !tail.is_full(self.capacity()) {
            return Ok(tail);
        }

        let next = current + 1;
        if next > RecordAddress::MAX_SEGMENT {
            return Err(BinlogError::AddressOutOfRange {
                segment: next as u64,
                offset: 0,
            });
        }

        let segment = self.segment(next)?;
        self.tail.store(next, Ordering::SeqCst);
        self.stats_rotations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "Rotated to segment {} (previous size={})",
            next,
            tail.size()
        );
        Ok(segment)
    }

    /// Reads the record at `address`.
    pub fn get_by_id(&self, address: RecordAddress) -> Result<LogItem, BinlogError> {
        self.ensure_open()?;

        let number = address.segment();
        if number < self.head || number > self.tail_number() {
            return Err(BinlogError::RecordNotFound(address));
        }

        let segment = self.segment(number)?;
        if segment.size() == 0 {
            return Err(BinlogError::RecordNotFound(address));
        }

        let item = segment.read_frame(address.offset())?;
        self.record_read(&item);
        Ok(item)
    }

    pub(crate) fn record_read(&self, item: &LogItem) {
        self.stats_reads.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_read
            .fetch_add(item.address.offset() - item.start, Ordering::Relaxed);
    }

    /// Takes the next record after the shared consumer cursor.
    ///
    /// Returns `Ok(None)` once the cursor has caught up with the tail. A
    /// corrupt record is skipped and reported; the following call continues
    /// after it.
    pub fn pop(&self) -> Result<Option<LogItem>, BinlogError> {
        self.ensure_open()?;
        let mut cursor = self.cursor.lock();
        cursor.advance(self)
    }

    /// Moves the shared cursor so the next `pop` returns the record after
    /// `after`.
    pub fn seek(&self, after: RecordAddress) -> Result<(), BinlogError> {
        self.ensure_open()?;
        let number = after.segment();
        if number < self.head || number > self.tail_number() {
            return Err(BinlogError::RecordNotFound(after));
        }
        *self.cursor.lock() = Cursor::after(after);
        Ok(())
    }

    /// Moves the shared cursor back to the first record of the head segment.
    pub fn rewind(&self) {
        *self.cursor.lock() = Cursor::at_start(self.head);
    }

    /// Returns the address of the last record taken by `pop`, if any.
    pub fn position(&self) -> Option<RecordAddress> {
        self.cursor.lock().position()
    }

    /// Returns an independent reader starting after `after`, or at the first
    /// record when `None`.
    pub fn reader(&self, after: Option<RecordAddress>) -> LogReader<'_> {
        let cursor = match after {
            Some(address) => Cursor::after(address),
            None => Cursor::at_start(self.head),
        };
        LogReader::new(self, cursor)
    }

    /// Forces the tail segment to disk.
    pub fn sync(&self) -> Result<(), BinlogError> {
        self.ensure_open()?;
        self.tail_segment()?.sync()?;
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the binlog, syncing the tail and releasing every segment.
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<(), BinlogError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let synced = self.tail_segment().and_then(|tail| tail.sync());

        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for segment in self.segments.read().values() {
            segment.close();
        }

        tracing::info!(
            "Binlog closed: {}/{}",
            self.config.dir.display(),
            self.config.base_name
        );
        synced
    }

    /// Changes the rotation threshold. Existing segments are not touched.
    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Lowest segment number present at open time.
    pub fn head_number(&self) -> SegmentNumber {
        self.head
    }

    /// Segment currently receiving appends.
    pub fn tail_number(&self) -> SegmentNumber {
        self.tail.load(Ordering::SeqCst)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn base_name(&self) -> &str {
        &self.config.base_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the numbers of the segments opened so far.
    pub fn segment_numbers(&self) -> Vec<SegmentNumber> {
        self.segments.read().keys().copied().collect()
    }

    /// Returns the total size of all opened segments in bytes.
    pub fn total_size(&self) -> u64 {
        self.segments.read().values().map(|s| s.size()).sum()
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> BinlogStats {
        BinlogStats {
            appends: self.stats_appends.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            reads: self.stats_reads.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            rotations: self.stats_rotations.load(Ordering::Relaxed),
        }
    }
}

fn check_base_name(config: &BinlogConfig) -> Result<(), BinlogError> {
    let name = &config.base_name;
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(BinlogError::StoreUnavailable {
            path: config.dir.clone(),
            reason: format!("invalid base name {:?}", name),
        });
    }
    Ok(())
}

/// Creates `dir` if needed and checks that files can be created in it.
fn ensure_writable(dir: &Path) -> Result<(), BinlogError> {
    let unavailable = |reason: String| BinlogError::StoreUnavailable {
        path: dir.to_path_buf(),
        reason,
    };

    std::fs::create_dir_all(dir)
        .map_err(|e| unavailable(format!("cannot create directory: {}", e)))?;
    let meta = std::fs::metadata(dir).map_err(|e| unavailable(e.to_string()))?;
    if !meta.is_dir() {
        return Err(unavailable("not a directory".to_string()));
    }

    let probe = dir.join(format!(".binlog-probe-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| unavailable(format!("not writable: {}", e)))?;
    if let Err(e) = std::fs::remove_file(&probe) {
        tracing::warn!("Failed to remove probe file {}: {}", probe.display(), e);
    }
    Ok(())
}
