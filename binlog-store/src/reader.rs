//! Sequential consumption.
//!
//! A `Cursor` remembers the position right after the last record a
//! consumer took. The log manager owns one shared cursor behind `pop`;
//! [`LogReader`] carries a private one. Cursors live in memory only: a
//! consumer that must survive restarts stores the address returned by
//! `position()` and resumes with `seek` or `reader(Some(address))`.

use crate::address::{RecordAddress, SegmentNumber};
use crate::error::BinlogError;
use crate::frame::LogItem;
use crate::manager::LogManager;
use crate::segment::Segment;

/// Position after the last consumed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    segment: SegmentNumber,
    offset: u64,
}

impl Cursor {
    pub(crate) fn at_start(segment: SegmentNumber) -> Self {
        Self { segment, offset: 0 }
    }

    pub(crate) fn after(address: RecordAddress) -> Self {
        Self {
            segment: address.segment(),
            offset: address.offset(),
        }
    }

    /// Address of the last consumed record, `None` at the start of a segment.
    pub(crate) fn position(&self) -> Option<RecordAddress> {
        if self.offset == 0 {
            return None;
        }
        RecordAddress::new(self.segment, self.offset).ok()
    }

    /// Takes the next record, moving to later segments as each one runs out.
    ///
    /// The cursor moves past a corrupt record before the error is returned.
    /// Any other error leaves it in place, so the same record is tried again.
    /// A segment is left only once it is behind the tail and no append is
    /// registered on it.
    pub(crate) fn advance(&mut self, log: &LogManager) -> Result<Option<LogItem>, BinlogError> {
        loop {
            let tail = log.tail_number();
            if self.segment > tail {
                return Ok(None);
            }

            let segment = log.segment(self.segment)?;
            if let Some(item) = self.take(&segment, log)? {
                return Ok(Some(item));
            }

            if self.segment >= tail || segment.writers() > 0 {
                return Ok(None);
            }
            // A writer indexes its frame before it deregisters.
            if let Some(item) = self.take(&segment, log)? {
                return Ok(Some(item));
            }
            self.segment += 1;
            self.offset = 0;
        }
    }

    fn take(
        &mut self,
        segment: &Segment,
        log: &LogManager,
    ) -> Result<Option<LogItem>, BinlogError> {
        let span = match segment.next_span_after(self.offset) {
            Some(span) => span,
            None => return Ok(None),
        };

        match segment.read_span(span) {
            Ok(item) => {
                self.offset = span.end;
                log.record_read(&item);
                Ok(Some(item))
            }
            Err(e @ BinlogError::CorruptRecord { .. }) => {
                self.offset = span.end;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Independent sequential reader over a [`LogManager`].
///
/// Yields records in append order across segments and ends when it catches
/// up with the tail. Records appended later are picked up by calling `next`
/// again.
pub struct LogReader<'a> {
    log: &'a LogManager,
    cursor: Cursor,
    closed: bool,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(log: &'a LogManager, cursor: Cursor) -> Self {
        Self {
            log,
            cursor,
            closed: false,
        }
    }

    /// Address of the last record returned, if any.
    pub fn position(&self) -> Option<RecordAddress> {
        self.cursor.position()
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<LogItem, BinlogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        if self.log.is_closed() {
            self.closed = true;
            return Some(Err(BinlogError::Closed));
        }
        self.cursor.advance(self.log).transpose()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::BinlogError;
    use crate::frame::Frame;
    use crate::lease::LeaseConfig;
    use crate::manager::{BinlogConfig, LogManager};
    use crate::segment::tests::flip_byte;
    use tempfile::TempDir;

    fn open(dir: &TempDir, capacity: u64) -> LogManager {
        LogManager::open(BinlogConfig::new(dir.path(), "events").with_capacity(capacity)).unwrap()
    }

    #[test]
    fn test_pop_drains_in_order_across_rotations() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 80);

        let addrs: Vec<_> = (0..12)
            .map(|i| log.append(format!("rec-{:02}", i).as_bytes()).unwrap())
            .collect();
        assert!(log.tail_number() > 0);

        for (i, addr) in addrs.iter().enumerate() {
            let item = log.pop().unwrap().expect("record available");
            assert_eq!(item.address, *addr);
            assert_eq!(item.payload, format!("rec-{:02}", i).into_bytes());
            assert_eq!(log.position(), Some(*addr));
        }
        assert!(log.pop().unwrap().is_none());

        let late = log.append(b"late").unwrap();
        assert_eq!(log.pop().unwrap().map(|item| item.address), Some(late));
        assert!(log.pop().unwrap().is_none());
    }

    #[test]
    fn test_pop_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024);
        assert!(log.pop().unwrap().is_none());
        assert_eq!(log.position(), None);
    }

    #[test]
    fn test_pop_hands_each_record_out_once() {
        let dir = TempDir::new().unwrap();
        let log = std::sync::Arc::new(open(&dir, 512));
        for i in 0..400 {
            log.append(format!("{}", i).as_bytes()).unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(item) = log.pop().unwrap() {
                        taken.push(item.address);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<_> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        assert_eq!(all.len(), 400);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn test_seek_resumes_after_address() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 100);
        let addrs: Vec<_> = (0..8)
            .map(|i| log.append(&[i as u8; 20]).unwrap())
            .collect();

        log.seek(addrs[4]).unwrap();
        let next = log.pop().unwrap().unwrap();
        assert_eq!(next.address, addrs[5]);

        log.rewind();
        assert_eq!(log.pop().unwrap().unwrap().address, addrs[0]);
    }

    #[test]
    fn test_seek_outside_store() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 100);
        log.append(b"x").unwrap();

        let beyond = crate::RecordAddress::new(9, 0).unwrap();
        assert!(matches!(
            log.seek(beyond),
            Err(BinlogError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_pop_skips_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024 * 1024);
        let a = log.append(b"one").unwrap();
        let b = log.append_with_status(b"two", 0, true).unwrap();
        let c = log.append(b"three").unwrap();

        flip_byte(&dir.path().join("events.0"), b.offset() - 1);

        assert_eq!(log.pop().unwrap().unwrap().address, a);
        assert!(matches!(
            log.pop(),
            Err(BinlogError::CorruptRecord { address, .. }) if address == b
        ));
        assert_eq!(log.pop().unwrap().unwrap().address, c);
    }

    #[test]
    fn test_pop_retries_record_after_io_error() {
        let dir = TempDir::new().unwrap();
        let lease = LeaseConfig {
            max_leases: 64,
            max_idle: 0,
        };
        let log = LogManager::open(
            BinlogConfig::new(dir.path(), "events")
                .with_capacity(1024 * 1024)
                .with_lease(lease),
        )
        .unwrap();
        let a = log.append(b"a").unwrap();
        let b = log.append(b"b").unwrap();

        let path = dir.path().join("events.0");
        let moved = dir.path().join("events.0.moved");
        std::fs::rename(&path, &moved).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(log.pop(), Err(BinlogError::Io(_))));
        assert_eq!(log.position(), None);

        std::fs::remove_dir(&path).unwrap();
        std::fs::rename(&moved, &path).unwrap();

        assert_eq!(log.pop().unwrap().unwrap().address, a);
        assert_eq!(log.pop().unwrap().unwrap().address, b);
    }

    #[test]
    fn test_pop_waits_for_registered_writer_on_old_tail() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 100);
        let old: Vec<_> = (0..3)
            .map(|i| log.append(&[i as u8; 20]).unwrap())
            .collect();
        let next = log.append(b"next").unwrap();
        assert_eq!(next.segment(), 1);
        assert!(old.iter().all(|addr| addr.segment() == 0));

        // An append that registered on segment 0 before the rotation
        let segment = log.segment(0).unwrap();
        let writing = segment.begin_write();

        for addr in &old {
            assert_eq!(log.pop().unwrap().unwrap().address, *addr);
        }
        assert!(log.pop().unwrap().is_none());

        let late = writing
            .append(&Frame::encode(b"late", 0).unwrap(), false)
            .unwrap();
        drop(writing);

        assert_eq!(log.pop().unwrap().unwrap().address, late);
        assert_eq!(log.pop().unwrap().unwrap().address, next);
        assert!(log.pop().unwrap().is_none());
    }

    #[test]
    fn test_independent_readers() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 64);
        let addrs: Vec<_> = (0..10)
            .map(|i| log.append(format!("r{}", i).as_bytes()).unwrap())
            .collect();

        let all: Vec<_> = log.reader(None).map(|r| r.unwrap().address).collect();
        assert_eq!(all, addrs);

        let mut from_middle = log.reader(Some(addrs[6]));
        assert_eq!(from_middle.next().unwrap().unwrap().address, addrs[7]);
        assert_eq!(from_middle.position(), Some(addrs[7]));
        assert_eq!(from_middle.count(), 2);

        // Readers do not move the shared cursor.
        assert_eq!(log.pop().unwrap().unwrap().address, addrs[0]);
    }

    #[test]
    fn test_reader_after_reopen() {
        let dir = TempDir::new().unwrap();
        let checkpoint = {
            let log = open(&dir, 64);
            for i in 0..6 {
                log.append(format!("r{}", i).as_bytes()).unwrap();
            }
            let mut reader = log.reader(None);
            reader.nth(2).unwrap().unwrap();
            let position = reader.position().unwrap();
            log.close().unwrap();
            position
        };

        let log = open(&dir, 64);
        let rest: Vec<_> = log
            .reader(Some(checkpoint))
            .map(|r| r.unwrap().payload)
            .collect();
        assert_eq!(rest, vec!["r3", "r4", "r5"]);
    }

    #[test]
    fn test_reader_reports_close_once() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 64);
        log.append(b"x").unwrap();
        log.close().unwrap();

        let mut reader = log.reader(None);
        assert!(matches!(reader.next(), Some(Err(BinlogError::Closed))));
        assert!(reader.next().is_none());
    }
}
