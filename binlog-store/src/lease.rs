//! Bounded file handle leasing.
//!
//! Every segment owns a [`HandlePool`] for its file. An operation leases a
//! handle, uses it exclusively (so seek + read/write never races another
//! operation on the same handle), and returns it to the pool when the lease
//! is dropped. Pools are built per segment from the store's
//! [`LeaseConfig`]; there is no process-wide pool.

use crate::error::BinlogError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Limits applied to each segment's handle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Maximum concurrently leased handles per segment.
    pub max_leases: usize,
    /// Maximum released handles kept open for reuse.
    pub max_idle: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_leases: 64,
            max_idle: 4,
        }
    }
}

/// Pool of open handles to one file.
#[derive(Debug)]
pub struct HandlePool {
    path: PathBuf,
    config: LeaseConfig,
    idle: Mutex<Vec<File>>,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl HandlePool {
    /// Creates a pool for `path`. The file is created on the first lease.
    pub fn new(path: impl Into<PathBuf>, config: LeaseConfig) -> Self {
        Self {
            path: path.into(),
            config,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leases a handle, reusing an idle one when available.
    ///
    /// Fails immediately with `LeaseExhausted` when `max_leases` handles are
    /// already out.
    pub fn acquire(&self) -> Result<HandleLease<'_>, BinlogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BinlogError::Closed);
        }

        let limit = self.config.max_leases;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| BinlogError::LeaseExhausted {
                path: self.path.clone(),
                limit,
            })?;

        let cached = self.idle.lock().pop();
        let file = match cached {
            Some(file) => file,
            None => match self.open_handle() {
                Ok(file) => file,
                Err(e) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    return Err(e.into());
                }
            },
        };

        Ok(HandleLease {
            pool: self,
            file: Some(file),
        })
    }

    fn open_handle(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }

    fn release(&self, file: File) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(file);
        }
    }

    /// Returns the number of handles currently leased.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns the number of cached handles.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Drops idle handles and refuses new leases. Outstanding leases close
    /// their handle when released. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A handle borrowed from a [`HandlePool`]; returned to the pool on drop.
#[derive(Debug)]
pub struct HandleLease<'a> {
    pool: &'a HandlePool,
    file: Option<File>,
}

impl HandleLease<'_> {
    /// Flushes written data to stable storage.
    pub fn sync(&self) -> std::io::Result<()> {
        self.deref().sync_data()
    }

    /// Returns the handle to the pool.
    pub fn release(self) {}
}

impl Deref for HandleLease<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        self.file.as_ref().expect("lease holds a handle until dropped")
    }
}

impl DerefMut for HandleLease<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("lease holds a handle until dropped")
    }
}

impl Drop for HandleLease<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.release(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn pool(dir: &TempDir, max_leases: usize, max_idle: usize) -> HandlePool {
        HandlePool::new(
            dir.path().join("events.0"),
            LeaseConfig {
                max_leases,
                max_idle,
            },
        )
    }

    #[test]
    fn test_acquire_creates_file() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 4, 2);
        assert!(!pool.path().exists());

        let mut lease = pool.acquire().unwrap();
        lease.write_all(b"data").unwrap();
        lease.sync().unwrap();
        assert!(pool.path().exists());
        assert_eq!(pool.outstanding(), 1);

        lease.release();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1, 1);

        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, BinlogError::LeaseExhausted { limit: 1, .. }));
        assert!(err.is_retryable());

        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_idle_is_bounded() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 8, 2);

        let leases: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.outstanding(), 5);
        drop(leases);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_leases_have_independent_positions() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 4, 4);
        pool.acquire().unwrap().write_all(b"0123456789").unwrap();

        let mut a = pool.acquire().unwrap();
        let mut b = pool.acquire().unwrap();
        a.seek(SeekFrom::Start(2)).unwrap();
        b.seek(SeekFrom::Start(7)).unwrap();

        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"23");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"78");
    }

    #[test]
    fn test_close_refuses_new_leases() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 4, 4);

        let held = pool.acquire().unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(BinlogError::Closed)));

        drop(held);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 0);
    }
}
