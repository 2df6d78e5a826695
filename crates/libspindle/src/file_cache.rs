//! Bounded LRU pool of open file handles.
//!
//! Every read/write/size operation on cached files goes through one borrow
//! primitive: take the cache's coarse lock just long enough to look up (or
//! open) the handle and acquire its read lock, release the coarse lock, do
//! the I/O, release the read lock. Closing a handle takes its write lock, so
//! a handle is never closed while an operation is in flight.

use std::fs::File;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::storage_unit::{StorageUnit, pread_exact, pwrite_all};

/// Identity of a cached open file: canonical path plus declared capacity.
///
/// Equality and hashing are **by path only**. Capacity is carried as data
/// for diagnostics but deliberately excluded: two keys for the same path are
/// the same cache entry regardless of capacity, and the capacity seen at
/// first open wins for that handle's lifetime. Registration normalizes
/// paths, so one physical file maps to exactly one key.
#[derive(Debug, Clone)]
pub struct FileCacheKey {
    pub path: PathBuf,
    pub capacity: u64,
}

impl FileCacheKey {
    pub fn for_unit(unit: &StorageUnit) -> Self {
        Self {
            path: unit.path().to_owned(),
            capacity: unit.capacity(),
        }
    }
}

impl PartialEq for FileCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for FileCacheKey {}

impl Hash for FileCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

/// An open channel onto one file. I/O holds the read side of the lock (many
/// concurrent positional reads/writes are fine), closing holds the write
/// side. Once closed the handle is dead; the cache makes a fresh one.
pub(crate) struct CachedOpenFile {
    path: PathBuf,
    file: RwLock<Option<File>>,
}

impl CachedOpenFile {
    fn open(key: &FileCacheKey) -> Result<Arc<Self>> {
        trace!(path = ?key.path, capacity = key.capacity, "opening cached file");
        let file = StorageUnit::open_file(&key.path)?;
        Ok(Arc::new(Self {
            path: key.path.clone(),
            file: RwLock::new(Some(file)),
        }))
    }

    fn with_read_lock<R>(&self, op: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let g = self.file.read();
        match g.as_ref() {
            Some(file) => op(file),
            None => Err(Error::FileClosed {
                path: self.path.clone(),
            }),
        }
    }

    fn flush(&self) -> Result<()> {
        self.with_read_lock(|file| {
            file.sync_all().map_err(|e| Error::Flush {
                path: self.path.clone(),
                source: e,
            })
        })
    }

    fn close(&self) -> Result<()> {
        let file = self.file.write().take();
        if let Some(file) = file {
            file.sync_all().map_err(|e| Error::Close {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Process-scoped (per [`crate::Storage`]) pool of open files, bounded by
/// `max_open_files`, LRU-ordered by access.
pub struct OpenFileCache {
    map: Mutex<LruCache<FileCacheKey, Arc<CachedOpenFile>>>,
}

impl OpenFileCache {
    pub fn new(max_open_files: NonZeroUsize) -> Self {
        Self {
            map: Mutex::new(LruCache::new(max_open_files)),
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up (creating and inserting if absent) the handle for `key`,
    /// bumping it to most-recently-used. If inserting would exceed the
    /// bound, the least-recently-used handle is synchronously closed first.
    fn get(&self, key: &FileCacheKey) -> Result<Arc<CachedOpenFile>> {
        let mut map = self.map.lock();
        if let Some(handle) = map.get(key) {
            return Ok(handle.clone());
        }
        while map.len() >= map.cap().get() {
            if let Some((evicted_key, evicted)) = map.pop_lru() {
                debug!(path = ?evicted_key.path, "evicting LRU file handle");
                if let Err(e) = evicted.close() {
                    warn!(path = ?evicted_key.path, "error closing evicted handle: {e:#}");
                }
            }
        }
        let handle = CachedOpenFile::open(key)?;
        map.push(key.clone(), handle.clone());
        Ok(handle)
    }

    /// The borrow primitive all cached I/O goes through.
    pub(crate) fn with_file<R>(
        &self,
        key: &FileCacheKey,
        op: impl FnOnce(&File) -> Result<R>,
    ) -> Result<R> {
        let handle = self.get(key)?;
        // Coarse lock released; I/O proceeds under the handle's read lock.
        handle.with_read_lock(op)
    }

    /// Read `buf` from `unit` at `offset` through the cache. Bounds are
    /// checked against the unit's declared capacity; an absent file, or a
    /// tail past EOF, is zero-filled, matching the uncached read contract.
    /// Reads never create the file.
    pub fn read_unit(&self, unit: &StorageUnit, buf: &mut [u8], offset: u64) -> Result<()> {
        check_unit_bounds(unit, offset, buf.len())?;
        let key = FileCacheKey::for_unit(unit);
        if !self.map.lock().contains(&key) && !key.path.exists() {
            buf.fill(0);
            return Ok(());
        }
        self.with_file(&key, |file| {
            let read = pread_exact(file, buf, offset).map_err(|e| Error::Read {
                path: unit.path().to_owned(),
                offset,
                source: e,
            })?;
            buf[read..].fill(0);
            Ok(())
        })
    }

    /// Write `buf` to `unit` at `offset` through the cache.
    pub fn write_unit(&self, unit: &StorageUnit, buf: &[u8], offset: u64) -> Result<()> {
        check_unit_bounds(unit, offset, buf.len())?;
        let key = FileCacheKey::for_unit(unit);
        self.with_file(&key, |file| {
            pwrite_all(file, buf, offset).map_err(|e| Error::Write {
                path: unit.path().to_owned(),
                offset,
                source: e,
            })
        })
    }

    /// Best-effort flush of a snapshot of the current handles. A handle
    /// closed concurrently is skipped; the first real failure is reported
    /// after every handle has been attempted.
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<Arc<CachedOpenFile>> = {
            let map = self.map.lock();
            map.iter().map(|(_, h)| h.clone()).collect()
        };
        let mut first_err = None;
        for handle in handles {
            match handle.flush() {
                Ok(()) => {}
                Err(Error::FileClosed { .. }) => {}
                Err(e) => {
                    warn!("error flushing {:?}: {e:#}", handle.path);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove and close the handle for `key`, if present.
    pub fn close(&self, key: &FileCacheKey) -> Result<()> {
        let mut map = self.map.lock();
        match map.pop(key) {
            Some(handle) => handle.close(),
            None => Ok(()),
        }
    }

    /// Remove and close every handle. Every handle is attempted even if an
    /// earlier close fails; the first failure is surfaced afterwards.
    pub fn close_all(&self) -> Result<()> {
        let mut map = self.map.lock();
        let mut first_err = None;
        while let Some((key, handle)) = map.pop_lru() {
            if let Err(e) = handle.close() {
                warn!(path = ?key.path, "error closing handle: {e:#}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn check_unit_bounds(unit: &StorageUnit, offset: u64, len: usize) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= unit.capacity() => Ok(()),
        _ => Err(Error::Bounds {
            path: unit.path().to_owned(),
            offset,
            len: len as u64,
            capacity: unit.capacity(),
        }),
    }
}
