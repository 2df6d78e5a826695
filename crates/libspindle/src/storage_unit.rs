//! File-backed storage units: the unit of physical I/O.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};

#[cfg(unix)]
pub(crate) fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut total = 0;
    while !buf.is_empty() {
        let n = file.read_at(buf, offset)?;
        if n == 0 {
            // Past EOF. The caller decides whether to zero-fill.
            break;
        }
        buf = &mut buf[n..];
        offset += n as u64;
        total += n;
    }
    Ok(total)
}

#[cfg(unix)]
pub(crate) fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    let mut total = 0;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            break;
        }
        buf = &mut buf[n..];
        offset += n as u64;
        total += n;
    }
    Ok(total)
}

#[cfg(windows)]
pub(crate) fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// A contiguous, file-backed byte range with a declared final capacity.
///
/// The file (and its parent directories) is created lazily on first write;
/// reading an absent file yields zero-filled buffers, so "not downloaded
/// yet" is indistinguishable from a file full of zeroes but distinct from a
/// real I/O fault. Direct operations are serialized behind a per-unit mutex.
///
/// After [`StorageUnit::close`] the unit lazily reopens on the next access;
/// close is a resource hint, not a terminal state. The cached tier in
/// [`crate::file_cache`] has the opposite policy.
#[derive(Debug)]
pub struct StorageUnit {
    path: PathBuf,
    capacity: u64,
    file: Mutex<Option<File>>,
}

impl StorageUnit {
    pub fn new(path: PathBuf, capacity: u64) -> Self {
        Self {
            path,
            capacity,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes physically present on disk right now. 0 for an absent file.
    pub fn size(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::Read {
                path: self.path.clone(),
                offset: 0,
                source: e,
            }),
        }
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(Error::Bounds {
                path: self.path.clone(),
                offset,
                len: len as u64,
                capacity: self.capacity,
            }),
        }
    }

    /// Open read/write, creating the file and its parents.
    pub(crate) fn open_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Create {
                path: parent.to_owned(),
                source: e,
            })?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Create {
                path: path.to_owned(),
                source: e,
            })
    }

    fn with_open_file<R>(&self, f: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let mut g = self.file.lock();
        if g.is_none() {
            trace!(path = ?self.path, "opening storage unit");
            *g = Some(Self::open_file(&self.path)?);
        }
        f(g.as_ref().unwrap())
    }

    /// Write `buf` at `offset`. Creates the file on first use. Fails fast on
    /// out-of-capacity ranges; never truncates the write.
    pub fn write_block(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.with_open_file(|file| {
            pwrite_all(file, buf, offset).map_err(|e| Error::Write {
                path: self.path.clone(),
                offset,
                source: e,
            })
        })
    }

    /// Read into `buf` from `offset`. An absent file, or a file shorter than
    /// the requested range, zero-fills the missing tail.
    pub fn read_block(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut g = self.file.lock();
        if g.is_none() {
            // Do not create the file on a read path; absence means the data
            // simply is not here yet.
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => *g = Some(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    buf.fill(0);
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::Read {
                        path: self.path.clone(),
                        offset,
                        source: e,
                    });
                }
            }
        }
        let read = pread_exact(g.as_ref().unwrap(), buf, offset).map_err(|e| Error::Read {
            path: self.path.clone(),
            offset,
            source: e,
        })?;
        buf[read..].fill(0);
        Ok(())
    }

    /// Preallocate the file to its declared capacity.
    pub fn ensure_capacity(&self) -> Result<()> {
        self.with_open_file(|file| {
            file.set_len(self.capacity).map_err(|e| Error::Write {
                path: self.path.clone(),
                offset: self.capacity,
                source: e,
            })
        })
    }

    pub fn flush(&self) -> Result<()> {
        let g = self.file.lock();
        if let Some(file) = g.as_ref() {
            file.sync_all().map_err(|e| Error::Flush {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Drop the open handle. The next access reopens lazily.
    pub fn close(&self) -> Result<()> {
        let file = self.file.lock().take();
        if let Some(file) = file {
            file.sync_all().map_err(|e| Error::Close {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dir: &tempfile::TempDir, name: &str, capacity: u64) -> StorageUnit {
        StorageUnit::new(dir.path().join(name), capacity)
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "a.bin", 64);
        u.write_block(b"hello", 10).unwrap();
        let mut buf = [0u8; 5];
        u.read_block(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_bounds_are_enforced() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "a.bin", 16);
        assert!(matches!(
            u.write_block(&[0u8; 8], 10),
            Err(Error::Bounds { .. })
        ));
        let mut buf = [0u8; 17];
        assert!(matches!(u.read_block(&mut buf, 0), Err(Error::Bounds { .. })));
        // Offset overflow must not wrap around.
        assert!(matches!(
            u.write_block(&[0u8; 1], u64::MAX),
            Err(Error::Bounds { .. })
        ));
    }

    #[test]
    fn test_absent_file_reads_zeroes() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "missing.bin", 32);
        let mut buf = [0xffu8; 8];
        u.read_block(&mut buf, 4).unwrap();
        assert_eq!(buf, [0u8; 8]);
        assert!(!u.path().exists());
        assert_eq!(u.size().unwrap(), 0);
    }

    #[test]
    fn test_short_file_zero_fills_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "short.bin", 32);
        u.write_block(b"abc", 0).unwrap();
        let mut buf = [0xffu8; 8];
        u.read_block(&mut buf, 0).unwrap();
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 5]);
    }

    #[test]
    fn test_lazy_reopen_after_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "a.bin", 16);
        u.write_block(b"data", 0).unwrap();
        u.close().unwrap();
        let mut buf = [0u8; 4];
        u.read_block(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");
        u.write_block(b"more", 4).unwrap();
    }

    #[test]
    fn test_parent_directories_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "nested/deep/file.bin", 16);
        u.write_block(b"x", 0).unwrap();
        assert!(dir.path().join("nested/deep/file.bin").exists());
    }

    #[test]
    fn test_ensure_capacity_preallocates() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = unit(&dir, "prealloc.bin", 1024);
        u.ensure_capacity().unwrap();
        assert_eq!(u.size().unwrap(), 1024);
    }
}
