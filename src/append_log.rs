//! A growable, memory-mapped, append-only byte log.
//!
//! Writers obtain exclusive byte ranges from [`AppendLog::reserve`], which is
//! a single atomic add on the log's length: any number of threads may reserve
//! and fill ranges at once without taking a lock. Growing the mapping may move
//! it, so [`AppendLog::ensure`] takes `&mut self`; the borrow checker then
//! guarantees no reservation is alive while the mapping is replaced. The
//! usual rhythm is: `ensure` enough headroom for a burst, run a parallel
//! `map` whose bodies `reserve` and write, repeat, then `close`.
//!
//! ```no_run
//! use mapdump::append_log::AppendLog;
//! # fn main() -> mapdump::Result<()> {
//! let mut log = AppendLog::create("/tmp/records.out", 1024)?;
//! log.ensure(7)?;
//! let (bytes, offset) = log.reserve(7);
//! bytes.copy_from_slice(b"000000\n");
//! assert_eq!(offset, 0);
//! assert_eq!(log.close()?, 7);
//! # Ok(())
//! # }
//! ```

use log::{debug, error, info, warn};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Granularity of the mapped capacity.
pub const PAGE_SIZE: usize = 4096;

fn round_to_page(bytes: usize) -> usize {
    bytes.max(1).saturating_add(PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}




/**
 * A file-backed bump allocator. `used` only ever grows; `base` and `capacity`
 * change only in `ensure`, which requires exclusive access.
 */
pub struct AppendLog {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    base: *mut u8,
    capacity: usize,
    used: AtomicUsize,
    growth_factor: usize,
    closed: bool,
}

// SAFETY: `base` points into `mmap`, which lives as long as the log. Shared
// access only writes through `reserve`, whose ranges are disjoint because they
// come from a fetch-and-add on `used`, and are bounds checked against
// `capacity`. Everything that moves the mapping takes `&mut self`.
unsafe impl Send for AppendLog {}
unsafe impl Sync for AppendLog {}

impl AppendLog {
    /// Create (or truncate) the file at `path` and map `initial_capacity`
    /// bytes of it. A zero capacity maps a single byte, since an empty
    /// mapping cannot be created.
    ///
    pub fn create<P: AsRef<Path>>(path: P, initial_capacity: usize) -> Result<Self> {
        Self::with_config(path, &LogConfig::with_capacity(initial_capacity))
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: &LogConfig) -> Result<Self> {
        config.validate()?;

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;

        let capacity = config.initial_capacity.max(1);
        let mmap = map_file(&path, &file, capacity)?;

        info!("append log {} opened with {} bytes", path.display(), capacity);

        let mut log = AppendLog {
            path,
            file,
            mmap: None,
            base: ptr::null_mut(),
            capacity,
            used: AtomicUsize::new(0),
            growth_factor: config.growth_factor,
            closed: false,
        };
        log.install(mmap);
        Ok(log)
    }

    /// Make sure at least `additional` bytes can be reserved beyond what is
    /// already used. If the current mapping is large enough this does
    /// nothing; otherwise the file is extended and remapped, and the mapping
    /// may move. Bytes already written keep their offsets.
    ///
    pub fn ensure(&mut self, additional: usize) -> Result<()> {
        let used = *self.used.get_mut();

        if self.capacity.saturating_sub(used) >= additional {
            return Ok(());
        }
        let capacity = round_to_page(used.saturating_add(additional).saturating_mul(self.growth_factor));

        debug!(
            "append log {}: growing from {} to {} bytes ({} used)",
            self.path.display(),
            self.capacity,
            capacity,
            used
        );
        let mmap = map_file(&self.path, &self.file, capacity)?;
        self.install(mmap);
        self.capacity = capacity;
        Ok(())
    }

    /// Claim the next `len` bytes of the log. Returns the bytes, which are
    /// exclusively the caller's, and their offset in the file. Offsets follow
    /// the order in which concurrent callers reached the log, not any order
    /// of theirs.
    ///
    /// # Panics
    ///
    /// If `len` is zero, or if the log does not have `len` bytes of headroom
    /// left. Headroom is the caller's responsibility: `ensure` it before
    /// starting to reserve.
    ///
    #[allow(clippy::mut_from_ref)]
    pub fn reserve(&self, len: usize) -> (&mut [u8], u64) {
        assert!(len > 0, "AppendLog::reserve called with a zero length");

        let offset = self.used.fetch_add(len, Ordering::Relaxed);
        let end = offset.saturating_add(len);

        assert!(
            end <= self.capacity,
            "append log overflow: reserved {}..{} with capacity {}; ensure more headroom",
            offset,
            end,
            self.capacity
        );
        // SAFETY: `offset..end` lies within the mapping and no other reserve
        // call can obtain an overlapping range.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) };
        (bytes, offset as u64)
    }

    /// Append `bytes` and return the offset they were written at.
    ///
    pub fn write(&self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return self.used() as u64;
        }
        let (dest, offset) = self.reserve(bytes.len());
        dest.copy_from_slice(bytes);
        offset
    }

    /// Flush dirty pages to storage. Does not stop concurrent reservations.
    ///
    pub fn sync(&self) -> Result<()> {
        match &self.mmap {
            Some(mmap) => mmap.flush().map_err(|e| Error::io(&self.path, e)),
            None => Ok(()),
        }
    }

    /// Flush, cut the file down to exactly the used length, and unmap it.
    /// Returns the final file length. If reservations ever ran past the
    /// capacity, the file keeps the bytes that fit and `Error::Overflow` is
    /// returned.
    ///
    pub fn close(mut self) -> Result<u64> {
        self.finish()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes reserved so far.
    ///
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn headroom(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// The bytes written so far, in offset order.
    ///
    pub fn as_bytes(&mut self) -> &[u8] {
        let used = (*self.used.get_mut()).min(self.capacity);
        match &self.mmap {
            Some(mmap) => &mmap[..used],
            None => &[],
        }
    }

    fn install(&mut self, mut mmap: MmapMut) {
        self.base = mmap.as_mut_ptr();
        self.mmap = Some(mmap);
    }

    fn finish(&mut self) -> Result<u64> {
        self.closed = true;

        let used = *self.used.get_mut();
        let len = used.min(self.capacity);
        if let Some(mmap) = self.mmap.take() {
            mmap.flush().map_err(|e| Error::io(&self.path, e))?;
        }
        self.base = ptr::null_mut();

        self.file
            .set_len(len as u64)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::io(&self.path, e))?;

        if used > len {
            return Err(Error::Overflow {
                path: self.path.clone(),
                used,
                capacity: len,
            });
        }
        info!("append log {} closed at {} bytes", self.path.display(), len);
        Ok(len as u64)
    }
}

impl Drop for AppendLog {
    fn drop(&mut self) {
        if !self.closed {
            warn!("append log {} dropped without close", self.path.display());
            if let Err(e) = self.finish() {
                error!("{}", e);
            }
        }
    }
}

fn map_file(path: &Path, file: &File, capacity: usize) -> Result<MmapMut> {
    file.set_len(capacity as u64).map_err(|e| Error::io(path, e))?;

    // SAFETY: the file was just sized to `capacity` and is owned by the log;
    // nothing else in this process resizes it while the mapping is alive.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| Error::io(path, e))
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_is_rounded_to_pages() {
        assert_eq!(round_to_page(0), PAGE_SIZE);
        assert_eq!(round_to_page(1), PAGE_SIZE);
        assert_eq!(round_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn ensure_within_capacity_keeps_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AppendLog::create(dir.path().join("log"), 1024).unwrap();
        let base = log.base;
        log.write(b"abc");
        log.ensure(100).unwrap();
        log.ensure(1021).unwrap();
        assert_eq!(log.base, base);
        assert_eq!(log.capacity(), 1024);
    }

    #[test]
    fn growth_keeps_earlier_bytes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AppendLog::create(dir.path().join("log"), 16).unwrap();
        assert_eq!(log.write(b"hello "), 0);
        log.ensure(3 * PAGE_SIZE).unwrap();
        assert!(log.capacity() >= 3 * PAGE_SIZE + 6);
        assert_eq!(log.write(b"world"), 6);
        assert_eq!(log.as_bytes(), b"hello world");
    }

    #[test]
    fn growth_uses_the_configured_factor() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            initial_capacity: 0,
            growth_factor: 3,
        };
        let mut log = AppendLog::with_config(dir.path().join("log"), &config).unwrap();
        log.ensure(PAGE_SIZE + 1).unwrap();
        assert_eq!(log.capacity(), round_to_page(3 * (PAGE_SIZE + 1)));
    }

    #[test]
    fn file_starts_at_the_requested_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = AppendLog::create(&path, 1000).unwrap();
        assert_eq!(log.capacity(), 1000);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
        drop(log);

        let log = AppendLog::create(&path, 0).unwrap();
        assert_eq!(log.capacity(), 1);
    }

    #[test]
    fn headroom_tracks_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::create(dir.path().join("log"), PAGE_SIZE).unwrap();
        let (_, offset) = log.reserve(100);
        assert_eq!(offset, 0);
        assert_eq!(log.used(), 100);
        assert_eq!(log.headroom(), PAGE_SIZE - 100);
    }

    #[test]
    fn empty_write_reserves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::create(dir.path().join("log"), 64).unwrap();
        log.write(b"xy");
        assert_eq!(log.write(b""), 2);
        assert_eq!(log.used(), 2);
    }
}
