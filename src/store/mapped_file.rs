//! A single fixed-size memory-mapped segment of a log (section 4.1).
//!
//! Mirrors `maped_file.go`'s contract: append under a caller-held lock,
//! flush only advances `flushed_position`, and reads borrow the mapping
//! through a ref-counted hold that must be released on every exit path.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::error::{AppendMessageStatus, StoreError, StoreResult};

/// The parsed file name is the absolute starting offset of the segment,
/// zero-padded to 20 decimal digits (section 6).
pub fn format_file_name(from_offset: i64) -> String {
    format!("{:020}", from_offset)
}

pub fn parse_file_name(path: &Path) -> Option<i64> {
    path.file_name()?.to_str()?.parse::<i64>().ok()
}

/// RAII guard returned by [`MappedFile::hold`]. Dropping it releases the
/// file's reference count. Every read path (pull response, HA pusher,
/// recovery scan) must keep this alive for as long as it borrows bytes out
/// of the mapping.
pub struct MappedFileGuard<'a> {
    file: &'a MappedFile,
}

impl<'a> Drop for MappedFileGuard<'a> {
    fn drop(&mut self) {
        self.file.release();
    }
}

impl<'a> MappedFileGuard<'a> {
    /// Returns up to `size` bytes starting at `pos`, or the remainder of
    /// the written region if `size` is `None`.
    pub fn bytes(&self, pos: usize, size: Option<usize>) -> &'a [u8] {
        let write_pos = self.file.write_position.load(Ordering::Acquire);
        if pos >= write_pos {
            return &[];
        }
        let end = match size {
            Some(s) => (pos + s).min(write_pos),
            None => write_pos,
        };
        // Safety: the mapping lives for the lifetime of `MappedFile`, which
        // outlives this guard (the guard borrows `&'a MappedFile`); the
        // refcount held by this guard prevents concurrent unmap/destroy.
        unsafe {
            let mmap = &*self.file.mmap.get();
            &mmap[pos..end]
        }
    }
}

/// Append outcome for a single record.
pub struct AppendMessageResult {
    pub status: AppendMessageStatus,
    pub wrote_offset: i64,
    pub wrote_bytes: i32,
}

pub struct MappedFile {
    path: PathBuf,
    pub file_from_offset: i64,
    pub file_size: usize,
    write_position: AtomicUsize,
    flushed_position: AtomicUsize,
    committed_position: AtomicUsize,
    /// Guarded by a mutex because append+flush both need to observe and
    /// mutate the underlying mapping without tearing; the mutex is held
    /// only across the memcpy/msync, never across I/O waits.
    mmap: std::cell::UnsafeCell<MmapMut>,
    append_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    ref_count: AtomicI64,
    available: AtomicBool,
    first_shutdown_ts: RwLock<Option<Instant>>,
    store_timestamp: AtomicI64,
}

// SAFETY: all mutable access to `mmap` happens either under `append_lock`
// (writers) or is read-only bytes bounded by `write_position`, which is
// only ever advanced after the corresponding bytes are written (readers).
unsafe impl Sync for MappedFile {}
unsafe impl Send for MappedFile {}

impl MappedFile {
    pub fn create(dir: &Path, file_from_offset: i64, file_size: usize) -> StoreResult<MappedFile> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format_file_name(file_from_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(file_size as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MappedFile {
            path,
            file_from_offset,
            file_size,
            write_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
            committed_position: AtomicUsize::new(0),
            mmap: std::cell::UnsafeCell::new(mmap),
            append_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            ref_count: AtomicI64::new(1),
            available: AtomicBool::new(true),
            first_shutdown_ts: RwLock::new(None),
            store_timestamp: AtomicI64::new(0),
        })
    }

    /// Reopens an existing segment file, trusting `write_position` to be
    /// set by the caller afterwards (recovery scans the content to find
    /// the real tail).
    pub fn open_existing(path: PathBuf) -> StoreResult<MappedFile> {
        let file_from_offset = parse_file_name(&path)
            .ok_or_else(|| StoreError::Corrupt(format!("bad segment file name {:?}", path)))?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(MappedFile {
            path,
            file_from_offset,
            file_size,
            write_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
            committed_position: AtomicUsize::new(0),
            mmap: std::cell::UnsafeCell::new(mmap),
            append_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            ref_count: AtomicI64::new(1),
            available: AtomicBool::new(true),
            first_shutdown_ts: RwLock::new(None),
            store_timestamp: AtomicI64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_position(&self) -> usize {
        self.write_position.load(Ordering::Acquire)
    }

    pub fn set_write_position(&self, pos: usize) {
        self.write_position.store(pos, Ordering::Release);
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn set_flushed_position(&self, pos: usize) {
        self.flushed_position.store(pos, Ordering::Release);
    }

    pub fn remaining(&self) -> usize {
        self.file_size.saturating_sub(self.write_position())
    }

    pub fn is_full(&self) -> bool {
        self.write_position() >= self.file_size
    }

    pub fn store_timestamp(&self) -> i64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    /// Appends a pre-encoded record. Returns `EndOfFile` (without writing)
    /// when the remaining space is smaller than the record, so the caller
    /// can write a BLANK and retry on the next segment.
    pub fn append(&self, bytes: &[u8], store_ts: i64) -> AppendMessageResult {
        let _guard = self.append_lock.lock().unwrap();
        let pos = self.write_position();
        if pos + bytes.len() > self.file_size {
            return AppendMessageResult {
                status: AppendMessageStatus::EndOfFile,
                wrote_offset: self.file_from_offset + pos as i64,
                wrote_bytes: 0,
            };
        }
        unsafe {
            let mmap = &mut *self.mmap.get();
            mmap[pos..pos + bytes.len()].copy_from_slice(bytes);
        }
        self.write_position.store(pos + bytes.len(), Ordering::Release);
        self.committed_position.store(pos + bytes.len(), Ordering::Release);
        self.store_timestamp.store(store_ts, Ordering::Release);
        AppendMessageResult {
            status: AppendMessageStatus::Ok,
            wrote_offset: self.file_from_offset + pos as i64,
            wrote_bytes: bytes.len() as i32,
        }
    }

    /// Appends raw bytes verbatim (HA slave path). Returns `false` if they
    /// don't fit in the remaining space.
    pub fn append_raw(&self, bytes: &[u8]) -> bool {
        let _guard = self.append_lock.lock().unwrap();
        let pos = self.write_position();
        if pos + bytes.len() > self.file_size {
            return false;
        }
        unsafe {
            let mmap = &mut *self.mmap.get();
            mmap[pos..pos + bytes.len()].copy_from_slice(bytes);
        }
        self.write_position.store(pos + bytes.len(), Ordering::Release);
        self.committed_position.store(pos + bytes.len(), Ordering::Release);
        true
    }

    /// Writes a fixed-width unit at an absolute logical index (consume
    /// queue usage): `index * unit_size` must already be <= write_position
    /// (pre-extended files never allocate on write).
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> StoreResult<()> {
        let _guard = self.append_lock.lock().unwrap();
        if offset + bytes.len() > self.file_size {
            return Err(StoreError::Corrupt("write past segment end".into()));
        }
        unsafe {
            let mmap = &mut *self.mmap.get();
            mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        let new_write_pos = (offset + bytes.len()).max(self.write_position());
        self.write_position.store(new_write_pos, Ordering::Release);
        Ok(())
    }

    /// Flushes only if dirty pages (by page granularity) cover at least
    /// `least_pages`, or the file is full. Returns the new flushed
    /// position.
    pub fn flush(&self, least_pages: usize) -> StoreResult<usize> {
        const PAGE: usize = 4096;
        let write_pos = self.write_position();
        let flush_pos = self.flushed_position();
        if write_pos == flush_pos {
            return Ok(flush_pos);
        }
        let dirty_pages = (write_pos / PAGE).saturating_sub(flush_pos / PAGE);
        if dirty_pages < least_pages && !self.is_full() {
            return Ok(flush_pos);
        }
        let _guard = self.flush_lock.lock().unwrap();
        unsafe {
            let mmap = &*self.mmap.get();
            mmap.flush_range(flush_pos, write_pos - flush_pos)?;
        }
        self.flushed_position.store(write_pos, Ordering::Release);
        Ok(write_pos)
    }

    /// Borrows the mapping starting at `pos`, holding a reference for the
    /// lifetime of the returned guard. Returns `None` if `pos` is past the
    /// written tail or the file is no longer available.
    pub fn select(&self, pos: usize, size: Option<usize>) -> Option<MappedFileGuard<'_>> {
        if !self.hold() {
            return None;
        }
        if pos > self.write_position() {
            self.release();
            return None;
        }
        let guard = MappedFileGuard { file: self };
        let _ = size;
        Some(guard)
    }

    /// Takes a transient reference. Returns `false` if the file is already
    /// marked unavailable (destroy in progress).
    pub fn hold(&self) -> bool {
        if !self.available.load(Ordering::Acquire) {
            return false;
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        if !self.available.load(Ordering::Acquire) {
            self.release();
            return false;
        }
        true
    }

    pub fn release(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            // Paired release without a matching hold; restore and log —
            // never drive the count permanently negative.
            self.ref_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// First call marks the file unavailable and drops the creator's
    /// initial hold; returns `true` once refcount has reached zero (or the
    /// force interval elapses), at which point the caller should remove
    /// the mapping/file from disk.
    pub fn destroy(&self, force_interval_ms: i64) -> bool {
        let was_available = self.available.swap(false, Ordering::AcqRel);
        if was_available {
            self.release();
            *self.first_shutdown_ts.write().unwrap() = Some(Instant::now());
        }

        if self.ref_count() <= 0 {
            return true;
        }

        let ts = *self.first_shutdown_ts.read().unwrap();
        if let Some(ts) = ts {
            if ts.elapsed().as_millis() as i64 >= force_interval_ms {
                log::warn!(
                    "force destroying {:?} with refcount {}",
                    self.path,
                    self.ref_count()
                );
                return true;
            }
        }
        false
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn delete_file(&self) -> StoreResult<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_name_roundtrip() {
        let name = format_file_name(1024);
        assert_eq!(name, "00000000000000001024");
        let path = PathBuf::from(name);
        assert_eq!(parse_file_name(&path), Some(1024));
    }

    #[test]
    fn append_and_select() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 1024).unwrap();
        let r = mf.append(b"hello", 1);
        assert_eq!(r.status, AppendMessageStatus::Ok);
        assert_eq!(r.wrote_offset, 0);
        let guard = mf.select(0, None).unwrap();
        assert_eq!(guard.bytes(0, Some(5)), b"hello");
    }

    #[test]
    fn append_end_of_file() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 4).unwrap();
        let r = mf.append(b"hello", 1);
        assert_eq!(r.status, AppendMessageStatus::EndOfFile);
        assert_eq!(mf.write_position(), 0);
    }

    #[test]
    fn flush_respects_least_pages() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 8192).unwrap();
        mf.append(b"x", 1);
        // 1 byte dirty is less than one page worth required (least_pages=4)
        let pos = mf.flush(4).unwrap();
        assert_eq!(pos, 0);
        let pos = mf.flush(0).unwrap();
        assert_eq!(pos, 1);
    }

    #[test]
    fn destroy_waits_for_refcount() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 1024).unwrap();
        assert!(mf.hold());
        assert!(!mf.destroy(10_000));
        mf.release();
        assert!(mf.destroy(10_000));
    }

    #[test]
    fn destroy_forces_after_interval() {
        let dir = tempdir().unwrap();
        let mf = MappedFile::create(dir.path(), 0, 1024).unwrap();
        assert!(mf.hold());
        assert!(!mf.destroy(0));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(mf.destroy(0));
    }
}
