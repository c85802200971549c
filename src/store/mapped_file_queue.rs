//! Ordered collection of [`MappedFile`] segments forming one logical
//! append-only stream (section 4.2). Locate-by-offset is O(1) because
//! segments are fixed size and sorted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::StoreResult;
use crate::store::mapped_file::{parse_file_name, MappedFile};

/// Ordered collection of segments backing one logical append-only stream.
/// [`MappedFileQueue::try_pre_allocate`] creates the next segment ahead of
/// time so a steady-state append never blocks on `mmap`/`ftruncate`;
/// [`crate::store::commit_log::AllocateMappedFileService`] drives it from a
/// dedicated tokio task.
pub struct MappedFileQueue {
    dir: PathBuf,
    segment_size: usize,
    files: RwLock<Vec<Arc<MappedFile>>>,
    min_logical_offset: AtomicI64,
    pending_next: Mutex<Option<Arc<MappedFile>>>,
}

impl MappedFileQueue {
    pub fn new(dir: impl Into<PathBuf>, segment_size: usize) -> MappedFileQueue {
        MappedFileQueue {
            dir: dir.into(),
            segment_size,
            files: RwLock::new(Vec::new()),
            min_logical_offset: AtomicI64::new(0),
            pending_next: Mutex::new(None),
        }
    }

    /// Loads existing segment files from disk, sorted by starting offset.
    pub fn load(&self) -> StoreResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| parse_file_name(p).is_some())
            .collect();
        entries.sort();

        let mut files = self.files.write().unwrap();
        for path in entries {
            let mf = MappedFile::open_existing(path)?;
            files.push(Arc::new(mf));
        }
        Ok(())
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_files(&self) -> Vec<Arc<MappedFile>> {
        self.files.read().unwrap().clone()
    }

    pub fn first_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().unwrap().first().cloned()
    }

    pub fn last_file(&self) -> Option<Arc<MappedFile>> {
        self.files.read().unwrap().last().cloned()
    }

    /// Current write tail: last file's `file_from_offset + write_position`,
    /// or `min_logical_offset` if no segments exist yet.
    pub fn max_offset(&self) -> i64 {
        match self.last_file() {
            Some(f) => f.file_from_offset + f.write_position() as i64,
            None => self.min_logical_offset.load(Ordering::Acquire),
        }
    }

    pub fn min_offset(&self) -> i64 {
        match self.first_file() {
            Some(f) => f.file_from_offset + f.flushed_position().min(f.write_position()) as i64,
            None => self.min_logical_offset.load(Ordering::Acquire),
        }
        .max(self.min_logical_offset.load(Ordering::Acquire))
    }

    /// Returns the current writable file, creating a new segment aligned
    /// at `start_offset - (start_offset mod segment_size)` when the queue
    /// is empty or the tail file is full.
    pub fn last_mapped_file(&self, start_offset: i64) -> StoreResult<Arc<MappedFile>> {
        let needs_new = {
            let files = self.files.read().unwrap();
            match files.last() {
                None => true,
                Some(f) => f.is_full(),
            }
        };

        if needs_new {
            let create_offset = if self.is_empty() {
                start_offset - (start_offset % self.segment_size as i64)
            } else {
                self.max_offset()
            };

            let pending = self.pending_next.lock().unwrap().take();
            if let Some(mf) = pending {
                if mf.file_from_offset == create_offset {
                    self.files.write().unwrap().push(mf.clone());
                    return Ok(mf);
                }
                // stale pre-allocation (segment count moved on without it);
                // fall through and create the right one inline.
            }

            let mf = Arc::new(MappedFile::create(&self.dir, create_offset, self.segment_size)?);
            self.files.write().unwrap().push(mf.clone());
            return Ok(mf);
        }

        Ok(self.files.read().unwrap().last().unwrap().clone())
    }

    /// Creates the segment that will follow the current tail and caches it,
    /// so the next [`Self::last_mapped_file`] call that needs a new segment
    /// can hand it out instead of creating one inline. No-op when the tail
    /// isn't full yet or a pre-allocated segment is already cached.
    pub fn try_pre_allocate(&self) -> StoreResult<()> {
        if self.pending_next.lock().unwrap().is_some() {
            return Ok(());
        }
        let tail_full = match self.last_file() {
            Some(f) => f.is_full(),
            None => return Ok(()),
        };
        if !tail_full {
            return Ok(());
        }

        let create_offset = self.max_offset();
        let mf = Arc::new(MappedFile::create(&self.dir, create_offset, self.segment_size)?);
        *self.pending_next.lock().unwrap() = Some(mf);
        Ok(())
    }

    /// `index = (offset / segment_size) - (first.file_from_offset /
    /// segment_size)`. Out-of-range returns the first file (or `None`)
    /// depending on `return_first_on_miss`.
    pub fn find_by_offset(&self, offset: i64, return_first_on_miss: bool) -> Option<Arc<MappedFile>> {
        let files = self.files.read().unwrap();
        let first = files.first()?;
        let base = first.file_from_offset / self.segment_size as i64;
        let want = offset / self.segment_size as i64;
        let index = want - base;
        if index < 0 || index as usize >= files.len() {
            return if return_first_on_miss {
                Some(first.clone())
            } else {
                None
            };
        }
        Some(files[index as usize].clone())
    }

    /// Deletes segments whose last-store-ts is older than `expiry`,
    /// oldest-first, up to `batch_cap` per call, never touching the
    /// currently-active (last) segment. Returns the number deleted.
    pub fn delete_expired_by_time(
        &self,
        expiry_ms: i64,
        force_interval_ms: i64,
        batch_cap: usize,
        now_ms: i64,
    ) -> usize {
        let mut deleted = 0;
        loop {
            if deleted >= batch_cap {
                break;
            }
            let candidate = {
                let files = self.files.read().unwrap();
                if files.len() <= 1 {
                    None
                } else {
                    let f = &files[0];
                    let age = now_ms - f.store_timestamp();
                    if age >= expiry_ms {
                        Some(f.clone())
                    } else {
                        None
                    }
                }
            };
            match candidate {
                Some(f) => {
                    if f.destroy(force_interval_ms) {
                        let _ = f.delete_file();
                        self.files.write().unwrap().retain(|x| !Arc::ptr_eq(x, &f));
                        deleted += 1;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }
        deleted
    }

    /// Consume-queue variant: destroys a segment when its maximum
    /// referenced commit-log offset (last unit's phy_offset, read via
    /// `max_phy_offset`) is below `min_commitlog_offset`.
    pub fn delete_expired_by_offset<F>(
        &self,
        min_commitlog_offset: i64,
        max_phy_offset_of: F,
        force_interval_ms: i64,
    ) -> usize
    where
        F: Fn(&MappedFile) -> Option<i64>,
    {
        let mut deleted = 0;
        loop {
            let candidate = {
                let files = self.files.read().unwrap();
                if files.len() <= 1 {
                    None
                } else {
                    let f = &files[0];
                    match max_phy_offset_of(f) {
                        Some(max_phy) if max_phy < min_commitlog_offset => Some(f.clone()),
                        _ => None,
                    }
                }
            };
            match candidate {
                Some(f) => {
                    if f.destroy(force_interval_ms) {
                        let _ = f.delete_file();
                        self.files.write().unwrap().retain(|x| !Arc::ptr_eq(x, &f));
                        deleted += 1;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }
        deleted
    }

    /// Recovery helper: for each file whose tail exceeds `offset`, either
    /// rewind write/flush positions or destroy it entirely if it starts
    /// past `offset`.
    pub fn truncate_dirty(&self, offset: i64) {
        let mut files = self.files.write().unwrap();
        let mut keep = Vec::with_capacity(files.len());
        for f in files.drain(..) {
            if f.file_from_offset >= offset {
                let _ = f.delete_file();
                continue;
            }
            let tail = f.file_from_offset + f.file_size as i64;
            if tail > offset {
                let new_pos = (offset - f.file_from_offset) as usize;
                f.set_write_position(new_pos);
                f.set_flushed_position(new_pos.min(f.flushed_position()));
            }
            keep.push(f);
        }
        *files = keep;
    }

    /// Flushes only the tail segment — earlier segments are already
    /// immutable once rolled past, so there's never anything left to
    /// flush in them.
    pub fn flush(&self, least_pages: usize) -> usize {
        match self.last_file() {
            Some(f) => f.flush(least_pages).unwrap_or(0),
            None => 0,
        }
    }

    pub fn set_min_logical_offset(&self, offset: i64) {
        self.min_logical_offset.store(offset, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn last_mapped_file_creates_aligned_segment() {
        let dir = tempdir().unwrap();
        let q = MappedFileQueue::new(dir.path(), 1024);
        let f = q.last_mapped_file(1500).unwrap();
        assert_eq!(f.file_from_offset, 1024);
    }

    #[test]
    fn try_pre_allocate_caches_segment_last_mapped_file_then_reuses() {
        let dir = tempdir().unwrap();
        let q = MappedFileQueue::new(dir.path(), 100);
        let f0 = q.last_mapped_file(0).unwrap();
        f0.set_write_position(100);
        assert!(f0.is_full());

        q.try_pre_allocate().unwrap();
        assert_eq!(q.len(), 1, "pre-allocation caches the segment without publishing it yet");

        let f1 = q.last_mapped_file(100).unwrap();
        assert_eq!(f1.file_from_offset, 100);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn find_by_offset_locates_segment() {
        let dir = tempdir().unwrap();
        let q = MappedFileQueue::new(dir.path(), 100);
        q.last_mapped_file(0).unwrap().set_write_position(100);
        let f2 = q.last_mapped_file(100).unwrap();
        assert_eq!(f2.file_from_offset, 100);

        let found = q.find_by_offset(50, false).unwrap();
        assert_eq!(found.file_from_offset, 0);
        let found = q.find_by_offset(150, false).unwrap();
        assert_eq!(found.file_from_offset, 100);
    }

    #[test]
    fn find_by_offset_out_of_range() {
        let dir = tempdir().unwrap();
        let q = MappedFileQueue::new(dir.path(), 100);
        q.last_mapped_file(0).unwrap();
        assert!(q.find_by_offset(10_000, false).is_none());
        assert!(q.find_by_offset(10_000, true).is_some());
    }

    #[test]
    fn truncate_dirty_rewinds_and_deletes() {
        let dir = tempdir().unwrap();
        let q = MappedFileQueue::new(dir.path(), 100);
        let f0 = q.last_mapped_file(0).unwrap();
        f0.set_write_position(100);
        f0.set_flushed_position(100);
        let f1 = q.last_mapped_file(100).unwrap();
        f1.set_write_position(50);

        q.truncate_dirty(130);
        assert_eq!(q.len(), 2);
        assert_eq!(q.last_file().unwrap().write_position(), 30);
    }
}
