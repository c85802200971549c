//! Persists three flush timestamps so recovery knows where it's safe to
//! resume from (section 4.10): commit-log flush, consume-queue flush, and
//! index-file flush. Fixed-size file: three big-endian i64s.

use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::StoreResult;

const FILE_SIZE: usize = 3 * 8;

pub struct StoreCheckpoint {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    physic_msg_timestamp: AtomicI64,
    logics_msg_timestamp: AtomicI64,
    index_msg_timestamp: AtomicI64,
}

impl StoreCheckpoint {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<StoreCheckpoint> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.set_len(FILE_SIZE as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let physic = BigEndian::read_i64(&mmap[0..8]);
        let logics = BigEndian::read_i64(&mmap[8..16]);
        let index = BigEndian::read_i64(&mmap[16..24]);

        Ok(StoreCheckpoint {
            path,
            mmap: Mutex::new(mmap),
            physic_msg_timestamp: AtomicI64::new(physic),
            logics_msg_timestamp: AtomicI64::new(logics),
            index_msg_timestamp: AtomicI64::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn physic_msg_timestamp(&self) -> i64 {
        self.physic_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn logics_msg_timestamp(&self) -> i64 {
        self.logics_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn index_msg_timestamp(&self) -> i64 {
        self.index_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physic_msg_timestamp(&self, ts: i64) {
        self.physic_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn set_logics_msg_timestamp(&self, ts: i64) {
        self.logics_msg_timestamp.store(ts, Ordering::Release);
    }

    pub fn set_index_msg_timestamp(&self, ts: i64) {
        self.index_msg_timestamp.store(ts, Ordering::Release);
    }

    /// `min(physical, logical, index)`: recovery resumes from here.
    pub fn min_timestamp(&self) -> i64 {
        self.physic_msg_timestamp()
            .min(self.logics_msg_timestamp())
            .min(self.index_msg_timestamp())
    }

    pub fn flush(&self) -> StoreResult<()> {
        let mut mmap = self.mmap.lock().unwrap();
        BigEndian::write_i64(&mut mmap[0..8], self.physic_msg_timestamp());
        BigEndian::write_i64(&mut mmap[8..16], self.logics_msg_timestamp());
        BigEndian::write_i64(&mut mmap[16..24], self.index_msg_timestamp());
        mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint");
        {
            let cp = StoreCheckpoint::open(&path).unwrap();
            cp.set_physic_msg_timestamp(100);
            cp.set_logics_msg_timestamp(90);
            cp.set_index_msg_timestamp(95);
            cp.flush().unwrap();
        }
        let cp2 = StoreCheckpoint::open(&path).unwrap();
        assert_eq!(cp2.physic_msg_timestamp(), 100);
        assert_eq!(cp2.min_timestamp(), 90);
    }
}
