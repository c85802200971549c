//! Content-addressed lookup from `hash(topic#key)` and timestamp to
//! commit-log offset (section 3/4). A fixed-size hash-table-on-disk: a
//! slot array of `hash_slot_count` i32 slots (each the index of the most
//! recently inserted entry for that bucket), followed by an entry array
//! that chains through `prev_index` back to older entries for the same
//! slot — the classic separate-chaining-on-disk layout.

use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::RwLock;

use crate::error::StoreResult;

const HEADER_SIZE: usize = 40;
const SLOT_SIZE: usize = 4;
/// `key_hash(4) phy_offset(8) time_diff(4) prev_index(4)`
const ENTRY_SIZE: usize = 20;
const INVALID_INDEX: i32 = 0;

fn write_header(mmap: &mut MmapMut, header: &IndexHeader) {
    BigEndian::write_i64(&mut mmap[0..8], header.begin_timestamp);
    BigEndian::write_i64(&mut mmap[8..16], header.end_timestamp);
    BigEndian::write_i64(&mut mmap[16..24], header.begin_phy_offset);
    BigEndian::write_i64(&mut mmap[24..32], header.end_phy_offset);
    BigEndian::write_i32(&mut mmap[32..36], header.hash_slot_count);
    BigEndian::write_i32(&mut mmap[36..40], header.index_count);
}

fn read_header(mmap: &MmapMut) -> IndexHeader {
    IndexHeader {
        begin_timestamp: BigEndian::read_i64(&mmap[0..8]),
        end_timestamp: BigEndian::read_i64(&mmap[8..16]),
        begin_phy_offset: BigEndian::read_i64(&mmap[16..24]),
        end_phy_offset: BigEndian::read_i64(&mmap[24..32]),
        hash_slot_count: BigEndian::read_i32(&mmap[32..36]),
        index_count: BigEndian::read_i32(&mmap[36..40]),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
    pub begin_phy_offset: i64,
    pub end_phy_offset: i64,
    pub hash_slot_count: i32,
    pub index_count: i32,
}

/// One content-addressed segment file. Indexed files are rotated by
/// [`super::IndexService`] the same way commit-log/consume-queue segments
/// are, keyed by their `begin_timestamp`.
pub struct IndexFile {
    path: PathBuf,
    mmap: std::sync::Mutex<MmapMut>,
    hash_slot_count: i32,
    max_index_count: i32,
    index_count: AtomicI32,
    header: RwLock<IndexHeader>,
}

impl IndexFile {
    pub fn create(dir: &Path, name: &str, hash_slot_count: i32, max_index_count: i32) -> StoreResult<IndexFile> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let total = HEADER_SIZE + hash_slot_count as usize * SLOT_SIZE + max_index_count as usize * ENTRY_SIZE;
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.set_len(total as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        write_header(
            &mut mmap,
            &IndexHeader {
                begin_timestamp: 0,
                end_timestamp: 0,
                begin_phy_offset: 0,
                end_phy_offset: 0,
                hash_slot_count,
                index_count: 0,
            },
        );
        Ok(IndexFile {
            path,
            mmap: std::sync::Mutex::new(mmap),
            hash_slot_count,
            max_index_count,
            index_count: AtomicI32::new(0),
            header: RwLock::new(IndexHeader {
                begin_timestamp: 0,
                end_timestamp: 0,
                begin_phy_offset: 0,
                end_phy_offset: 0,
                hash_slot_count,
                index_count: 0,
            }),
        })
    }

    /// Reopens a segment previously written by [`IndexFile::create`],
    /// restoring `hash_slot_count`/`index_count` from the persisted
    /// header (bytes `0..HEADER_SIZE`) and deriving `max_index_count` from
    /// the file's length, so a restarted broker keeps appending to the
    /// same segment instead of starting it over.
    pub fn open_existing(path: impl Into<PathBuf>) -> StoreResult<IndexFile> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = read_header(&mmap);
        let hash_slot_count = header.hash_slot_count;
        let max_index_count = if hash_slot_count > 0 {
            ((len - HEADER_SIZE - hash_slot_count as usize * SLOT_SIZE) / ENTRY_SIZE) as i32
        } else {
            0
        };
        let index_count = header.index_count;
        Ok(IndexFile {
            path,
            mmap: std::sync::Mutex::new(mmap),
            hash_slot_count,
            max_index_count,
            index_count: AtomicI32::new(index_count),
            header: RwLock::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_full(&self) -> bool {
        self.index_count.load(Ordering::Acquire) >= self.max_index_count
    }

    pub fn header_begin_timestamp(&self) -> i64 {
        self.header.read().unwrap().begin_timestamp
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.mmap.lock().unwrap().flush()?;
        Ok(())
    }

    fn slot_pos(&self, key_hash: i32) -> usize {
        let slot = (key_hash.unsigned_abs() as usize) % self.hash_slot_count as usize;
        HEADER_SIZE + slot * SLOT_SIZE
    }

    /// Inserts one entry: `key_hash -> (phy_offset, store_timestamp)`.
    pub fn put_key(&self, key_hash: i32, phy_offset: i64, store_timestamp: i64) -> bool {
        if self.is_full() {
            return false;
        }
        let mut mmap = self.mmap.lock().unwrap();
        let mut header = self.header.write().unwrap();
        if header.begin_phy_offset == 0 && header.begin_timestamp == 0 {
            header.begin_phy_offset = phy_offset;
            header.begin_timestamp = store_timestamp;
        }

        let slot_pos = self.slot_pos(key_hash);
        let prev_index = BigEndian::read_i32(&mmap[slot_pos..slot_pos + 4]);
        let prev_index = if prev_index < 0 { INVALID_INDEX } else { prev_index };

        let new_index = self.index_count.fetch_add(1, Ordering::AcqRel);
        let entry_pos = HEADER_SIZE + self.hash_slot_count as usize * SLOT_SIZE + new_index as usize * ENTRY_SIZE;
        let time_diff = (store_timestamp - header.begin_timestamp).max(0) as i32;

        BigEndian::write_i32(&mut mmap[entry_pos..entry_pos + 4], key_hash);
        BigEndian::write_i64(&mut mmap[entry_pos + 4..entry_pos + 12], phy_offset);
        BigEndian::write_i32(&mut mmap[entry_pos + 12..entry_pos + 16], time_diff);
        BigEndian::write_i32(&mut mmap[entry_pos + 16..entry_pos + 20], prev_index + 1);

        BigEndian::write_i32(&mut mmap[slot_pos..slot_pos + 4], new_index + 1);

        header.end_phy_offset = phy_offset;
        header.end_timestamp = store_timestamp;
        header.index_count = new_index + 1;
        write_header(&mut mmap, &header);
        true
    }

    /// Returns up to `max_results` physical offsets for `key_hash` whose
    /// store timestamp falls within `[begin_ts, end_ts]`, newest first.
    pub fn select_phy_offsets(
        &self,
        key_hash: i32,
        begin_ts: i64,
        end_ts: i64,
        max_results: usize,
    ) -> Vec<i64> {
        let mmap = self.mmap.lock().unwrap();
        let header = self.header.read().unwrap();
        let slot_pos = self.slot_pos(key_hash);
        let mut slot_value = BigEndian::read_i32(&mmap[slot_pos..slot_pos + 4]);

        let mut out = Vec::new();
        let mut guard = 0;
        while slot_value > INVALID_INDEX && guard < self.max_index_count {
            guard += 1;
            let idx = slot_value - 1;
            let entry_pos = HEADER_SIZE + self.hash_slot_count as usize * SLOT_SIZE + idx as usize * ENTRY_SIZE;
            if entry_pos + ENTRY_SIZE > mmap.len() {
                break;
            }
            let stored_hash = BigEndian::read_i32(&mmap[entry_pos..entry_pos + 4]);
            let phy_offset = BigEndian::read_i64(&mmap[entry_pos + 4..entry_pos + 12]);
            let time_diff = BigEndian::read_i32(&mmap[entry_pos + 12..entry_pos + 16]);
            let prev = BigEndian::read_i32(&mmap[entry_pos + 16..entry_pos + 20]);

            let ts = header.begin_timestamp + time_diff as i64;
            if stored_hash == key_hash && ts >= begin_ts && ts <= end_ts {
                out.push(phy_offset);
                if out.len() >= max_results {
                    break;
                }
            }
            slot_value = prev;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_and_select_roundtrip() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::create(dir.path(), "00000000000000000000", 64, 100).unwrap();
        assert!(idx.put_key(42, 1000, 5_000));
        assert!(idx.put_key(42, 2000, 6_000));
        assert!(idx.put_key(7, 3000, 7_000));

        let found = idx.select_phy_offsets(42, 0, 10_000, 10);
        assert_eq!(found, vec![2000, 1000]);
    }

    #[test]
    fn respects_time_window() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::create(dir.path(), "00000000000000000000", 64, 100).unwrap();
        idx.put_key(42, 1000, 5_000);
        idx.put_key(42, 2000, 9_000);
        let found = idx.select_phy_offsets(42, 0, 6_000, 10);
        assert_eq!(found, vec![1000]);
    }

    #[test]
    fn becomes_full() {
        let dir = tempdir().unwrap();
        let idx = IndexFile::create(dir.path(), "00000000000000000000", 4, 2).unwrap();
        assert!(idx.put_key(1, 1, 1));
        assert!(idx.put_key(2, 2, 2));
        assert!(!idx.put_key(3, 3, 3));
    }
}
