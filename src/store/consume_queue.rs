//! Per-(topic, queueId) fixed-width index projecting commit-log offsets
//! (section 4.4). Each unit is 20 bytes: `phy_offset(8) size(4)
//! tags_hash(8)`.

use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use crate::error::StoreResult;
use crate::store::mapped_file_queue::MappedFileQueue;

pub const UNIT_SIZE: usize = 20;

/// Segment size expressed in units (default 300,000 units x 20 bytes, per
/// spec.md section 3).
pub const DEFAULT_UNITS_PER_SEGMENT: usize = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeQueueUnit {
    pub phy_offset: i64,
    pub size: i32,
    pub tags_code: i64,
}

impl ConsumeQueueUnit {
    fn encode(&self) -> [u8; UNIT_SIZE] {
        let mut buf = [0u8; UNIT_SIZE];
        BigEndian::write_i64(&mut buf[0..8], self.phy_offset);
        BigEndian::write_i32(&mut buf[8..12], self.size);
        BigEndian::write_i64(&mut buf[12..20], self.tags_code);
        buf
    }

    fn decode(buf: &[u8]) -> ConsumeQueueUnit {
        ConsumeQueueUnit {
            phy_offset: BigEndian::read_i64(&buf[0..8]),
            size: BigEndian::read_i32(&buf[8..12]),
            tags_code: BigEndian::read_i64(&buf[12..20]),
        }
    }
}

pub struct ConsumeQueue {
    pub topic: String,
    pub queue_id: i32,
    queue: MappedFileQueue,
    min_logic_offset: AtomicI64,
}

impl ConsumeQueue {
    pub fn new(root: &Path, topic: &str, queue_id: i32) -> ConsumeQueue {
        let dir = root.join(topic).join(queue_id.to_string());
        let segment_bytes = DEFAULT_UNITS_PER_SEGMENT * UNIT_SIZE;
        ConsumeQueue {
            topic: topic.to_string(),
            queue_id,
            queue: MappedFileQueue::new(dir, segment_bytes),
            min_logic_offset: AtomicI64::new(0),
        }
    }

    pub fn load(&self) -> StoreResult<()> {
        self.queue.load()
    }

    /// Writes the unit at `logic_offset * 20`, extending into a new
    /// segment if the current one is exactly full.
    pub fn put_index(&self, unit: ConsumeQueueUnit, logic_offset: i64) -> StoreResult<()> {
        let byte_offset = logic_offset as i64 * UNIT_SIZE as i64;
        let mf = self.queue.last_mapped_file(byte_offset)?;
        let local = (byte_offset - mf.file_from_offset) as usize;
        if local + UNIT_SIZE > mf.file_size {
            // current segment has no room for a full unit; roll to the
            // next one instead of straddling (units never straddle).
            mf.set_write_position(mf.file_size);
            let mf = self.queue.last_mapped_file(byte_offset)?;
            let local = (byte_offset - mf.file_from_offset) as usize;
            mf.write_at(local, &unit.encode())?;
        } else {
            mf.write_at(local, &unit.encode())?;
        }
        Ok(())
    }

    pub fn get_unit(&self, logic_offset: i64) -> Option<ConsumeQueueUnit> {
        let byte_offset = logic_offset * UNIT_SIZE as i64;
        let mf = self.queue.find_by_offset(byte_offset, false)?;
        let local = (byte_offset - mf.file_from_offset) as usize;
        let guard = mf.select(local, Some(UNIT_SIZE))?;
        let bytes = guard.bytes(local, Some(UNIT_SIZE));
        if bytes.len() < UNIT_SIZE {
            return None;
        }
        Some(ConsumeQueueUnit::decode(bytes))
    }

    pub fn min_offset_in_queue(&self) -> i64 {
        self.min_logic_offset.load(Ordering::Acquire)
    }

    pub fn max_offset_in_queue(&self) -> i64 {
        self.queue.max_offset() / UNIT_SIZE as i64
    }

    /// Binary search over units: narrows the range by comparing each
    /// candidate unit's commit-log store timestamp (via `store_ts_of`)
    /// against `ts`.
    pub fn offset_by_time<F>(&self, ts: i64, store_ts_of: F) -> i64
    where
        F: Fn(i64, i32) -> Option<i64>,
    {
        let min = self.min_offset_in_queue();
        let max = self.max_offset_in_queue() - 1;
        if max < min {
            return 0;
        }
        let (mut lo, mut hi) = (min, max);
        let mut result = min;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let unit = match self.get_unit(mid) {
                Some(u) => u,
                None => break,
            };
            let store_ts = store_ts_of(unit.phy_offset, unit.size).unwrap_or(i64::MAX);
            if store_ts < ts {
                result = mid;
                lo = mid + 1;
            } else if store_ts > ts {
                if mid == min {
                    break;
                }
                hi = mid - 1;
            } else {
                return mid;
            }
        }
        result
    }

    /// Scans from the current head, setting `min_logic_offset` to the
    /// first unit whose `phy_offset >= min_phy_offset`.
    pub fn correct_min_offset(&self, min_phy_offset: i64) {
        let max = self.max_offset_in_queue();
        let mut offset = self.min_offset_in_queue();
        while offset < max {
            match self.get_unit(offset) {
                Some(u) if u.phy_offset >= min_phy_offset => break,
                Some(_) => offset += 1,
                None => break,
            }
        }
        self.min_logic_offset.store(offset, Ordering::Release);
    }

    pub fn max_phy_offset(&self) -> Option<i64> {
        let max = self.max_offset_in_queue();
        if max == 0 {
            return None;
        }
        self.get_unit(max - 1).map(|u| u.phy_offset)
    }

    /// Deletes whole leading segments whose maximum referenced commit-log
    /// offset (the last unit physically stored in that segment) is below
    /// `min_commitlog_offset` — the consume-queue half of cleanup (section
    /// 4.9). Never touches the active (last) segment.
    pub fn delete_expired_segments(&self, min_commitlog_offset: i64, force_interval_ms: i64) -> usize {
        self.queue.delete_expired_by_offset(
            min_commitlog_offset,
            |mf| {
                let unit_count = mf.write_position() / UNIT_SIZE;
                if unit_count == 0 {
                    return None;
                }
                let last = (unit_count - 1) * UNIT_SIZE;
                let guard = mf.select(last, Some(UNIT_SIZE))?;
                let bytes = guard.bytes(last, Some(UNIT_SIZE));
                if bytes.len() < UNIT_SIZE {
                    return None;
                }
                Some(ConsumeQueueUnit::decode(bytes).phy_offset)
            },
            force_interval_ms,
        )
    }

    pub fn truncate_dirty(&self, phy_offset: i64) {
        let max = self.max_offset_in_queue();
        let mut cut_at = max;
        for i in (0..max).rev() {
            if let Some(u) = self.get_unit(i) {
                if u.phy_offset + u.size as i64 > phy_offset {
                    cut_at = i;
                } else {
                    break;
                }
            }
        }
        self.queue.truncate_dirty(cut_at * UNIT_SIZE as i64);
    }

    pub fn flush(&self) -> usize {
        self.queue.flush(1)
    }

    pub fn queue(&self) -> &MappedFileQueue {
        &self.queue
    }
}

/// `topic -> queueId -> ConsumeQueue`, one reader-writer lock per table
/// (per the spec's Open Question guidance, not one lock per topic).
pub struct ConsumeQueueStore {
    root: PathBuf,
    table: RwLock<HashMap<String, HashMap<i32, std::sync::Arc<ConsumeQueue>>>>,
}

impl ConsumeQueueStore {
    pub fn new(root: impl Into<PathBuf>) -> ConsumeQueueStore {
        ConsumeQueueStore {
            root: root.into(),
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, topic: &str, queue_id: i32) -> std::sync::Arc<ConsumeQueue> {
        {
            let table = self.table.read().unwrap();
            if let Some(q) = table.get(topic).and_then(|m| m.get(&queue_id)) {
                return q.clone();
            }
        }
        let mut table = self.table.write().unwrap();
        let per_topic = table.entry(topic.to_string()).or_insert_with(HashMap::new);
        per_topic
            .entry(queue_id)
            .or_insert_with(|| std::sync::Arc::new(ConsumeQueue::new(&self.root, topic, queue_id)))
            .clone()
    }

    pub fn get(&self, topic: &str, queue_id: i32) -> Option<std::sync::Arc<ConsumeQueue>> {
        self.table.read().unwrap().get(topic)?.get(&queue_id).cloned()
    }

    /// Walks `root/<topic>/<queueId>` at startup and reopens every
    /// consume queue left on disk, so a restarted broker doesn't forget
    /// about a topic until the next message for it arrives.
    pub fn load_all(&self) -> StoreResult<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for topic_entry in std::fs::read_dir(&self.root)? {
            let topic_entry = topic_entry?;
            if !topic_entry.file_type()?.is_dir() {
                continue;
            }
            let topic = topic_entry.file_name().to_string_lossy().to_string();
            for qid_entry in std::fs::read_dir(topic_entry.path())? {
                let qid_entry = qid_entry?;
                if !qid_entry.file_type()?.is_dir() {
                    continue;
                }
                let qid: i32 = match qid_entry.file_name().to_string_lossy().parse() {
                    Ok(q) => q,
                    Err(_) => continue,
                };
                let cq = self.get_or_create(&topic, qid);
                cq.load()?;
            }
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<std::sync::Arc<ConsumeQueue>> {
        self.table
            .read()
            .unwrap()
            .values()
            .flat_map(|m| m.values().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_and_get_unit() {
        let dir = tempdir().unwrap();
        let cq = ConsumeQueue::new(dir.path(), "T", 0);
        for i in 0..3 {
            cq.put_index(
                ConsumeQueueUnit {
                    phy_offset: i * 100,
                    size: 90,
                    tags_code: 0,
                },
                i,
            )
            .unwrap();
        }
        assert_eq!(cq.max_offset_in_queue(), 3);
        let u = cq.get_unit(1).unwrap();
        assert_eq!(u.phy_offset, 100);
        assert_eq!(u.size, 90);
    }

    #[test]
    fn correct_min_offset_advances_past_removed_units() {
        let dir = tempdir().unwrap();
        let cq = ConsumeQueue::new(dir.path(), "T", 0);
        for i in 0..5 {
            cq.put_index(
                ConsumeQueueUnit {
                    phy_offset: i * 100,
                    size: 90,
                    tags_code: 0,
                },
                i,
            )
            .unwrap();
        }
        cq.correct_min_offset(250);
        assert_eq!(cq.min_offset_in_queue(), 3);
    }

    #[test]
    fn store_creates_per_topic_queue_on_demand() {
        let dir = tempdir().unwrap();
        let store = ConsumeQueueStore::new(dir.path());
        let a = store.get_or_create("T", 0);
        let b = store.get_or_create("T", 0);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(store.all().len(), 1);
    }
}
