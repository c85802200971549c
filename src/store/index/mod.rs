mod index_file;

pub use index_file::IndexFile;

use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::StoreResult;
use crate::message::tags_hash_code;

const DEFAULT_HASH_SLOT_COUNT: i32 = 5_000_000;
const DEFAULT_MAX_INDEX_COUNT: i32 = 20_000_000;

/// Owns the rotating set of [`IndexFile`] segments and the `topic#key`
/// hashing convention. One write lock covers rotation decisions; the
/// individual `IndexFile`s have their own internal locking for the
/// concurrent insert/query path.
pub struct IndexService {
    dir: PathBuf,
    hash_slot_count: i32,
    max_index_count: i32,
    files: RwLock<Vec<std::sync::Arc<IndexFile>>>,
}

pub fn index_key_hash(topic: &str, key: &str) -> i32 {
    let combined = format!("{}#{}", topic, key);
    tags_hash_code(&combined) as i32
}

impl IndexService {
    pub fn new(dir: impl Into<PathBuf>) -> IndexService {
        IndexService {
            dir: dir.into(),
            hash_slot_count: DEFAULT_HASH_SLOT_COUNT,
            max_index_count: DEFAULT_MAX_INDEX_COUNT,
            files: RwLock::new(Vec::new()),
        }
    }

    /// Reopens every segment left on disk from a previous run, sorted by
    /// the `begin_timestamp`-derived file name so `select`'s newest-first
    /// scan order is preserved.
    pub fn load(&self) -> StoreResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        let mut files = self.files.write().unwrap();
        for path in entries {
            files.push(std::sync::Arc::new(IndexFile::open_existing(path)?));
        }
        Ok(())
    }

    fn current_file(&self, now_ms: i64) -> StoreResult<std::sync::Arc<IndexFile>> {
        {
            let files = self.files.read().unwrap();
            if let Some(f) = files.last() {
                if !f.is_full() {
                    return Ok(f.clone());
                }
            }
        }
        let mut files = self.files.write().unwrap();
        if let Some(f) = files.last() {
            if !f.is_full() {
                return Ok(f.clone());
            }
        }
        let name = format!("{:020}", now_ms);
        let f = std::sync::Arc::new(IndexFile::create(
            &self.dir,
            &name,
            self.hash_slot_count,
            self.max_index_count,
        )?);
        files.push(f.clone());
        Ok(f)
    }

    /// Inserts one `(topic, key) -> phy_offset` entry, used by the
    /// dispatcher whenever a put message carries a non-empty `KEYS`
    /// property (possibly space-separated multiple keys).
    pub fn put_key(&self, topic: &str, key: &str, phy_offset: i64, store_timestamp: i64) -> StoreResult<()> {
        let file = self.current_file(store_timestamp)?;
        let hash = index_key_hash(topic, key);
        file.put_key(hash, phy_offset, store_timestamp);
        Ok(())
    }

    /// Flushes only the currently-active segment, matching the
    /// commit-log/consume-queue flush pattern (earlier segments are
    /// immutable once rotated past).
    pub fn flush_current(&self) -> StoreResult<()> {
        if let Some(f) = self.files.read().unwrap().last() {
            f.flush()?;
        }
        Ok(())
    }

    /// Range query across all segments whose timestamp window overlaps
    /// `[begin_ts, end_ts]`, newest segment first.
    pub fn select(&self, topic: &str, key: &str, begin_ts: i64, end_ts: i64, max_results: usize) -> Vec<i64> {
        let hash = index_key_hash(topic, key);
        let files = self.files.read().unwrap();
        let mut out = Vec::new();
        for f in files.iter().rev() {
            if out.len() >= max_results {
                break;
            }
            out.extend(f.select_phy_offsets(hash, begin_ts, end_ts, max_results - out.len()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_and_select_via_service() {
        let dir = tempdir().unwrap();
        let svc = IndexService::new(dir.path());
        svc.put_key("T", "order-1", 100, 1_000).unwrap();
        svc.put_key("T", "order-1", 200, 2_000).unwrap();
        svc.put_key("T", "order-2", 300, 3_000).unwrap();

        let found = svc.select("T", "order-1", 0, 10_000, 10);
        assert_eq!(found, vec![200, 100]);
    }
}
