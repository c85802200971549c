//! `consumerGroup -> (queueKey -> offset)` (section 4.11), grounded on
//! `stgbroker/offset_table.go`'s `topic@queueId` string keying, persisted
//! as `config/consumerOffset.json`.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::broker::config_manager::ConfigManager;
use crate::broker::data_version::DataVersion;

pub fn queue_key(topic: &str, queue_id: i32) -> String {
    format!("{}@{}", topic, queue_id)
}

#[derive(Serialize, Deserialize)]
struct ConsumerOffsetSerializeWrapper {
    data_version: DataVersion,
    offset_table: HashMap<String, HashMap<String, i64>>,
}

pub struct OffsetManager {
    config_path: PathBuf,
    table: RwLock<HashMap<String, HashMap<String, i64>>>,
    data_version: RwLock<DataVersion>,
}

impl OffsetManager {
    pub fn new(store_root: impl AsRef<Path>) -> OffsetManager {
        OffsetManager {
            config_path: store_root.as_ref().join("config").join("consumerOffset.json"),
            table: RwLock::new(HashMap::new()),
            data_version: RwLock::new(DataVersion::default()),
        }
    }

    pub fn data_version(&self) -> DataVersion {
        *self.data_version.read().unwrap()
    }

    pub fn query_offset(&self, group: &str, topic: &str, queue_id: i32) -> Option<i64> {
        self.table
            .read()
            .unwrap()
            .get(group)
            .and_then(|m| m.get(&queue_key(topic, queue_id)))
            .copied()
    }

    /// `UPDATE_CONSUMER_OFFSET` handler (section 6). Consumer offsets only
    /// move forward unless `force` is set, mirroring the original's guard
    /// against a stale consumer ack rewinding a faster one.
    pub fn commit_offset(&self, group: &str, topic: &str, queue_id: i32, offset: i64, force: bool) {
        let now = crate::message::now_millis();
        {
            let mut table = self.table.write().unwrap();
            let group_table = table.entry(group.to_string()).or_insert_with(HashMap::new);
            let key = queue_key(topic, queue_id);
            match group_table.get(&key) {
                Some(&existing) if !force && existing >= offset => {}
                _ => {
                    group_table.insert(key, offset);
                }
            }
        }
        let mut v = self.data_version.write().unwrap();
        *v = v.next(now);
    }

    pub fn offsets_for_group(&self, group: &str) -> HashMap<String, i64> {
        self.table.read().unwrap().get(group).cloned().unwrap_or_default()
    }
}

impl ConfigManager for OffsetManager {
    type Persisted = ConsumerOffsetSerializeWrapper;

    fn config_file_path(&self) -> PathBuf {
        self.config_path.clone()
    }

    fn encode(&self) -> ConsumerOffsetSerializeWrapper {
        ConsumerOffsetSerializeWrapper {
            data_version: self.data_version(),
            offset_table: self.table.read().unwrap().clone(),
        }
    }

    fn decode(&self, persisted: ConsumerOffsetSerializeWrapper) {
        *self.table.write().unwrap() = persisted.offset_table;
        *self.data_version.write().unwrap() = persisted.data_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_then_query() {
        let dir = tempdir().unwrap();
        let mgr = OffsetManager::new(dir.path());
        mgr.commit_offset("G", "T", 0, 10, false);
        assert_eq!(mgr.query_offset("G", "T", 0), Some(10));
    }

    #[test]
    fn commit_does_not_rewind_without_force() {
        let dir = tempdir().unwrap();
        let mgr = OffsetManager::new(dir.path());
        mgr.commit_offset("G", "T", 0, 10, false);
        mgr.commit_offset("G", "T", 0, 3, false);
        assert_eq!(mgr.query_offset("G", "T", 0), Some(10));
    }

    #[test]
    fn forced_commit_can_rewind() {
        let dir = tempdir().unwrap();
        let mgr = OffsetManager::new(dir.path());
        mgr.commit_offset("G", "T", 0, 10, false);
        mgr.commit_offset("G", "T", 0, 3, true);
        assert_eq!(mgr.query_offset("G", "T", 0), Some(3));
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempdir().unwrap();
        let mgr = OffsetManager::new(dir.path());
        mgr.commit_offset("G", "T", 0, 42, false);
        mgr.persist().unwrap();

        let reloaded = OffsetManager::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.query_offset("G", "T", 0), Some(42));
    }
}
