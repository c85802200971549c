//! In-memory topic metadata table keyed by topic name (section 4.11),
//! grounded on `stgbroker/table/topic_config_table.go` in spirit: perms
//! and queue counts per topic, persisted as `config/topics.json`.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::broker::config_manager::ConfigManager;
use crate::broker::data_version::DataVersion;

pub mod perm {
    pub const READ: i32 = 1 << 2;
    pub const WRITE: i32 = 1 << 1;
    pub const INHERIT: i32 = 1;
    pub const READ_WRITE: i32 = READ | WRITE;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    pub topic_name: String,
    pub read_queue_nums: i32,
    pub write_queue_nums: i32,
    pub perm: i32,
}

impl TopicConfig {
    pub fn new(topic_name: impl Into<String>) -> TopicConfig {
        TopicConfig {
            topic_name: topic_name.into(),
            read_queue_nums: 4,
            write_queue_nums: 4,
            perm: perm::READ_WRITE,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TopicConfigSerializeWrapper {
    data_version: DataVersion,
    topic_config_table: HashMap<String, TopicConfig>,
}

pub struct TopicConfigManager {
    config_path: PathBuf,
    table: RwLock<HashMap<String, TopicConfig>>,
    data_version: RwLock<DataVersion>,
}

impl TopicConfigManager {
    pub fn new(store_root: impl AsRef<Path>) -> TopicConfigManager {
        TopicConfigManager {
            config_path: store_root.as_ref().join("config").join("topics.json"),
            table: RwLock::new(HashMap::new()),
            data_version: RwLock::new(DataVersion::default()),
        }
    }

    pub fn data_version(&self) -> DataVersion {
        *self.data_version.read().unwrap()
    }

    pub fn get(&self, topic: &str) -> Option<TopicConfig> {
        self.table.read().unwrap().get(topic).cloned()
    }

    /// Creates or updates a topic's config and bumps the data version the
    /// way every mutating broker-side manager call does (section 4.11).
    pub fn put(&self, config: TopicConfig) {
        let now = crate::message::now_millis();
        let mut table = self.table.write().unwrap();
        table.insert(config.topic_name.clone(), config);
        drop(table);
        let mut v = self.data_version.write().unwrap();
        *v = v.next(now);
    }

    pub fn delete(&self, topic: &str) -> bool {
        let now = crate::message::now_millis();
        let removed = self.table.write().unwrap().remove(topic).is_some();
        if removed {
            let mut v = self.data_version.write().unwrap();
            *v = v.next(now);
        }
        removed
    }

    pub fn all_topics(&self) -> Vec<String> {
        self.table.read().unwrap().keys().cloned().collect()
    }

    /// Applied by a slave when the master's `DataVersion` is newer
    /// (section 4.11: "Slaves periodically pull these four documents from
    /// master and apply when the master's `DataVersion` is newer").
    pub fn apply_from_master(&self, master_table: HashMap<String, TopicConfig>, master_version: DataVersion) -> bool {
        let mine = self.data_version();
        if !master_version.is_newer_than(&mine) {
            return false;
        }
        *self.table.write().unwrap() = master_table;
        *self.data_version.write().unwrap() = master_version;
        true
    }
}

impl ConfigManager for TopicConfigManager {
    type Persisted = TopicConfigSerializeWrapper;

    fn config_file_path(&self) -> PathBuf {
        self.config_path.clone()
    }

    fn encode(&self) -> TopicConfigSerializeWrapper {
        TopicConfigSerializeWrapper {
            data_version: self.data_version(),
            topic_config_table: self.table.read().unwrap().clone(),
        }
    }

    fn decode(&self, persisted: TopicConfigSerializeWrapper) {
        *self.table.write().unwrap() = persisted.topic_config_table;
        *self.data_version.write().unwrap() = persisted.data_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mgr = TopicConfigManager::new(dir.path());
        mgr.put(TopicConfig::new("T"));
        let cfg = mgr.get("T").unwrap();
        assert_eq!(cfg.read_queue_nums, 4);
        assert_eq!(cfg.perm, perm::READ_WRITE);
    }

    #[test]
    fn put_bumps_data_version() {
        let dir = tempdir().unwrap();
        let mgr = TopicConfigManager::new(dir.path());
        let before = mgr.data_version();
        mgr.put(TopicConfig::new("T"));
        assert!(mgr.data_version().is_newer_than(&before));
    }

    #[test]
    fn persist_and_reload_via_config_manager_trait() {
        let dir = tempdir().unwrap();
        let mgr = TopicConfigManager::new(dir.path());
        mgr.put(TopicConfig::new("T"));
        mgr.persist().unwrap();

        let reloaded = TopicConfigManager::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.get("T").unwrap().topic_name, "T");
        assert_eq!(reloaded.data_version(), mgr.data_version());
    }

    #[test]
    fn stale_master_version_is_rejected() {
        let dir = tempdir().unwrap();
        let mgr = TopicConfigManager::new(dir.path());
        mgr.put(TopicConfig::new("T"));
        let applied = mgr.apply_from_master(HashMap::new(), DataVersion::default());
        assert!(!applied);
        assert!(mgr.get("T").is_some());
    }
}
