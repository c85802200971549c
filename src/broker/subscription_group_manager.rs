//! Consumer-group policy table (section 4.11), persisted as
//! `config/subscriptionGroup.json`.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::broker::config_manager::ConfigManager;
use crate::broker::data_version::DataVersion;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionGroupConfig {
    pub group_name: String,
    pub consume_enable: bool,
    pub consume_broadcast_enable: bool,
    pub retry_queue_nums: i32,
    pub retry_max_times: i32,
}

impl SubscriptionGroupConfig {
    pub fn new(group_name: impl Into<String>) -> SubscriptionGroupConfig {
        SubscriptionGroupConfig {
            group_name: group_name.into(),
            consume_enable: true,
            consume_broadcast_enable: false,
            retry_queue_nums: 1,
            retry_max_times: 16,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SubscriptionGroupSerializeWrapper {
    data_version: DataVersion,
    subscription_group_table: HashMap<String, SubscriptionGroupConfig>,
}

pub struct SubscriptionGroupManager {
    config_path: PathBuf,
    table: RwLock<HashMap<String, SubscriptionGroupConfig>>,
    data_version: RwLock<DataVersion>,
}

impl SubscriptionGroupManager {
    pub fn new(store_root: impl AsRef<Path>) -> SubscriptionGroupManager {
        SubscriptionGroupManager {
            config_path: store_root.as_ref().join("config").join("subscriptionGroup.json"),
            table: RwLock::new(HashMap::new()),
            data_version: RwLock::new(DataVersion::default()),
        }
    }

    pub fn data_version(&self) -> DataVersion {
        *self.data_version.read().unwrap()
    }

    pub fn get(&self, group: &str) -> Option<SubscriptionGroupConfig> {
        self.table.read().unwrap().get(group).cloned()
    }

    pub fn get_or_default(&self, group: &str) -> SubscriptionGroupConfig {
        self.get(group).unwrap_or_else(|| SubscriptionGroupConfig::new(group))
    }

    pub fn put(&self, config: SubscriptionGroupConfig) {
        let now = crate::message::now_millis();
        self.table.write().unwrap().insert(config.group_name.clone(), config);
        let mut v = self.data_version.write().unwrap();
        *v = v.next(now);
    }

    pub fn delete(&self, group: &str) -> bool {
        let now = crate::message::now_millis();
        let removed = self.table.write().unwrap().remove(group).is_some();
        if removed {
            let mut v = self.data_version.write().unwrap();
            *v = v.next(now);
        }
        removed
    }
}

impl ConfigManager for SubscriptionGroupManager {
    type Persisted = SubscriptionGroupSerializeWrapper;

    fn config_file_path(&self) -> PathBuf {
        self.config_path.clone()
    }

    fn encode(&self) -> SubscriptionGroupSerializeWrapper {
        SubscriptionGroupSerializeWrapper {
            data_version: self.data_version(),
            subscription_group_table: self.table.read().unwrap().clone(),
        }
    }

    fn decode(&self, persisted: SubscriptionGroupSerializeWrapper) {
        *self.table.write().unwrap() = persisted.subscription_group_table;
        *self.data_version.write().unwrap() = persisted.data_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_group_has_sensible_retry_policy() {
        let dir = tempdir().unwrap();
        let mgr = SubscriptionGroupManager::new(dir.path());
        let cfg = mgr.get_or_default("consumers");
        assert!(cfg.consume_enable);
        assert_eq!(cfg.retry_max_times, 16);
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempdir().unwrap();
        let mgr = SubscriptionGroupManager::new(dir.path());
        mgr.put(SubscriptionGroupConfig::new("g1"));
        mgr.persist().unwrap();

        let reloaded = SubscriptionGroupManager::new(dir.path());
        reloaded.load().unwrap();
        assert!(reloaded.get("g1").is_some());
    }
}
