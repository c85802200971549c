//! Per-delay-level delivery offset document (section 3: Delay Offset),
//! persisted as `config/delayOffset.json`. Wraps
//! [`crate::store::schedule::ScheduleMessageService`]'s in-memory atomics
//! so the periodic persistor has one `ConfigManager` to drive alongside
//! the other three broker documents.

use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::broker::config_manager::ConfigManager;
use crate::broker::data_version::DataVersion;
use crate::store::schedule::ScheduleMessageService;

#[derive(Serialize, Deserialize)]
struct DelayOffsetSerializeWrapper {
    data_version: DataVersion,
    /// Index i holds the offset for delay level i+1.
    offset_table: Vec<i64>,
}

pub struct DelayOffsetManager {
    config_path: PathBuf,
    schedule: Arc<ScheduleMessageService>,
    data_version: RwLock<DataVersion>,
}

impl DelayOffsetManager {
    pub fn new(store_root: impl AsRef<Path>, schedule: Arc<ScheduleMessageService>) -> DelayOffsetManager {
        DelayOffsetManager {
            config_path: store_root.as_ref().join("config").join("delayOffset.json"),
            schedule,
            data_version: RwLock::new(DataVersion::default()),
        }
    }

    pub fn data_version(&self) -> DataVersion {
        *self.data_version.read().unwrap()
    }
}

impl ConfigManager for DelayOffsetManager {
    type Persisted = DelayOffsetSerializeWrapper;

    fn config_file_path(&self) -> PathBuf {
        self.config_path.clone()
    }

    fn encode(&self) -> DelayOffsetSerializeWrapper {
        let offsets = (1..=self.schedule.level_count() as i32)
            .map(|level| self.schedule.offset_for_level(level))
            .collect();
        DelayOffsetSerializeWrapper {
            data_version: self.data_version(),
            offset_table: offsets,
        }
    }

    fn decode(&self, persisted: DelayOffsetSerializeWrapper) {
        for (i, offset) in persisted.offset_table.into_iter().enumerate() {
            self.schedule.set_offset_for_level(i as i32 + 1, offset);
        }
        *self.data_version.write().unwrap() = persisted.data_version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DefaultMessageStore, StoreConfig};
    use tempfile::tempdir;

    #[test]
    fn persist_and_reload_restores_per_level_offsets() {
        let dir = tempdir().unwrap();
        let store_cfg = StoreConfig {
            store_root: dir.path().join("store"),
            ..StoreConfig::default()
        };
        let store = Arc::new(DefaultMessageStore::new(store_cfg).unwrap());
        let schedule = Arc::new(ScheduleMessageService::new(store));
        schedule.set_offset_for_level(1, 7);
        schedule.set_offset_for_level(2, 9);

        let mgr = DelayOffsetManager::new(dir.path(), schedule.clone());
        mgr.persist().unwrap();

        let schedule2 = Arc::new(ScheduleMessageService::new(Arc::new(
            DefaultMessageStore::new(StoreConfig {
                store_root: dir.path().join("store2"),
                ..StoreConfig::default()
            })
            .unwrap(),
        )));
        let mgr2 = DelayOffsetManager::new(dir.path(), schedule2.clone());
        mgr2.load().unwrap();
        assert_eq!(schedule2.offset_for_level(1), 7);
        assert_eq!(schedule2.offset_for_level(2), 9);
    }
}
