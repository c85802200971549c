//! Broker-side metadata managers (section 4.11): durable, periodically
//! persisted tables that sit alongside the storage engine but are not part
//! of it — `OffsetManager`, `TopicConfigManager`, `SubscriptionGroupManager`,
//! and the schedule service's delay offsets, each reachable through the
//! shared [`config_manager::ConfigManager`] trait.

pub mod config_manager;
pub mod data_version;
pub mod delay_offset_manager;
pub mod offset_manager;
pub mod subscription_group_manager;
pub mod topic_config_manager;

pub use config_manager::ConfigManager;
pub use data_version::DataVersion;
pub use delay_offset_manager::DelayOffsetManager;
pub use offset_manager::OffsetManager;
pub use subscription_group_manager::SubscriptionGroupManager;
pub use topic_config_manager::{TopicConfig, TopicConfigManager};

use std::sync::Arc;
use std::time::Duration;

/// Bundles the four managers so the broker wiring layer can construct and
/// persist them as one unit, the way `BrokerController` owns all of its
/// tables (section 9: explicit handles, not a back-pointer into a god
/// object).
pub struct BrokerManagers {
    pub topic_config: Arc<TopicConfigManager>,
    pub subscription_group: Arc<SubscriptionGroupManager>,
    pub offset: Arc<OffsetManager>,
    pub delay_offset: Arc<DelayOffsetManager>,
}

impl BrokerManagers {
    pub fn load_all(&self) {
        for result in [
            self.topic_config.load().map(|_| ()),
            self.subscription_group.load().map(|_| ()),
            self.offset.load().map(|_| ()),
            self.delay_offset.load().map(|_| ()),
        ] {
            if let Err(e) = result {
                log::warn!("broker manager load failed: {}", e);
            }
        }
    }

    pub fn persist_all(&self) {
        if let Err(e) = self.topic_config.persist() {
            log::warn!("topic config persist failed: {}", e);
        }
        if let Err(e) = self.subscription_group.persist() {
            log::warn!("subscription group persist failed: {}", e);
        }
        if let Err(e) = self.offset.persist() {
            log::warn!("consumer offset persist failed: {}", e);
        }
        if let Err(e) = self.delay_offset.persist() {
            log::warn!("delay offset persist failed: {}", e);
        }
    }

    /// Spawns the periodic persistor shared by all four documents, the
    /// same cadence-driven pattern each original manager uses standalone.
    pub fn spawn_periodic_persist(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.persist_all();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schedule::ScheduleMessageService;
    use crate::store::{DefaultMessageStore, StoreConfig};
    use tempfile::tempdir;

    #[test]
    fn load_all_on_fresh_root_does_not_error() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            DefaultMessageStore::new(StoreConfig {
                store_root: dir.path().join("store"),
                ..StoreConfig::default()
            })
            .unwrap(),
        );
        let schedule = Arc::new(ScheduleMessageService::new(store));
        let managers = BrokerManagers {
            topic_config: Arc::new(TopicConfigManager::new(dir.path())),
            subscription_group: Arc::new(SubscriptionGroupManager::new(dir.path())),
            offset: Arc::new(OffsetManager::new(dir.path())),
            delay_offset: Arc::new(DelayOffsetManager::new(dir.path(), schedule)),
        };
        managers.load_all();
        managers.topic_config.put(TopicConfig::new("T"));
        managers.persist_all();
        assert!(dir.path().join("config").join("topics.json").exists());
    }
}
