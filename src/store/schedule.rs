//! Time-wheel redelivery of delay-level messages (section 4.6). One timer
//! per delay level polls its consume queue (`SCHEDULE_TOPIC`, level-1) and,
//! once a unit's `store_ts + delay(level) <= now`, restores the real
//! topic/queue id from properties and re-puts the message into the commit
//! log — which then dispatches exactly like any other put.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::message::{properties, MessageExtBrokerInner, SCHEDULE_TOPIC};
use crate::store::DefaultMessageStore;

/// Default delay levels in seconds, index 0 == level 1. Mirrors the
/// original's `1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h`
/// ladder.
pub fn default_delay_levels_ms() -> Vec<i64> {
    let spec: &[(i64, &str)] = &[
        (1, "s"), (5, "s"), (10, "s"), (30, "s"), (1, "m"), (2, "m"),
        (3, "m"), (4, "m"), (5, "m"), (6, "m"), (7, "m"), (8, "m"),
        (9, "m"), (10, "m"), (20, "m"), (30, "m"), (1, "h"), (2, "h"),
    ];
    spec.iter()
        .map(|(n, unit)| match *unit {
            "s" => n * 1000,
            "m" => n * 60 * 1000,
            "h" => n * 60 * 60 * 1000,
            _ => unreachable!(),
        })
        .collect()
}

/// Per-level delivery offset, persisted the way `Delay Offset` documents
/// are (see `manager::delay_offset`).
pub struct ScheduleMessageService {
    store: Arc<DefaultMessageStore>,
    delay_levels_ms: Vec<i64>,
    offsets: Vec<AtomicI64>,
    enabled: AtomicBool,
    tick: Duration,
}

impl ScheduleMessageService {
    pub fn new(store: Arc<DefaultMessageStore>) -> ScheduleMessageService {
        let delay_levels_ms = default_delay_levels_ms();
        let offsets = (0..delay_levels_ms.len()).map(|_| AtomicI64::new(0)).collect();
        ScheduleMessageService {
            store,
            delay_levels_ms,
            offsets,
            enabled: AtomicBool::new(true),
            tick: Duration::from_millis(100),
        }
    }

    pub fn level_count(&self) -> usize {
        self.delay_levels_ms.len()
    }

    pub fn delay_ms(&self, level: i32) -> Option<i64> {
        self.delay_levels_ms.get((level - 1) as usize).copied()
    }

    pub fn offset_for_level(&self, level: i32) -> i64 {
        self.offsets
            .get((level - 1) as usize)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_offset_for_level(&self, level: i32, offset: i64) {
        if let Some(a) = self.offsets.get((level - 1) as usize) {
            a.store(offset, Ordering::Release);
        }
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Rewrites a producer-supplied message carrying `DELAY_LEVEL` into
    /// the schedule topic/queue, stashing the real destination in
    /// properties. Called from the put path before encoding.
    pub fn transform(inner: &mut MessageExtBrokerInner, level: i32) {
        inner
            .properties
            .insert(properties::REAL_TOPIC.to_string(), inner.topic.clone());
        inner
            .properties
            .insert(properties::REAL_QID.to_string(), inner.queue_id.to_string());
        inner.topic = SCHEDULE_TOPIC.to_string();
        inner.queue_id = level - 1;
    }

    /// Spawns the `N` per-level timers onto the given tokio runtime
    /// handle. Each polls its queue independently; ordering of delivery
    /// across levels is not guaranteed, only per-level monotonic offsets.
    pub fn start(self: Arc<Self>) {
        for level in 1..=self.level_count() as i32 {
            let svc = self.clone();
            tokio::spawn(async move {
                svc.run_level(level).await;
            });
        }
    }

    async fn run_level(&self, level: i32) {
        let mut interval = tokio::time::interval(self.tick);
        while self.enabled.load(Ordering::Acquire) {
            interval.tick().await;
            if let Err(e) = self.deliver_ready(level) {
                log::error!("schedule level {} delivery error: {}", level, e);
            }
        }
    }

    /// Delivers all units in the level's queue whose deadline has passed.
    /// Exposed standalone (not just via `run_level`) so tests can drive it
    /// without waiting on a real timer.
    pub fn deliver_ready(&self, level: i32) -> Result<(), crate::error::StoreError> {
        let delay = match self.delay_ms(level) {
            Some(d) => d,
            None => return Ok(()),
        };
        let cq = self
            .store
            .consume_queues()
            .get_or_create(SCHEDULE_TOPIC, level - 1);

        let mut offset = self.offset_for_level(level);
        let max = cq.max_offset_in_queue();
        let now = crate::message::now_millis();

        while offset < max {
            let unit = match cq.get_unit(offset) {
                Some(u) => u,
                None => break,
            };
            let store_ts = self
                .store
                .commit_log()
                .pickup_store_timestamp(unit.phy_offset, unit.size)
                .unwrap_or(0);
            if store_ts + delay > now {
                break;
            }

            let bytes = self
                .store
                .commit_log()
                .get_message(unit.phy_offset, unit.size)
                .ok_or_else(|| crate::error::StoreError::Corrupt("schedule msg missing".into()))?;
            let (_, _, decoded) = crate::message::decode(&bytes)
                .map_err(|_| crate::error::StoreError::Corrupt("schedule msg undecodable".into()))?;
            let decoded = decoded.ok_or_else(|| crate::error::StoreError::Corrupt("blank in schedule queue".into()))?;

            let real_topic = decoded
                .properties
                .get(properties::REAL_TOPIC)
                .cloned()
                .unwrap_or_else(|| decoded.topic.clone());
            let real_qid: i32 = decoded
                .properties
                .get(properties::REAL_QID)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let mut props = decoded.properties.clone();
            props.remove(properties::REAL_TOPIC);
            props.remove(properties::REAL_QID);
            props.remove(properties::DELAY_LEVEL);

            let mut restored = MessageExtBrokerInner::new(real_topic, real_qid, decoded.body);
            restored.properties = props;
            restored.sys_flag = decoded.sys_flag;
            restored.born_timestamp = decoded.born_timestamp;
            restored.born_host = decoded.born_host;

            let result = self.store.put_message(restored);
            if !result.is_ok() {
                log::warn!("schedule redelivery failed at level {}: {:?}", level, result.status);
                break;
            }

            offset += 1;
            self.set_offset_for_level(level, offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DefaultMessageStore, StoreConfig};
    use tempfile::tempdir;

    fn new_store(dir: &std::path::Path) -> Arc<DefaultMessageStore> {
        let cfg = StoreConfig {
            store_root: dir.to_path_buf(),
            ..StoreConfig::default()
        };
        Arc::new(DefaultMessageStore::new(cfg).unwrap())
    }

    #[test]
    fn transform_stashes_real_destination() {
        let mut inner = MessageExtBrokerInner::new("X", 3, b"hi".to_vec());
        ScheduleMessageService::transform(&mut inner, 1);
        assert_eq!(inner.topic, SCHEDULE_TOPIC);
        assert_eq!(inner.queue_id, 0);
        assert_eq!(inner.properties.get(properties::REAL_TOPIC).unwrap(), "X");
        assert_eq!(inner.properties.get(properties::REAL_QID).unwrap(), "3");
    }

    #[test]
    fn s5_delay_delivery_restores_real_topic() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let inner = MessageExtBrokerInner::new("X", 0, b"payload".to_vec())
            .with_property(properties::DELAY_LEVEL, "1");
        let r = store.put_message(inner);
        assert!(r.is_ok());
        store.dispatch_pending_for_test();

        let svc = ScheduleMessageService::new(store.clone());
        // force-expire: delay level 1 is 1000ms, but deliver_ready checks
        // `store_ts + delay <= now`; simulate elapsed time by temporarily
        // using a 0ms delay table entry instead of sleeping in a test.
        let mut zero_delay = svc;
        zero_delay.delay_levels_ms[0] = 0;
        zero_delay.deliver_ready(1).unwrap();
        store.dispatch_pending_for_test();

        let cq = store.consume_queues().get_or_create("X", 0);
        assert_eq!(cq.max_offset_in_queue(), 1);
        let unit = cq.get_unit(0).unwrap();
        let bytes = store.commit_log().get_message(unit.phy_offset, unit.size).unwrap();
        let (_, _, msg) = crate::message::decode(&bytes).unwrap();
        let msg = msg.unwrap();
        assert_eq!(msg.topic, "X");
        assert!(!msg.properties.contains_key(properties::REAL_TOPIC));
        assert_eq!(msg.body, b"payload");
    }
}
