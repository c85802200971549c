//! Broker configuration (SPEC_FULL [EXPANSION]): loaded from a TOML file
//! by the `storage-server` binary at startup, with environment overrides
//! for the three variables section 6 names (home directory, store-root
//! override, name-server address list). Config parsing itself is out of
//! scope as a *feature* (section 1), but the crate still needs a typed
//! config to drive `StoreConfig`/`CommitLogConfig`/HA/replication knobs —
//! this module is the thin adapter, not a general-purpose settings layer.

use serde_derive::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::commit_log::FlushDiskType;
use crate::store::ha::HaFlushType;

const ENV_HOME: &str = "BROKER_HOME";
const ENV_STORE_ROOT: &str = "BROKER_STORE_ROOT";
const ENV_NAMESRV_ADDR: &str = "BROKER_NAMESRV_ADDR";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_name: String,
    pub broker_id: i64,
    pub listen_port: u16,
    pub ha_listen_port: u16,
    pub store_root: PathBuf,
    pub commit_log_segment_size_mb: usize,
    pub consume_queue_segment_units: usize,
    pub flush_disk_type: String,
    pub flush_least_pages: usize,
    pub flush_disk_timeout_ms: u64,
    pub ha_flush_type: String,
    pub ha_sync_timeout_ms: u64,
    pub max_message_size_bytes: usize,
    pub dispatch_high_water_mark: usize,
    pub pull_request_timeout_ms: u64,
    pub checkpoint_flush_period_ms: u64,
    pub manager_persist_period_ms: u64,
    pub file_reserved_time_hours: i64,
    pub disk_max_used_percent: f64,
    /// Comma-separated `host:port` list, mirroring `BROKER_NAMESRV_ADDR` /
    /// the name-service tier's address discovery (out of scope itself;
    /// section 1 — the core only needs somewhere to read the list from).
    pub namesrv_addr: String,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            broker_name: "broker-a".to_string(),
            broker_id: 0,
            listen_port: 10911,
            ha_listen_port: 10912,
            store_root: PathBuf::from("store"),
            commit_log_segment_size_mb: 1024,
            consume_queue_segment_units: 300_000,
            flush_disk_type: "async".to_string(),
            flush_least_pages: 4,
            flush_disk_timeout_ms: 5_000,
            ha_flush_type: "async".to_string(),
            ha_sync_timeout_ms: 3_000,
            max_message_size_bytes: crate::message::DEFAULT_MAX_MESSAGE_SIZE,
            dispatch_high_water_mark: 10_000,
            pull_request_timeout_ms: 15_000,
            checkpoint_flush_period_ms: 1_000,
            manager_persist_period_ms: 10_000,
            file_reserved_time_hours: 72,
            disk_max_used_percent: 75.0,
            namesrv_addr: String::new(),
        }
    }
}

impl BrokerConfig {
    /// Parses TOML text, then applies the three environment overrides
    /// named in section 6. Environment always wins over the file, the
    /// way a deployment's orchestrator overrides a baked-in config.
    pub fn from_toml_str(text: &str) -> Result<BrokerConfig, toml::de::Error> {
        let mut cfg: BrokerConfig = toml::from_str(text)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> std::io::Result<BrokerConfig> {
        let text = std::fs::read_to_string(path)?;
        BrokerConfig::from_toml_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = env::var(ENV_STORE_ROOT) {
            self.store_root = PathBuf::from(root);
        } else if let Ok(home) = env::var(ENV_HOME) {
            self.store_root = PathBuf::from(home).join("store");
        }
        if let Ok(addr) = env::var(ENV_NAMESRV_ADDR) {
            self.namesrv_addr = addr;
        }
    }

    pub fn namesrv_addrs(&self) -> Vec<String> {
        self.namesrv_addr
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn flush_disk_type(&self) -> FlushDiskType {
        match self.flush_disk_type.as_str() {
            "sync" => FlushDiskType::SyncFlush,
            _ => FlushDiskType::AsyncFlush,
        }
    }

    pub fn ha_flush_type(&self) -> HaFlushType {
        match self.ha_flush_type.as_str() {
            "sync" => HaFlushType::SyncMaster,
            _ => HaFlushType::AsyncMaster,
        }
    }

    pub fn to_commit_log_config(&self) -> crate::store::commit_log::CommitLogConfig {
        crate::store::commit_log::CommitLogConfig {
            segment_size: self.commit_log_segment_size_mb * 1024 * 1024,
            flush_disk_type: self.flush_disk_type(),
            flush_least_pages: self.flush_least_pages,
            flush_disk_timeout: Duration::from_millis(self.flush_disk_timeout_ms),
            max_message_size: self.max_message_size_bytes,
            store_host: 0,
            ha_flush_type: self.ha_flush_type(),
            ha_sync_timeout: Duration::from_millis(self.ha_sync_timeout_ms),
        }
    }

    pub fn to_store_config(&self) -> crate::store::StoreConfig {
        crate::store::StoreConfig {
            store_root: self.store_root.clone(),
            commit_log: self.to_commit_log_config(),
            dispatch_high_water_mark: self.dispatch_high_water_mark,
            pull_request_timeout: Duration::from_millis(self.pull_request_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.broker_name, "broker-a");
        assert_eq!(cfg.flush_disk_type(), FlushDiskType::AsyncFlush);
    }

    #[test]
    fn overrides_layer_on_top_of_defaults() {
        let toml = r#"
            broker_name = "broker-b"
            flush_disk_type = "sync"
            namesrv_addr = "10.0.0.1:9876,10.0.0.2:9876"
        "#;
        let cfg = BrokerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.broker_name, "broker-b");
        assert_eq!(cfg.flush_disk_type(), FlushDiskType::SyncFlush);
        assert_eq!(cfg.namesrv_addrs(), vec!["10.0.0.1:9876", "10.0.0.2:9876"]);
        // untouched fields keep their defaults
        assert_eq!(cfg.listen_port, 10911);
    }

    #[test]
    fn store_root_env_override_wins_over_file() {
        let toml = "store_root = \"from-file\"";
        env::set_var(ENV_STORE_ROOT, "/tmp/from-env-test-config");
        let cfg = BrokerConfig::from_toml_str(toml).unwrap();
        env::remove_var(ENV_STORE_ROOT);
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/from-env-test-config"));
    }
}
