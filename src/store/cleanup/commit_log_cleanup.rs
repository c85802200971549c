//! Age- and disk-pressure-based deletion of commit-log segments (section
//! 4.9). Never deletes the segment currently being written to, and never
//! deletes a segment whose tail hasn't been flushed yet — both are
//! enforced implicitly because [`MappedFileQueue::delete_expired_by_time`]
//! only ever considers files other than the last one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::store::commit_log::CommitLog;

pub struct CommitLogCleanupConfig {
    pub file_reserved_time_ms: i64,
    pub force_destroy_interval_ms: i64,
    pub batch_cap: usize,
    pub disk_space_warn_ratio: f64,
    pub tick: Duration,
}

impl Default for CommitLogCleanupConfig {
    fn default() -> CommitLogCleanupConfig {
        CommitLogCleanupConfig {
            file_reserved_time_ms: 72 * 60 * 60 * 1000,
            force_destroy_interval_ms: 120 * 1000,
            batch_cap: 10,
            disk_space_warn_ratio: 0.90,
            tick: Duration::from_secs(60),
        }
    }
}

pub struct CommitLogCleanupService {
    commit_log: Arc<CommitLog>,
    config: CommitLogCleanupConfig,
    manual_delete_requested: AtomicBool,
}

impl CommitLogCleanupService {
    pub fn new(commit_log: Arc<CommitLog>, config: CommitLogCleanupConfig) -> CommitLogCleanupService {
        CommitLogCleanupService {
            commit_log,
            config,
            manual_delete_requested: AtomicBool::new(false),
        }
    }

    /// Exposed for a future admin surface (out of scope here) to trigger
    /// an immediate cleanup pass regardless of age.
    pub fn request_manual_delete(&self) {
        self.manual_delete_requested.store(true, Ordering::Release);
    }

    /// Runs one cleanup pass. `disk_usage_ratio` is injected by the caller
    /// (real disk-usage sampling lives outside the store core); when it
    /// exceeds the configured high-water mark, age is ignored and the
    /// oldest segments are deleted immediately.
    pub fn run_once(&self, now_ms: i64, disk_usage_ratio: f64) -> usize {
        let manual = self.manual_delete_requested.swap(false, Ordering::AcqRel);
        let immediate = manual || disk_usage_ratio >= self.config.disk_space_warn_ratio;

        let expiry = if immediate { 0 } else { self.config.file_reserved_time_ms };
        self.commit_log.delete_expired_files(
            expiry,
            self.config.force_destroy_interval_ms,
            self.config.batch_cap,
            now_ms,
        )
    }

    pub fn spawn_loop(self: Arc<Self>, disk_usage_ratio: impl Fn() -> f64 + Send + 'static) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick);
            loop {
                interval.tick().await;
                let now = crate::message::now_millis();
                let deleted = self.run_once(now, disk_usage_ratio());
                if deleted > 0 {
                    log::info!("commit log cleanup deleted {} segment(s)", deleted);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::commit_log::CommitLogConfig;
    use crate::store::dispatch::dispatch_channel;
    use tempfile::tempdir;

    #[test]
    fn disk_pressure_forces_immediate_cleanup() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.segment_size = 256;
        let log = Arc::new(CommitLog::new(dir.path(), cfg, tx));
        for _ in 0..6 {
            log.put_message(crate::message::MessageExtBrokerInner::new("T", 0, vec![0u8; 10]));
        }
        assert!(log.queue().len() >= 2);

        let cleanup = CommitLogCleanupService::new(
            log.clone(),
            CommitLogCleanupConfig {
                force_destroy_interval_ms: 0,
                ..CommitLogCleanupConfig::default()
            },
        );
        let before = log.queue().len();
        cleanup.run_once(crate::message::now_millis(), 0.95);
        assert!(log.queue().len() < before);
    }
}
