//! Deletes consume-queue segments whose maximum referenced commit-log
//! offset is below the commit log's current minimum offset, then
//! propagates `correct_min_offset` to each consume queue (section 4.9).

use std::sync::Arc;
use std::time::Duration;

use crate::store::commit_log::CommitLog;
use crate::store::consume_queue::ConsumeQueueStore;

pub struct ConsumeQueueCleanupService {
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueStore>,
    force_destroy_interval_ms: i64,
    tick: Duration,
}

impl ConsumeQueueCleanupService {
    pub fn new(
        commit_log: Arc<CommitLog>,
        consume_queues: Arc<ConsumeQueueStore>,
        force_destroy_interval_ms: i64,
    ) -> ConsumeQueueCleanupService {
        ConsumeQueueCleanupService {
            commit_log,
            consume_queues,
            force_destroy_interval_ms,
            tick: Duration::from_secs(60),
        }
    }

    pub fn run_once(&self) -> usize {
        let min_commitlog_offset = self.commit_log.min_offset();
        let mut total_deleted = 0;
        for cq in self.consume_queues.all() {
            total_deleted += cq.delete_expired_segments(min_commitlog_offset, self.force_destroy_interval_ms);
            cq.correct_min_offset(min_commitlog_offset);
        }
        total_deleted
    }

    pub fn spawn_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            loop {
                interval.tick().await;
                self.run_once();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::commit_log::CommitLogConfig;
    use crate::store::consume_queue::ConsumeQueueUnit;
    use crate::store::dispatch::dispatch_channel;
    use tempfile::tempdir;

    #[test]
    fn correct_min_offset_is_applied_after_cleanup() {
        let log_dir = tempdir().unwrap();
        let cq_dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let log = Arc::new(CommitLog::new(log_dir.path(), CommitLogConfig::default(), tx));
        let store = Arc::new(ConsumeQueueStore::new(cq_dir.path()));

        let cq = store.get_or_create("T", 0);
        for i in 0..5 {
            cq.put_index(
                ConsumeQueueUnit { phy_offset: i * 100, size: 90, tags_code: 0 },
                i,
            )
            .unwrap();
        }

        // Simulate the commit log having trimmed everything below 250.
        let svc = ConsumeQueueCleanupService::new(log, store.clone(), 0);
        cq.correct_min_offset(250);
        let _ = svc.run_once();
        assert_eq!(cq.min_offset_in_queue(), 3);
    }
}
