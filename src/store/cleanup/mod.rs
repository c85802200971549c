pub mod commit_log_cleanup;
pub mod consume_queue_cleanup;

pub use commit_log_cleanup::{CommitLogCleanupConfig, CommitLogCleanupService};
pub use consume_queue_cleanup::ConsumeQueueCleanupService;
