//! Wires the storage primitives together into one running store: commit
//! log, per-queue consume queues, the message index, checkpointing,
//! pull-hold long polling, and stats (section 4 overview). HA, schedule
//! delivery, reput and cleanup are deliberately NOT owned here — each
//! needs only a narrow handle (`Arc<CommitLog>`, `Arc<ConsumeQueueStore>`,
//! or the whole store), so the broker wiring layer constructs them
//! standalone and hands them the relevant `Arc`, the same shape the
//! original's `BrokerController` assembles its services in.

pub mod checkpoint;
pub mod cleanup;
pub mod commit_log;
pub mod consume_queue;
pub mod dispatch;
pub mod ha;
pub mod index;
pub mod mapped_file;
pub mod mapped_file_queue;
pub mod pull_hold;
pub mod reput;
pub mod schedule;
pub mod stats;

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{GetMessageStatus, PutMessageResult, StoreResult};
use crate::message::{decode, properties, DecodeOutcome, DecodedMessage, MessageExtBrokerInner};
use crate::store::checkpoint::StoreCheckpoint;
use crate::store::commit_log::{CommitLog, CommitLogConfig};
use crate::store::consume_queue::{ConsumeQueueStore, ConsumeQueueUnit};
use crate::store::dispatch::{dispatch_channel, DispatchRequest};
use crate::store::index::IndexService;
use crate::store::pull_hold::{PullRequest, PullRequestHoldService, WakeReason};
use crate::store::stats::StoreStatsService;

pub struct StoreConfig {
    pub store_root: PathBuf,
    pub commit_log: CommitLogConfig,
    pub dispatch_high_water_mark: usize,
    pub pull_request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            store_root: PathBuf::from("store"),
            commit_log: CommitLogConfig::default(),
            dispatch_high_water_mark: dispatch::DEFAULT_HIGH_WATER_MARK,
            pull_request_timeout: Duration::from_secs(15),
        }
    }
}

pub struct GetMessageResult {
    pub status: GetMessageStatus,
    pub messages: Vec<DecodedMessage>,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
}

/// Name of the marker file created on startup and removed on a clean
/// shutdown; its presence on the next startup means the previous run
/// crashed, per the original's abort-file convention.
const ABORT_MARKER: &str = "abort";

pub struct DefaultMessageStore {
    store_root: PathBuf,
    commit_log: Arc<CommitLog>,
    consume_queues: Arc<ConsumeQueueStore>,
    index_service: Arc<IndexService>,
    checkpoint: Arc<StoreCheckpoint>,
    pull_hold: Arc<PullRequestHoldService<u64>>,
    pull_wake_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<(u64, WakeReason)>>>,
    stats: Arc<StoreStatsService>,
    dispatch_rx: Mutex<Receiver<DispatchRequest>>,
}

impl DefaultMessageStore {
    pub fn new(config: StoreConfig) -> StoreResult<DefaultMessageStore> {
        std::fs::create_dir_all(&config.store_root)?;

        let abort_path = config.store_root.join(ABORT_MARKER);
        let abnormal_shutdown = abort_path.exists();
        std::fs::write(&abort_path, b"")?;

        let (tx, rx) = dispatch_channel(config.dispatch_high_water_mark);
        let commit_log = Arc::new(CommitLog::new(config.store_root.join("commitlog"), config.commit_log, tx));
        commit_log.load()?;

        let consume_queues = Arc::new(ConsumeQueueStore::new(config.store_root.join("consumequeue")));
        consume_queues.load_all()?;

        let index_service = Arc::new(IndexService::new(config.store_root.join("index")));
        index_service.load()?;

        let checkpoint = Arc::new(StoreCheckpoint::open(config.store_root.join("checkpoint"))?);
        commit_log.recover(abnormal_shutdown, checkpoint.min_timestamp())?;

        let max_phy = commit_log.max_offset();
        for cq in consume_queues.all() {
            if cq.max_phy_offset().map(|p| p >= max_phy).unwrap_or(false) {
                cq.truncate_dirty(max_phy);
            }
        }

        let (pull_hold, pull_wake_rx) = PullRequestHoldService::new();

        Ok(DefaultMessageStore {
            store_root: config.store_root,
            commit_log,
            consume_queues,
            index_service,
            checkpoint,
            pull_hold: Arc::new(pull_hold),
            pull_wake_rx: Mutex::new(Some(pull_wake_rx)),
            stats: Arc::new(StoreStatsService::new()),
            dispatch_rx: Mutex::new(rx),
        })
    }

    pub fn commit_log(&self) -> Arc<CommitLog> {
        self.commit_log.clone()
    }

    pub fn consume_queues(&self) -> Arc<ConsumeQueueStore> {
        self.consume_queues.clone()
    }

    pub fn index_service(&self) -> Arc<IndexService> {
        self.index_service.clone()
    }

    pub fn checkpoint(&self) -> Arc<StoreCheckpoint> {
        self.checkpoint.clone()
    }

    pub fn stats(&self) -> Arc<StoreStatsService> {
        self.stats.clone()
    }

    pub fn pull_hold(&self) -> Arc<PullRequestHoldService<u64>> {
        self.pull_hold.clone()
    }

    /// Can only be taken once — the processor layer that answers parked
    /// pull requests owns it from then on.
    pub fn take_pull_wake_receiver(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<(u64, WakeReason)>> {
        self.pull_wake_rx.lock().unwrap().take()
    }

    /// If `inner` carries a `DELAY_LEVEL` property, rewrites it onto the
    /// schedule topic before handing it to the commit log (section 4.6) —
    /// the only place in the put path that sees the producer-supplied
    /// properties before they're encoded.
    pub fn put_message(&self, mut inner: MessageExtBrokerInner) -> PutMessageResult {
        if let Some(level) = inner
            .properties
            .get(properties::DELAY_LEVEL)
            .and_then(|s| s.parse::<i32>().ok())
        {
            if level > 0 {
                schedule::ScheduleMessageService::transform(&mut inner, level);
            }
        }

        let topic = inner.topic.clone();
        let start = Instant::now();
        let result = self.commit_log.put_message(inner);
        self.stats.record_put(&topic, result.is_ok(), start.elapsed());
        result
    }

    /// Pulls up to `max_count` messages for `(topic, queue_id)` starting
    /// at logical `offset` (section 4.4/4.8). Callers suspend on
    /// `NoMessageInQueue`/`OffsetOverflowOne` via [`Self::pull_hold`]
    /// instead of treating them as errors.
    pub fn get_message(&self, topic: &str, queue_id: i32, offset: i64, max_count: i32) -> GetMessageResult {
        let cq = match self.consume_queues.get(topic, queue_id) {
            Some(cq) => cq,
            None => {
                return GetMessageResult {
                    status: GetMessageStatus::NoMatchedLogicQueue,
                    messages: vec![],
                    next_begin_offset: offset,
                    min_offset: 0,
                    max_offset: 0,
                }
            }
        };

        let min_offset = cq.min_offset_in_queue();
        let max_offset = cq.max_offset_in_queue();

        if max_offset == 0 {
            return GetMessageResult {
                status: GetMessageStatus::NoMessageInQueue,
                messages: vec![],
                next_begin_offset: offset,
                min_offset,
                max_offset,
            };
        }
        if offset < min_offset {
            return GetMessageResult {
                status: GetMessageStatus::OffsetTooSmall,
                messages: vec![],
                next_begin_offset: min_offset,
                min_offset,
                max_offset,
            };
        }
        if offset > max_offset {
            return GetMessageResult {
                status: GetMessageStatus::OffsetOverflowBadly,
                messages: vec![],
                next_begin_offset: max_offset,
                min_offset,
                max_offset,
            };
        }
        if offset == max_offset {
            return GetMessageResult {
                status: GetMessageStatus::OffsetOverflowOne,
                messages: vec![],
                next_begin_offset: offset,
                min_offset,
                max_offset,
            };
        }

        let mut messages = Vec::new();
        let mut cursor = offset;
        while cursor < max_offset && (messages.len() as i32) < max_count {
            let unit = match cq.get_unit(cursor) {
                Some(u) => u,
                None => break,
            };
            let bytes = match self.commit_log.get_message(unit.phy_offset, unit.size) {
                Some(b) => b,
                None => break,
            };
            match decode(&bytes) {
                Ok((DecodeOutcome::Message, _, Some(msg))) => messages.push(msg),
                _ => break,
            }
            cursor += 1;
        }

        self.stats.record_get(!messages.is_empty());
        let status = if messages.is_empty() {
            GetMessageStatus::OffsetFoundNull
        } else {
            GetMessageStatus::Found
        };
        GetMessageResult {
            status,
            messages,
            next_begin_offset: cursor,
            min_offset,
            max_offset,
        }
    }

    /// Binary-searches a queue for the logical offset whose message was
    /// stored at or just after `timestamp`, driving the search off
    /// `CommitLog::pickup_store_timestamp` (section 4.4).
    pub fn offset_by_time(&self, topic: &str, queue_id: i32, timestamp: i64) -> i64 {
        match self.consume_queues.get(topic, queue_id) {
            Some(cq) => cq.offset_by_time(timestamp, |phy, size| self.commit_log.pickup_store_timestamp(phy, size)),
            None => 0,
        }
    }

    /// Parks a pull request that found nothing yet; the caller re-runs
    /// [`Self::get_message`] when woken via [`Self::take_pull_wake_receiver`].
    pub fn suspend_pull_request(&self, topic: &str, queue_id: i32, ctx: u64, pull_from_offset: i64) {
        self.pull_hold.suspend(
            topic,
            queue_id,
            PullRequest {
                ctx,
                pull_from_offset,
                suspend_timestamp: Instant::now(),
                timeout: Duration::from_secs(15),
            },
        );
    }

    /// Applies one projection step: consume-queue unit, message-index
    /// entries for each key, then wakes any parked pull requests that are
    /// now behind the new max offset (section 4.5).
    fn apply_dispatch(&self, req: DispatchRequest) {
        let cq = self.consume_queues.get_or_create(&req.topic, req.queue_id);
        if let Err(e) = cq.put_index(
            ConsumeQueueUnit {
                phy_offset: req.phy_offset,
                size: req.size,
                tags_code: req.tags_code,
            },
            req.queue_offset,
        ) {
            log::error!("dispatch: consume queue append failed for {}@{}: {}", req.topic, req.queue_id, e);
            return;
        }

        for key in &req.key_list {
            if let Err(e) = self.index_service.put_key(&req.topic, key, req.phy_offset, req.store_timestamp) {
                log::error!("dispatch: index append failed for {}/{}: {}", req.topic, key, e);
            }
        }

        self.pull_hold.notify_dispatch(&req.topic, req.queue_id, cq.max_offset_in_queue());
    }

    /// Drains whatever is already queued without blocking — used by tests
    /// that need the dispatch side-effects of a `put_message` applied
    /// deterministically, without racing a background thread.
    pub fn dispatch_pending_for_test(&self) -> usize {
        let rx = self.dispatch_rx.lock().unwrap();
        let mut n = 0;
        while let Ok(req) = rx.try_recv() {
            self.apply_dispatch(req);
            n += 1;
        }
        n
    }

    /// Runs the dispatch loop forever on a dedicated OS thread, the way
    /// the original isolates the projection stage from request-handling
    /// threads. Blocks on `recv()` rather than polling.
    pub fn spawn_dispatch_loop(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            let received = {
                let rx = self.dispatch_rx.lock().unwrap();
                rx.recv()
            };
            match received {
                Ok(req) => self.apply_dispatch(req),
                Err(_) => break,
            }
        })
    }

    /// Flushes the commit log's active segment and the index's active
    /// segment, then records fresh checkpoint timestamps (section 4.10).
    /// Consume-queue segments don't need their own timestamp: recovery
    /// only ever needs the commit log's flushed position plus the
    /// checkpoint's `logics_msg_timestamp` to know how far a consume
    /// queue rebuild would need to replay.
    pub fn flush(&self) {
        let flushed = self.commit_log.flush();
        if flushed > 0 {
            self.checkpoint.set_physic_msg_timestamp(crate::message::now_millis());
        }
        for cq in self.consume_queues.all() {
            cq.flush();
        }
        self.checkpoint.set_logics_msg_timestamp(crate::message::now_millis());
        if let Err(e) = self.index_service.flush_current() {
            log::warn!("index flush failed: {}", e);
        }
        self.checkpoint.set_index_msg_timestamp(crate::message::now_millis());
        if let Err(e) = self.checkpoint.flush() {
            log::warn!("checkpoint flush failed: {}", e);
        }
    }

    pub fn spawn_flush_loop(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.flush();
            }
        });
    }

    /// Clean shutdown: flush everything, then remove the abort marker so
    /// the next startup takes the normal (not crash) recovery path.
    pub fn shutdown(&self) {
        self.commit_log.shutdown();
        self.flush();
        let _ = std::fs::remove_file(self.store_root.join(ABORT_MARKER));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_store(dir: &std::path::Path) -> DefaultMessageStore {
        let cfg = StoreConfig {
            store_root: dir.to_path_buf(),
            ..StoreConfig::default()
        };
        DefaultMessageStore::new(cfg).unwrap()
    }

    #[test]
    fn put_then_dispatch_then_get() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        for body in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let r = store.put_message(MessageExtBrokerInner::new("T", 0, body.to_vec()));
            assert!(r.is_ok());
        }
        let dispatched = store.dispatch_pending_for_test();
        assert_eq!(dispatched, 3);

        let result = store.get_message("T", 0, 0, 10);
        assert_eq!(result.status, GetMessageStatus::Found);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[0].body, b"a");
        assert_eq!(result.next_begin_offset, 3);
    }

    #[test]
    fn get_message_on_unknown_queue_reports_no_matched_logic_queue() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        let result = store.get_message("NOPE", 0, 0, 10);
        assert_eq!(result.status, GetMessageStatus::NoMatchedLogicQueue);
    }

    #[test]
    fn pull_past_tail_overflows_by_one_and_can_be_parked() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.put_message(MessageExtBrokerInner::new("T", 0, b"x".to_vec()));
        store.dispatch_pending_for_test();

        let result = store.get_message("T", 0, 1, 10);
        assert_eq!(result.status, GetMessageStatus::OffsetOverflowOne);

        store.suspend_pull_request("T", 0, 1, 1);
        assert_eq!(store.pull_hold.parked_count("T", 0), 1);

        store.put_message(MessageExtBrokerInner::new("T", 0, b"y".to_vec()));
        store.dispatch_pending_for_test();
        assert_eq!(store.pull_hold.parked_count("T", 0), 0);
    }

    #[test]
    fn keyed_message_is_queryable_via_index() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        let msg = MessageExtBrokerInner::new("T", 0, b"payload".to_vec())
            .with_property(crate::message::properties::KEYS, "order-42");
        let r = store.put_message(msg);
        assert!(r.is_ok());
        store.dispatch_pending_for_test();

        let found = store.index_service.select("T", "order-42", 0, crate::message::now_millis() + 1, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], r.wrote_offset);
    }

    #[test]
    fn reopening_store_preserves_committed_messages() {
        let dir = tempdir().unwrap();
        {
            let store = new_store(dir.path());
            store.put_message(MessageExtBrokerInner::new("T", 0, b"persisted".to_vec()));
            store.dispatch_pending_for_test();
            store.shutdown();
        }
        let store2 = new_store(dir.path());
        let result = store2.get_message("T", 0, 0, 10);
        assert_eq!(result.status, GetMessageStatus::Found);
        assert_eq!(result.messages[0].body, b"persisted");
    }
}
