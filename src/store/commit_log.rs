//! The single global message journal (section 4.3). Appends are serialized
//! by one mutex; readers go through [`MappedFileQueue::find_by_offset`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{AppendMessageStatus, PutMessageResult, PutMessageStatus, StoreError, StoreResult};
use crate::message::{
    self, decode, encode_blank, tags_hash_code, DecodeOutcome, MessageExtBrokerInner,
    MessageRecord, MAX_PROPERTIES_LENGTH, MAX_TOPIC_LENGTH, MIN_BLANK_LENGTH,
};
use crate::store::dispatch::{send_blocking, DispatchRequest, QueueOffsetTable};
use crate::store::ha::{HaFlushType, SlaveAckWatermark};
use crate::store::mapped_file::MappedFile;
use crate::store::mapped_file_queue::MappedFileQueue;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDiskType {
    SyncFlush,
    AsyncFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    Master,
    Slave,
}

pub struct CommitLogConfig {
    pub segment_size: usize,
    pub flush_disk_type: FlushDiskType,
    pub flush_least_pages: usize,
    pub flush_disk_timeout: Duration,
    pub max_message_size: usize,
    pub store_host: u64,
    /// HA replication policy for this put path (section 4.7); only
    /// consulted when this commit log's role is `Master`.
    pub ha_flush_type: HaFlushType,
    pub ha_sync_timeout: Duration,
}

impl Default for CommitLogConfig {
    fn default() -> CommitLogConfig {
        CommitLogConfig {
            segment_size: 1024 * 1024 * 1024,
            flush_disk_type: FlushDiskType::AsyncFlush,
            flush_least_pages: 4,
            flush_disk_timeout: Duration::from_secs(5),
            max_message_size: message::DEFAULT_MAX_MESSAGE_SIZE,
            store_host: 0,
            ha_flush_type: HaFlushType::AsyncMaster,
            ha_sync_timeout: Duration::from_secs(3),
        }
    }
}

pub struct CommitLog {
    queue: MappedFileQueue,
    config: CommitLogConfig,
    put_lock: Mutex<QueueOffsetTable>,
    role: std::sync::RwLock<BrokerRole>,
    shutting_down: AtomicBool,
    dispatch_tx: SyncSender<DispatchRequest>,
    /// Last time the append lock was observed held for longer than the
    /// page-cache-busy threshold; used to report `OsPageCacheBusy`.
    last_lock_wait: AtomicI64,
    /// Set once an `HaMaster` is wired up; `None` means no slave has ever
    /// been configured, so a SYNC_MASTER put fails fast with
    /// `SlaveNotAvailable` instead of blocking for the full deadline.
    ha_watermark: std::sync::RwLock<Option<Arc<SlaveAckWatermark>>>,
}

const PAGE_CACHE_BUSY_THRESHOLD_MS: i64 = 1000;

impl CommitLog {
    pub fn new(
        dir: impl AsRef<Path>,
        config: CommitLogConfig,
        dispatch_tx: SyncSender<DispatchRequest>,
    ) -> CommitLog {
        CommitLog {
            queue: MappedFileQueue::new(dir.as_ref(), config.segment_size),
            config,
            put_lock: Mutex::new(QueueOffsetTable::new()),
            role: std::sync::RwLock::new(BrokerRole::Master),
            shutting_down: AtomicBool::new(false),
            dispatch_tx,
            last_lock_wait: AtomicI64::new(0),
            ha_watermark: std::sync::RwLock::new(None),
        }
    }

    pub fn load(&self) -> StoreResult<()> {
        self.queue.load()
    }

    pub fn set_role(&self, role: BrokerRole) {
        *self.role.write().unwrap() = role;
    }

    pub fn role(&self) -> BrokerRole {
        *self.role.read().unwrap()
    }

    /// Hands the commit log the watermark its `HaMaster` updates as slaves
    /// ack replicated bytes, so SYNC_MASTER puts have something to wait on.
    pub fn set_ha_watermark(&self, watermark: Arc<SlaveAckWatermark>) {
        *self.ha_watermark.write().unwrap() = Some(watermark);
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Clones a handle to the dispatch channel's sending half for callers
    /// that feed dispatch requests from outside the normal append path —
    /// the slave-side [`crate::store::reput::ReputMessageService`] being
    /// the only one (section 4.7).
    pub fn dispatch_sender(&self) -> SyncSender<DispatchRequest> {
        self.dispatch_tx.clone()
    }

    pub fn min_offset(&self) -> i64 {
        self.queue.min_offset()
    }

    pub fn max_offset(&self) -> i64 {
        self.queue.max_offset()
    }

    pub fn flushed_offset(&self) -> i64 {
        match self.queue.first_file() {
            Some(_) => {
                // the flushed tail is the last file's from_offset + its
                // flushed position; fold over all files is unnecessary
                // since only the tail file can have unflushed bytes.
                self.queue
                    .last_file()
                    .map(|f| f.file_from_offset + f.flushed_position() as i64)
                    .unwrap_or(0)
            }
            None => 0,
        }
    }

    /// Serializes `inner` into the active segment, then enforces whichever
    /// durability deadline the config asks for before returning: under
    /// `FlushDiskType::SyncFlush` it blocks (driving its own group-commit
    /// flush attempts) until the write is flushed or `flush_disk_timeout`
    /// elapses, and as a `SYNC_MASTER` it additionally blocks on the HA
    /// watermark until a slave has acked the offset or `ha_sync_timeout`
    /// elapses. Neither wait needs this method to be `async`: both are
    /// plain blocking loops, matching the spec's "deadline is authoritative"
    /// rule.
    pub fn put_message(&self, inner: MessageExtBrokerInner) -> PutMessageResult {
        if self.shutting_down.load(Ordering::Acquire) {
            return PutMessageResult::failed(PutMessageStatus::ServiceNotAvailable);
        }
        if self.role() == BrokerRole::Slave {
            return PutMessageResult::failed(PutMessageStatus::ServiceNotAvailable);
        }
        if inner.topic.as_bytes().len() > MAX_TOPIC_LENGTH {
            return PutMessageResult::failed(PutMessageStatus::MessageIllegal);
        }
        if inner.properties_encoded().as_bytes().len() > MAX_PROPERTIES_LENGTH {
            return PutMessageResult::failed(PutMessageStatus::PropertiesSizeExceeded);
        }
        if inner.body.len() > self.config.max_message_size {
            return PutMessageResult::failed(PutMessageStatus::MessageIllegal);
        }

        let lock_wait_start = Instant::now();
        let mut table = self.put_lock.lock().unwrap();
        let waited = lock_wait_start.elapsed().as_millis() as i64;
        self.last_lock_wait.store(waited, Ordering::Release);
        if waited > PAGE_CACHE_BUSY_THRESHOLD_MS {
            return PutMessageResult::failed(PutMessageStatus::OsPageCacheBusy);
        }

        let queue_offset = table.next_offset(&inner.topic, inner.queue_id);
        let store_ts = message::now_millis();

        let mut record = MessageRecord {
            inner: inner.clone(),
            queue_offset,
            phy_offset: 0,
            store_timestamp: store_ts,
            store_host: self.config.store_host,
        };
        let prelim = match record.encode() {
            Some(b) => b,
            None => return PutMessageResult::failed(PutMessageStatus::MessageIllegal),
        };
        let needed = prelim.len();

        let mf = match self.acquire_writable_file(needed) {
            Ok(mf) => mf,
            Err(_) => return PutMessageResult::failed(PutMessageStatus::CreateMapedFileFailed),
        };

        let phy_offset = mf.file_from_offset + mf.write_position() as i64;
        record.phy_offset = phy_offset;
        let bytes = record.encode().expect("size-stable re-encode");

        let result = mf.append(&bytes, store_ts);
        match result.status {
            AppendMessageStatus::Ok => {
                // queue offset table mutation + append happen under the
                // same lock, so dispatch order always matches append order.
                drop(table);

                let key_list = record
                    .inner
                    .properties
                    .get(message::properties::KEYS)
                    .map(|k| k.split(' ').map(str::to_string).collect())
                    .unwrap_or_default();

                send_blocking(
                    &self.dispatch_tx,
                    DispatchRequest {
                        topic: record.inner.topic.clone(),
                        queue_id: record.inner.queue_id,
                        phy_offset,
                        size: result.wrote_bytes,
                        tags_code: record.inner.tags_code(),
                        store_timestamp: store_ts,
                        queue_offset,
                        key_list,
                        prepared_transaction_offset: record.inner.prepared_transaction_offset,
                        sys_flag: record.inner.sys_flag,
                    },
                );

                let mut put_result = PutMessageResult {
                    status: PutMessageStatus::Ok,
                    wrote_offset: phy_offset,
                    wrote_bytes: result.wrote_bytes,
                    msg_id: message::format_msg_id(self.config.store_host, phy_offset),
                    store_timestamp: store_ts,
                    queue_offset,
                };

                let target = phy_offset + result.wrote_bytes as i64;

                if self.config.flush_disk_type == FlushDiskType::SyncFlush
                    && !self.wait_for_flush(target, Instant::now() + self.config.flush_disk_timeout)
                {
                    put_result.status = PutMessageStatus::FlushDiskTimeout;
                }

                if put_result.status == PutMessageStatus::Ok
                    && self.role() == BrokerRole::Master
                    && self.config.ha_flush_type == HaFlushType::SyncMaster
                {
                    match self.ha_watermark.read().unwrap().clone() {
                        Some(watermark) => {
                            if !watermark.wait_for_blocking(target, self.config.ha_sync_timeout) {
                                put_result.status = PutMessageStatus::FlushSlaveTimeout;
                            }
                        }
                        None => put_result.status = PutMessageStatus::SlaveNotAvailable,
                    }
                }

                put_result
            }
            _ => PutMessageResult::failed(PutMessageStatus::UnknownError),
        }
    }

    /// Group-commit wait for `FlushDiskType::SyncFlush`: repeatedly forces
    /// the tail segment to flush regardless of `flush_least_pages` (that
    /// threshold is an async-flush batching knob; sync flush means every
    /// write gets flushed) until `target` is flushed or `deadline` passes.
    /// Covers any other puts that landed on the same segment while this
    /// one was waiting for its turn at the append lock, not just its own
    /// bytes — that's the group commit.
    fn wait_for_flush(&self, target: i64, deadline: Instant) -> bool {
        loop {
            if let Some(f) = self.queue.last_file() {
                let _ = f.flush(0);
            }
            if self.flushed_offset() >= target {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.flushed_offset() >= target;
            }
            std::thread::sleep(Duration::from_millis(1).min(remaining));
        }
    }

    /// Appends raw bytes verbatim — the slave's HA receive path. The
    /// caller (HA client) is responsible for contiguity validation; this
    /// only handles segment rotation.
    pub fn append_raw(&self, bytes: &[u8]) -> StoreResult<()> {
        let needed = bytes.len();
        let mf = self.acquire_writable_file(needed)?;
        if !mf.append_raw(bytes) {
            return Err(StoreError::Corrupt("raw append did not fit".into()));
        }
        Ok(())
    }

    fn acquire_writable_file(&self, needed: usize) -> StoreResult<Arc<MappedFile>> {
        loop {
            let mf = self.queue.last_mapped_file(self.queue.max_offset())?;
            if mf.remaining() >= needed {
                return Ok(mf);
            }
            let remaining = mf.remaining();
            if remaining >= MIN_BLANK_LENGTH as usize {
                let blank = encode_blank(remaining as i32);
                mf.append_raw(&blank);
            } else if remaining > 0 {
                mf.set_write_position(mf.file_size);
            }
        }
    }

    pub fn flush(&self) -> usize {
        match self.queue.last_file() {
            Some(f) => f.flush(self.config.flush_least_pages).unwrap_or(0),
            None => 0,
        }
    }

    /// Reads exactly `size` bytes starting at `phy_offset`. Returns `None`
    /// if the offset has already rolled off (segment deleted) or is past
    /// the current write tail.
    pub fn get_message(&self, phy_offset: i64, size: i32) -> Option<Vec<u8>> {
        let mf = self.queue.find_by_offset(phy_offset, false)?;
        let local_pos = (phy_offset - mf.file_from_offset) as usize;
        let guard = mf.select(local_pos, Some(size as usize))?;
        Some(guard.bytes(local_pos, Some(size as usize)).to_vec())
    }

    pub fn pickup_store_timestamp(&self, phy_offset: i64, size: i32) -> Option<i64> {
        let bytes = self.get_message(phy_offset, size)?;
        let (_, _, msg) = decode(&bytes).ok()?;
        msg.map(|m| m.store_timestamp)
    }

    /// Reads up to `max_bytes` of raw (still-encoded) bytes starting at
    /// `phy_offset`, bounded by the segment containing that offset — the
    /// HA pusher's read path. Returns `None` once the offset has rolled
    /// off the front of the log (segment already deleted).
    pub fn read_raw(&self, phy_offset: i64, max_bytes: usize) -> Option<Vec<u8>> {
        let mf = self.queue.find_by_offset(phy_offset, false)?;
        let local_pos = (phy_offset - mf.file_from_offset) as usize;
        let guard = mf.select(local_pos, None)?;
        let available = mf.write_position().saturating_sub(local_pos);
        let take = available.min(max_bytes);
        if take == 0 {
            return None;
        }
        Some(guard.bytes(local_pos, Some(take)).to_vec())
    }

    /// Normal-shutdown recovery: scan from the start of the last few
    /// segments, parse records until a CRC/magic break, and set
    /// write/flushed positions to the last valid tail.
    pub fn recover_normally(&self, offset_table: &mut QueueOffsetTable) -> StoreResult<()> {
        let files = self.queue.all_files();
        if files.is_empty() {
            return Ok(());
        }
        let start_index = files.len().saturating_sub(3);
        let mut valid_phy_offset = files[start_index].file_from_offset;

        for f in &files[start_index..] {
            let data_len = f.file_size;
            let raw = {
                let guard = f.select(0, None);
                guard.map(|g| g.bytes(0, Some(data_len)).to_vec())
            };
            let raw = match raw {
                Some(r) => r,
                None => continue,
            };
            let mut pos = 0usize;
            loop {
                if pos + 8 > raw.len() {
                    break;
                }
                match decode(&raw[pos..]) {
                    Ok((DecodeOutcome::Blank, _consumed, _)) => {
                        pos = data_len;
                        break;
                    }
                    Ok((DecodeOutcome::Message, consumed, Some(msg))) => {
                        if consumed <= 0 {
                            break;
                        }
                        offset_table.set(&msg.topic, msg.queue_id, msg.queue_offset + 1);
                        pos += consumed as usize;
                        valid_phy_offset = f.file_from_offset + pos as i64;
                    }
                    _ => break,
                }
            }
            f.set_write_position(pos);
            f.set_flushed_position(pos);
        }

        self.queue.truncate_dirty(valid_phy_offset);
        Ok(())
    }

    /// Abnormal-shutdown (crash) recovery: find the newest segment whose
    /// first record's store timestamp is <= `checkpoint_min_ts`, re-scan
    /// from there.
    pub fn recover_abnormally(
        &self,
        checkpoint_min_ts: i64,
        offset_table: &mut QueueOffsetTable,
    ) -> StoreResult<i64> {
        let files = self.queue.all_files();
        if files.is_empty() {
            return Ok(0);
        }

        let mut start_idx = 0usize;
        for (i, f) in files.iter().enumerate().rev() {
            if f.store_timestamp() != 0 && f.store_timestamp() <= checkpoint_min_ts {
                start_idx = i;
                break;
            }
        }

        let mut valid_phy_offset = files[start_idx].file_from_offset;
        for f in &files[start_idx..] {
            let data_len = f.file_size;
            let raw = {
                let guard = f.select(0, None);
                guard.map(|g| g.bytes(0, Some(data_len)).to_vec())
            };
            let raw = match raw {
                Some(r) => r,
                None => continue,
            };
            let mut pos = 0usize;
            loop {
                if pos + 8 > raw.len() {
                    break;
                }
                match decode(&raw[pos..]) {
                    Ok((DecodeOutcome::Blank, _, _)) => {
                        pos = data_len;
                        break;
                    }
                    Ok((DecodeOutcome::Message, consumed, Some(msg))) => {
                        if consumed <= 0 {
                            break;
                        }
                        offset_table.set(&msg.topic, msg.queue_id, msg.queue_offset + 1);
                        pos += consumed as usize;
                        valid_phy_offset = f.file_from_offset + pos as i64;
                    }
                    _ => break,
                }
            }
            f.set_write_position(pos);
            f.set_flushed_position(pos);
        }

        self.queue.truncate_dirty(valid_phy_offset);
        Ok(valid_phy_offset)
    }

    /// Entry point the store uses at startup: picks the normal or
    /// abnormal recovery path and folds the reconstructed per-queue
    /// offsets back into the same table `put_message` allocates from, so
    /// the first post-recovery append continues the sequence exactly.
    pub fn recover(&self, abnormal: bool, checkpoint_min_ts: i64) -> StoreResult<()> {
        let mut table = self.put_lock.lock().unwrap();
        if abnormal {
            self.recover_abnormally(checkpoint_min_ts, &mut table)?;
        } else {
            self.recover_normally(&mut table)?;
        }
        Ok(())
    }

    pub fn tags_hash_code_of(tag: &str) -> i64 {
        tags_hash_code(tag)
    }

    pub fn delete_expired_files(&self, expiry_ms: i64, force_interval_ms: i64, batch_cap: usize, now_ms: i64) -> usize {
        self.queue.delete_expired_by_time(expiry_ms, force_interval_ms, batch_cap, now_ms)
    }

    pub fn queue(&self) -> &MappedFileQueue {
        &self.queue
    }
}

/// Pre-allocation worker named in section 5's inventory: periodically asks
/// the queue to create its next segment ahead of the tail filling up, so
/// `put_message`'s `acquire_writable_file` almost never pays for `mmap`/
/// `ftruncate` on the hot path.
pub struct AllocateMappedFileService {
    commit_log: Arc<CommitLog>,
    tick: Duration,
}

impl AllocateMappedFileService {
    pub fn new(commit_log: Arc<CommitLog>, tick: Duration) -> AllocateMappedFileService {
        AllocateMappedFileService { commit_log, tick }
    }

    pub fn run_once(&self) {
        if let Err(e) = self.commit_log.queue().try_pre_allocate() {
            log::warn!("commit log pre-allocation failed: {}", e);
        }
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
    use crate::store::dispatch::dispatch_channel;
    use tempfile::tempdir;

    fn new_log(dir: &Path, segment_size: usize) -> (CommitLog, std::sync::mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.segment_size = segment_size;
        (CommitLog::new(dir, cfg, tx), rx)
    }

    #[test]
    fn s1_single_producer_append_and_read() {
        let dir = tempdir().unwrap();
        let (log, rx) = new_log(dir.path(), 1024 * 1024);

        let mut offsets = vec![];
        for body in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            let msg = MessageExtBrokerInner::new("T", 0, body.to_vec());
            let r = log.put_message(msg);
            assert!(r.is_ok());
            offsets.push((r.wrote_offset, r.wrote_bytes));
        }

        assert_eq!(log.max_offset(), offsets[2].0 + offsets[2].1 as i64);

        for (i, (off, size)) in offsets.iter().enumerate() {
            let bytes = log.get_message(*off, *size).unwrap();
            let (_, _, msg) = decode(&bytes).unwrap();
            let msg = msg.unwrap();
            assert_eq!(msg.queue_offset, i as i64);
            assert_eq!(msg.body, [b'a' + i as u8]);
        }

        let mut seen = 0;
        while let Ok(req) = rx.try_recv() {
            assert_eq!(req.queue_id, 0);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn s3_segment_rollover_writes_blank_and_starts_new_segment() {
        let dir = tempdir().unwrap();
        // record size for a short body is about 70-90 bytes; use a small
        // segment so 3 fit and the 4th straddles.
        let (log, _rx) = new_log(dir.path(), 300);

        for i in 0..5 {
            let msg = MessageExtBrokerInner::new("T", 0, vec![b'x'; 10 + i]);
            let r = log.put_message(msg);
            assert!(r.is_ok(), "put {} failed: {:?}", i, r.status);
        }

        assert!(log.queue().len() >= 2);
        let second = &log.queue().all_files()[1];
        assert_eq!(second.file_from_offset, 300);
    }

    #[test]
    fn rejects_oversized_topic() {
        let dir = tempdir().unwrap();
        let (log, _rx) = new_log(dir.path(), 1024 * 1024);
        let msg = MessageExtBrokerInner::new("x".repeat(200), 0, b"a".to_vec());
        let r = log.put_message(msg);
        assert_eq!(r.status, PutMessageStatus::MessageIllegal);
    }

    #[test]
    fn slave_role_rejects_put() {
        let dir = tempdir().unwrap();
        let (log, _rx) = new_log(dir.path(), 1024 * 1024);
        log.set_role(BrokerRole::Slave);
        let r = log.put_message(MessageExtBrokerInner::new("T", 0, b"a".to_vec()));
        assert_eq!(r.status, PutMessageStatus::ServiceNotAvailable);
    }

    #[test]
    fn sync_flush_put_returns_ok_once_flushed() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.flush_disk_type = FlushDiskType::SyncFlush;
        cfg.flush_disk_timeout = Duration::from_secs(1);
        let log = CommitLog::new(dir.path(), cfg, tx);

        let r = log.put_message(MessageExtBrokerInner::new("T", 0, b"sync".to_vec()));
        assert!(r.is_ok());
        assert!(log.flushed_offset() >= r.wrote_offset + r.wrote_bytes as i64);
    }

    #[test]
    fn sync_master_put_fails_fast_without_a_registered_slave() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.ha_flush_type = HaFlushType::SyncMaster;
        cfg.ha_sync_timeout = Duration::from_millis(50);
        let log = CommitLog::new(dir.path(), cfg, tx);

        let r = log.put_message(MessageExtBrokerInner::new("T", 0, b"x".to_vec()));
        assert_eq!(r.status, PutMessageStatus::SlaveNotAvailable);
    }

    #[test]
    fn sync_master_put_waits_for_watermark_then_succeeds() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.ha_flush_type = HaFlushType::SyncMaster;
        cfg.ha_sync_timeout = Duration::from_secs(2);
        let log = Arc::new(CommitLog::new(dir.path(), cfg, tx));

        let watermark = SlaveAckWatermark::new();
        log.set_ha_watermark(watermark.clone());

        let log2 = log.clone();
        let handle = std::thread::spawn(move || log2.put_message(MessageExtBrokerInner::new("T", 0, b"x".to_vec())));

        // give the put a moment to reach the wait, then ack past it.
        std::thread::sleep(Duration::from_millis(20));
        watermark.advance(log.max_offset());

        let r = handle.join().unwrap();
        assert!(r.is_ok(), "expected Ok, got {:?}", r.status);
    }

    #[test]
    fn sync_master_put_times_out_when_slave_never_acks() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = dispatch_channel(1024);
        let mut cfg = CommitLogConfig::default();
        cfg.ha_flush_type = HaFlushType::SyncMaster;
        cfg.ha_sync_timeout = Duration::from_millis(30);
        let log = CommitLog::new(dir.path(), cfg, tx);
        log.set_ha_watermark(SlaveAckWatermark::new());

        let r = log.put_message(MessageExtBrokerInner::new("T", 0, b"x".to_vec()));
        assert_eq!(r.status, PutMessageStatus::FlushSlaveTimeout);
    }

    #[test]
    fn allocate_service_pre_creates_next_segment_ahead_of_rollover() {
        let dir = tempdir().unwrap();
        let (log, _rx) = new_log(dir.path(), 300);
        let r = log.put_message(MessageExtBrokerInner::new("T", 0, vec![b'x'; 10]));
        assert!(r.is_ok());
        assert_eq!(log.queue().len(), 1);

        // force the tail to report full without actually writing 300 bytes
        // of payload into it, the same way mapped_file_queue's own tests
        // simulate rollover.
        log.queue().last_file().unwrap().set_write_position(300);

        let log = Arc::new(log);
        let allocator = AllocateMappedFileService::new(log.clone(), Duration::from_secs(60));
        allocator.run_once();
        assert_eq!(log.queue().len(), 1, "pre-allocated segment isn't published until needed");

        let r = log.put_message(MessageExtBrokerInner::new("T", 0, vec![b'y'; 10]));
        assert!(r.is_ok());
        assert_eq!(log.queue().len(), 2);
        assert_eq!(log.queue().all_files()[1].file_from_offset, 300);
    }
}
