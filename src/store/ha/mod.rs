//! Master pushes commit-log bytes to slaves; slaves accept and append
//! (section 4.7). Framing: `start_offset(8) body_len(4) body`.

pub mod client;
pub mod master;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Shared per-connection watermark: the largest offset a slave pusher has
/// confirmed the slave holds. SYNC_MASTER producers poll this (or better,
/// `tokio::sync::Notify`-wake on it) while waiting for replication to
/// catch up to their append.
pub struct SlaveAckWatermark {
    offset: AtomicI64,
    notify: tokio::sync::Notify,
}

impl SlaveAckWatermark {
    pub fn new() -> Arc<SlaveAckWatermark> {
        Arc::new(SlaveAckWatermark {
            offset: AtomicI64::new(0),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub fn get(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn advance(&self, offset: i64) {
        let prev = self.offset.fetch_max(offset, Ordering::AcqRel);
        if offset > prev {
            self.notify.notify_waiters();
        }
    }

    /// Waits until the watermark reaches `target` or `deadline` elapses.
    /// Returns `true` if it reached the target in time.
    pub async fn wait_for(&self, target: i64, deadline: std::time::Duration) -> bool {
        if self.get() >= target {
            return true;
        }
        let fut = async {
            loop {
                let notified = self.notify.notified();
                if self.get() >= target {
                    return;
                }
                notified.await;
                if self.get() >= target {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, fut).await.is_ok()
    }

    /// Synchronous equivalent of [`Self::wait_for`] for callers that can't
    /// `.await` — `CommitLog::put_message` blocks the calling thread rather
    /// than being `async` itself, so SYNC_MASTER producers poll here
    /// instead of parking on the `Notify`.
    pub fn wait_for_blocking(&self, target: i64, deadline: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            if self.get() >= target {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return self.get() >= target;
            }
            std::thread::sleep(std::time::Duration::from_millis(2).min(deadline - elapsed));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaFlushType {
    SyncMaster,
    AsyncMaster,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn watermark_wakes_waiter_on_advance() {
        let wm = SlaveAckWatermark::new();
        let wm2 = wm.clone();
        let handle = tokio::spawn(async move { wm2.wait_for(100, std::time::Duration::from_secs(2)).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        wm.advance(100);
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn watermark_times_out() {
        let wm = SlaveAckWatermark::new();
        let ok = wm.wait_for(100, std::time::Duration::from_millis(50)).await;
        assert!(!ok);
    }

    #[test]
    fn wait_for_blocking_returns_once_advanced_from_another_thread() {
        let wm = SlaveAckWatermark::new();
        let wm2 = wm.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            wm2.advance(100);
        });
        assert!(wm.wait_for_blocking(100, std::time::Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_blocking_times_out() {
        let wm = SlaveAckWatermark::new();
        assert!(!wm.wait_for_blocking(100, std::time::Duration::from_millis(30)));
    }
}
