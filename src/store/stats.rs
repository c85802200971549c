//! Store Stats: counters, TPS windows, per-topic statistics. The latency
//! histogram side mirrors `benchit`'s `Metrics` (percentile snapshots via
//! the `histogram` crate); the counter side exports through `prometheus`
//! the way a long-running broker process would, rather than only printing
//! to stdout like the load-test tool does.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use histogram::Histogram;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub struct StoreStatsService {
    registry: Registry,
    put_message_total: IntCounter,
    put_message_failed_total: IntCounter,
    get_message_total: IntCounter,
    get_message_found_total: IntCounter,
    put_latency: Mutex<Histogram>,
    topic_counter_vec: IntCounterVec,
    window_start: Mutex<Instant>,
}

impl StoreStatsService {
    pub fn new() -> StoreStatsService {
        let registry = Registry::new();

        let put_message_total = IntCounter::new("store_put_message_total", "total PutMessage calls").unwrap();
        let put_message_failed_total =
            IntCounter::new("store_put_message_failed_total", "PutMessage calls that did not return OK").unwrap();
        let get_message_total = IntCounter::new("store_get_message_total", "total pull lookups").unwrap();
        let get_message_found_total =
            IntCounter::new("store_get_message_found_total", "pull lookups that found a message").unwrap();
        let topic_counter_vec = IntCounterVec::new(
            Opts::new("store_put_message_by_topic_total", "PutMessage calls by topic"),
            &["topic"],
        )
        .unwrap();

        registry.register(Box::new(put_message_total.clone())).ok();
        registry.register(Box::new(put_message_failed_total.clone())).ok();
        registry.register(Box::new(get_message_total.clone())).ok();
        registry.register(Box::new(get_message_found_total.clone())).ok();
        registry.register(Box::new(topic_counter_vec.clone())).ok();

        StoreStatsService {
            registry,
            put_message_total,
            put_message_failed_total,
            get_message_total,
            get_message_found_total,
            put_latency: Mutex::new(Histogram::new()),
            topic_counter_vec,
            window_start: Mutex::new(Instant::now()),
        }
    }

    pub fn record_put(&self, topic: &str, ok: bool, latency: Duration) {
        self.put_message_total.inc();
        if !ok {
            self.put_message_failed_total.inc();
        }
        self.topic_counter_vec.with_label_values(&[topic]).inc();
        if let Ok(mut h) = self.put_latency.lock() {
            let _ = h.increment(latency.as_nanos() as u64);
        }
    }

    pub fn record_get(&self, found: bool) {
        self.get_message_total.inc();
        if found {
            self.get_message_found_total.inc();
        }
    }

    pub fn put_message_total(&self) -> u64 {
        self.put_message_total.get()
    }

    pub fn put_message_failed_total(&self) -> u64 {
        self.put_message_failed_total.get()
    }

    /// Percentile snapshot of put latency (p95/p99/p999/max in
    /// nanoseconds), the way `benchit::Metrics::snapshot` reports over
    /// each 10s window, reset after every call.
    pub fn snapshot_put_latency(&self) -> Option<(u64, u64, u64, u64)> {
        let mut h = self.put_latency.lock().unwrap();
        if h.entries() == 0 {
            return None;
        }
        let p95 = h.percentile(95.0).ok()?;
        let p99 = h.percentile(99.0).ok()?;
        let p999 = h.percentile(99.9).ok()?;
        let max = h.maximum().ok()?;
        h.clear();
        Some((p95, p99, p999, max))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Logs a one-line snapshot at `log::info!` level — used by the
    /// periodic stats worker instead of `println!`.
    pub fn log_snapshot(&self) {
        let elapsed = {
            let mut start = self.window_start.lock().unwrap();
            let e = start.elapsed();
            *start = Instant::now();
            e
        };
        let tps = self.put_message_total() as f64 / elapsed.as_secs_f64().max(0.001);
        match self.snapshot_put_latency() {
            Some((p95, p99, p999, max)) => log::info!(
                "store stats: {:.1} msg/s, put p95={}ns p99={}ns p999={}ns max={}ns",
                tps,
                p95,
                p99,
                p999,
                max
            ),
            None => log::info!("store stats: {:.1} msg/s, no puts this window", tps),
        }
    }

    pub fn spawn_log_loop(self: std::sync::Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.log_snapshot();
            }
        });
    }
}

impl Default for StoreStatsService {
    fn default() -> StoreStatsService {
        StoreStatsService::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_put_and_snapshots_latency() {
        let stats = StoreStatsService::new();
        stats.record_put("T", true, Duration::from_micros(100));
        stats.record_put("T", false, Duration::from_micros(200));
        assert_eq!(stats.put_message_total(), 2);
        assert_eq!(stats.put_message_failed_total(), 1);
        assert!(stats.snapshot_put_latency().is_some());
    }
}
