//! Load-test tool for the storage engine, in the spirit of the original
//! `benchit`: put a stream of randomly-sized messages as fast as possible
//! and report append-latency percentiles. Since the remoting transport is
//! out of scope for the core (section 1), this drives
//! `store::DefaultMessageStore` in-process rather than over a network
//! connection — the original drives `LogServerClient` over RPC, but the
//! same "generate random bodies, time each append, histogram the
//! latencies" shape carries over directly.

use getopts::Options;
use rand::distributions::Alphanumeric;
use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;
use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;

use store::message::MessageExtBrokerInner;
use store::store::{DefaultMessageStore, StoreConfig};

struct RandomSource {
    chars: usize,
    rand: SmallRng,
}

impl RandomSource {
    fn new(chars: usize) -> RandomSource {
        RandomSource {
            chars,
            rand: SmallRng::from_entropy(),
        }
    }

    fn random_body(&mut self) -> Vec<u8> {
        (&mut self.rand)
            .sample_iter(&Alphanumeric)
            .take(self.chars)
            .collect()
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

struct BenchArgs {
    store_root: String,
    topic: String,
    queues: i32,
    message_count: u64,
    message_bytes: usize,
}

fn parse_args() -> BenchArgs {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("d", "dir", "store directory (default: benchit-store)", "DIR");
    opts.optopt("t", "topic", "topic to put to (default: bench)", "TOPIC");
    opts.optopt("q", "queues", "number of queue ids to spread across (default: 4)", "N");
    opts.optopt("n", "count", "number of messages to put (default: 100000)", "N");
    opts.optopt("b", "bytes", "message body size in bytes (default: 128)", "N");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    if matches.opt_present("h") {
        print_usage(&program, &opts);
        exit(0);
    }

    BenchArgs {
        store_root: matches.opt_str("d").unwrap_or_else(|| "benchit-store".to_string()),
        topic: matches.opt_str("t").unwrap_or_else(|| "bench".to_string()),
        queues: matches.opt_str("q").and_then(|s| s.parse().ok()).unwrap_or(4),
        message_count: matches.opt_str("n").and_then(|s| s.parse().ok()).unwrap_or(100_000),
        message_bytes: matches.opt_str("b").and_then(|s| s.parse().ok()).unwrap_or(128),
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let store = Arc::new(
        DefaultMessageStore::new(StoreConfig {
            store_root: args.store_root.clone().into(),
            ..StoreConfig::default()
        })
        .expect("failed to open store"),
    );

    store.clone().spawn_dispatch_loop();

    let mut source = RandomSource::new(args.message_bytes);
    let mut histogram = histogram::Histogram::new();

    let start = Instant::now();
    for i in 0..args.message_count {
        let queue_id = (i as i32) % args.queues.max(1);
        let body = source.random_body();
        let put_start = Instant::now();
        let result = store.put_message(MessageExtBrokerInner::new(args.topic.clone(), queue_id, body));
        let elapsed_ns = put_start.elapsed().as_nanos() as u64;
        if !result.is_ok() {
            eprintln!("put failed: {:?}", result.status);
            continue;
        }
        histogram.increment(elapsed_ns).ok();
    }
    let total = start.elapsed();

    store.shutdown();

    println!("put {} messages in {:?}", args.message_count, total);
    println!(
        "latency ns: p50={} p95={} p99={} p999={} max={}",
        histogram.percentile(50.0).unwrap_or(0),
        histogram.percentile(95.0).unwrap_or(0),
        histogram.percentile(99.0).unwrap_or(0),
        histogram.percentile(99.9).unwrap_or(0),
        histogram.maximum().unwrap_or(0),
    );
}
