//! Broker process entry point: loads `BrokerConfig`, opens the store, and
//! starts every background worker named in section 5's inventory —
//! dispatch, flush, checkpoint, pull-hold tick, cleanup, schedule, the
//! broker-side managers' persistor, and (role-dependent) HA master or
//! client. The RPC-handling side (accepting `PUT_MESSAGE`/`PULL_MESSAGE`
//! etc. over the wire envelope) is out of scope for the core (section 1);
//! this binary wires the storage engine up and keeps it running so it can
//! be driven in-process or by a future processor layer.

use getopts::Options;
use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use store::broker::{
    BrokerManagers, DelayOffsetManager, OffsetManager, SubscriptionGroupManager, TopicConfigManager,
};
use store::config::BrokerConfig;
use store::store::cleanup::{CommitLogCleanupConfig, CommitLogCleanupService, ConsumeQueueCleanupService};
use store::store::commit_log::AllocateMappedFileService;
use store::store::ha::client::HaClient;
use store::store::ha::master::HaMaster;
use store::store::reput::ReputMessageService;
use store::store::schedule::ScheduleMessageService;
use store::store::DefaultMessageStore;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn parse_args() -> (BrokerConfig, bool) {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("c", "config", "path to broker.toml", "FILE");
    opts.optflag("s", "slave", "run as slave of the configured master");
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

    let config = match matches.opt_str("c") {
        Some(path) => BrokerConfig::load(&path).unwrap_or_else(|e| {
            eprintln!("failed to load config {}: {}", path, e);
            exit(1);
        }),
        None => {
            let mut cfg = BrokerConfig::default();
            cfg.apply_env_overrides();
            cfg
        }
    };

    (config, matches.opt_present("s"))
}

fn main() {
    env_logger::init();
    let (config, is_slave) = parse_args();

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    runtime.block_on(run(config, is_slave));
}

async fn run(config: BrokerConfig, is_slave: bool) {
    let store = Arc::new(DefaultMessageStore::new(config.to_store_config()).expect("failed to open store"));

    if is_slave {
        store.commit_log().set_role(store::store::commit_log::BrokerRole::Slave);
    }

    let managers = Arc::new(BrokerManagers {
        topic_config: Arc::new(TopicConfigManager::new(&config.store_root)),
        subscription_group: Arc::new(SubscriptionGroupManager::new(&config.store_root)),
        offset: Arc::new(OffsetManager::new(&config.store_root)),
        delay_offset: Arc::new(DelayOffsetManager::new(
            &config.store_root,
            Arc::new(ScheduleMessageService::new(store.clone())),
        )),
    });
    managers.load_all();
    managers.clone().spawn_periodic_persist(Duration::from_millis(config.manager_persist_period_ms));

    store.clone().spawn_dispatch_loop();
    store.clone().spawn_flush_loop(Duration::from_millis(config.checkpoint_flush_period_ms));
    store.pull_hold().clone().spawn_tick_loop(Duration::from_secs(1));
    store.stats().clone().spawn_log_loop(Duration::from_secs(60));

    let schedule = Arc::new(ScheduleMessageService::new(store.clone()));
    schedule.clone().start();

    let cleanup = Arc::new(CommitLogCleanupService::new(
        store.commit_log(),
        CommitLogCleanupConfig {
            file_reserved_time_ms: config.file_reserved_time_hours * 3_600_000,
            ..CommitLogCleanupConfig::default()
        },
    ));
    let store_root_for_disk_check = config.store_root.clone();
    cleanup.spawn_loop(move || disk_used_ratio(&store_root_for_disk_check));

    let cq_cleanup = Arc::new(ConsumeQueueCleanupService::new(
        store.commit_log(),
        store.consume_queues(),
        120_000,
    ));
    cq_cleanup.spawn_loop();

    let allocate = Arc::new(AllocateMappedFileService::new(store.commit_log(), Duration::from_millis(500)));
    allocate.spawn_loop();

    if is_slave {
        let addrs = config.namesrv_addrs();
        let master_addr = addrs.first().cloned().unwrap_or_else(|| "127.0.0.1:10912".to_string());
        let client = HaClient::new(master_addr, store.commit_log());
        tokio::spawn(client.run());

        let reput = Arc::new(ReputMessageService::new(
            store.commit_log(),
            store_dispatch_sender(&store),
        ));
        reput.spawn_loop(Duration::from_millis(20));
    } else {
        let ha_master = Arc::new(HaMaster::new(store.commit_log()));
        let ha_addr = format!("0.0.0.0:{}", config.ha_listen_port);
        if let Err(e) = ha_master.serve(&ha_addr).await {
            log::error!("failed to start HA master on {}: {}", ha_addr, e);
        }
    }

    log::info!("broker {} started", store.commit_log().max_offset());

    shutdown_on_signal().await;
    log::info!("shutting down");
    store.shutdown();
    managers.persist_all();
}

/// The dispatch channel's sending half lives inside `CommitLog`; the
/// reput service on a slave needs its own handle because replicated bytes
/// bypass `CommitLog::put_message`'s normal append path. Exposed here
/// rather than on `DefaultMessageStore` because only the slave wiring
/// needs it.
fn store_dispatch_sender(
    store: &Arc<DefaultMessageStore>,
) -> std::sync::mpsc::SyncSender<store::store::dispatch::DispatchRequest> {
    store.commit_log().dispatch_sender()
}

fn disk_used_ratio(path: &std::path::Path) -> f64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let total = stat.blocks() as f64;
            let free = stat.blocks_available() as f64;
            if total <= 0.0 {
                0.0
            } else {
                1.0 - (free / total)
            }
        }
        Err(_) => 0.0,
    }
}

async fn shutdown_on_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
