// Tierpool - tiered-difficulty Stratum v1 pool
//
// Wiring: node RPC → job distributor → stratum tiers → share processor →
// event bus → ledger consumer → payout sink, plus the block tracker that
// settles found blocks and the HTTP read API.

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing_subscriber::EnvFilter;

use tierpool::api::{self, ApiState};
use tierpool::blockchain::{DistributorSettings, JobDistributor, NodePeer, NodeRpcClient};
use tierpool::bus::{
    EventBus, EventPublisher, EventSource, MemoryBus, RedisBus, RedisSource, RetryPolicy,
};
use tierpool::config::{BusBackend, Config};
use tierpool::jobs::JobBoard;
use tierpool::metrics::prometheus as metrics;
use tierpool::payout::{
    BlockTracker, MaturitySettings, MemoryPayoutSink, PayoutSink, RedisPayoutSink, TrackedBlock,
};
use tierpool::pplns::{
    Accounting, LedgerConsumer, LedgerStore, MemoryLedgerStore, PayoutCalculator, RedisLedgerStore,
    WindowClock,
};
use tierpool::shares::{ShareProcessor, ShareValidator};
use tierpool::stratum::{ServerSettings, StratumServer, Tier};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cfg = Config::load().context("invalid configuration")?;
    let coinbase = cfg.coinbase_params()?;
    let tiers: Vec<Tier> = cfg.tiers.iter().map(Tier::from_config).collect();

    tracing::info!(
        "Tierpool {} starting: {} tiers, fee {}%, bus {:?}",
        env!("CARGO_PKG_VERSION"),
        tiers.len(),
        cfg.pool_fee_percent,
        cfg.bus_backend
    );

    type Backends = (
        Arc<dyn EventBus>,
        Box<dyn EventSource>,
        Arc<dyn PayoutSink>,
        Arc<dyn LedgerStore>,
    );
    let (bus, ledger_source, sink, store): Backends = match cfg.bus_backend {
            BusBackend::Memory => {
                let memory = Arc::new(MemoryBus::new());
                let source: Box<dyn EventSource> = Box::new(memory.subscribe(&cfg.ledger_queue));
                let bus: Arc<dyn EventBus> = memory;
                let sink: Arc<dyn PayoutSink> = Arc::new(MemoryPayoutSink::new());
                let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
                (bus, source, sink, store)
            }
            BusBackend::Redis => {
                let bus: Arc<dyn EventBus> = Arc::new(
                    RedisBus::connect(&cfg.redis_url, &cfg.bus_prefix, &cfg.bus_queues)
                        .await
                        .context("redis bus")?,
                );
                let source: Box<dyn EventSource> = Box::new(
                    RedisSource::connect(&cfg.redis_url, &cfg.bus_prefix, &cfg.ledger_queue)
                        .await
                        .context("redis ledger queue")?,
                );
                let sink: Arc<dyn PayoutSink> = Arc::new(RedisPayoutSink::connect(&cfg.redis_url).await?);
                let store: Arc<dyn LedgerStore> = Arc::new(
                    RedisLedgerStore::connect(&cfg.redis_url, &cfg.bus_prefix)
                        .await
                        .context("redis ledger store")?,
                );
                (bus, source, sink, store)
            }
        };

    // Resume the ledger and apply what the previous run left queued before
    // any new share is stamped.
    let calculator = PayoutCalculator::new(cfg.fee_fraction())?;
    let accounting = Accounting::load(store.as_ref(), calculator, cfg.payout_history_len)
        .await
        .context("ledger checkpoint")?
        .shared();
    let mut consumer = LedgerConsumer::new(accounting.clone(), ledger_source, sink, store);
    consumer.catch_up().await;

    let (start_window, awaiting): (u64, Vec<TrackedBlock>) = {
        let acc = accounting.read();
        let awaiting = acc
            .awaiting()
            .map(|closed| TrackedBlock {
                window_id: closed.window.id,
                height: closed.block.height,
                hash: closed.block.hash.clone(),
            })
            .collect();
        (acc.ledger().current().id, awaiting)
    };
    tracing::info!(
        "Ledger resumed at window {} with {} blocks awaiting confirmation",
        start_window,
        awaiting.len()
    );
    metrics::set_window_id(start_window);
    let clock = Arc::new(WindowClock::new(start_window));

    let (publisher, publisher_task) = EventPublisher::spawn(
        bus,
        RetryPolicy {
            attempts: cfg.bus_retry_attempts,
            initial_backoff: Duration::from_millis(cfg.bus_retry_backoff_ms),
            ..RetryPolicy::default()
        },
    );

    let mut ledger_task = tokio::spawn(consumer.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let node: Arc<dyn NodePeer> = Arc::new(NodeRpcClient::new(
        cfg.node_rpc_url.clone(),
        cfg.node_rpc_user.as_deref(),
        cfg.node_rpc_password.as_deref(),
        None,
    ));
    let board = Arc::new(JobBoard::new());
    let refresh = Arc::new(Notify::new());

    let distributor = JobDistributor::new(
        node.clone(),
        board.clone(),
        publisher.clone(),
        coinbase,
        DistributorSettings {
            poll_interval: cfg.poll_interval(),
            stale_job_timeout: cfg.stale_job_timeout(),
            backoff_initial: Duration::from_millis(cfg.backoff_initial_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        },
        refresh.clone(),
    );
    let distributor_task = tokio::spawn(distributor.run(shutdown_rx.clone()));

    let tracker = BlockTracker::new(
        node,
        publisher.clone(),
        refresh,
        MaturitySettings {
            confirmations: cfg.block_confirmations,
            poll_interval: cfg.maturity_poll_interval(),
        },
    );
    for block in awaiting {
        tracker.track(block);
    }
    let tracker_task = tokio::spawn(tracker.clone().run(shutdown_rx.clone()));

    let processor = Arc::new(ShareProcessor::new(
        ShareValidator::new(cfg.ntime_tolerance_secs),
        clock,
        publisher,
        tracker,
    ));
    let server = Arc::new(StratumServer::new(
        ServerSettings::from_config(&cfg),
        processor,
        board.clone(),
    ));
    let listeners = server.start(&tiers, shutdown_rx.clone())?;

    let api_state = ApiState {
        accounting,
        board,
        server: Some(server.clone()),
        tiers: cfg
            .tiers
            .iter()
            .map(|t| json!({"name": t.name, "port": t.port, "difficulty": t.difficulty}))
            .collect(),
        start_time: Utc::now().timestamp(),
    };

    api::serve(&cfg.api_listen, api_state, shutdown_signal()).await?;

    // API returned: stop listeners, connections and the distributor
    let _ = shutdown_tx.send(true);
    for handle in listeners {
        let _ = handle.await;
    }
    let _ = distributor_task.await;
    let _ = tracker_task.await;

    // The publisher stops once every handle is gone; connection tasks
    // drop theirs as they exit.
    drop(server);
    if tokio::time::timeout(Duration::from_secs(5), publisher_task).await.is_err() {
        tracing::warn!("Event publisher did not drain within 5s");
    }
    if tokio::time::timeout(Duration::from_secs(5), &mut ledger_task).await.is_err() {
        ledger_task.abort();
    }

    tracing::info!("Tierpool shut down cleanly");
    Ok(())
}
