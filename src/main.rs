mod app;
mod bus;
mod config;
mod error;
mod irc;
mod logging;

use crate::app::dispatcher::Dispatcher;
use crate::app::event::NetworkEvent;
use crate::app::stats::RelayStats;
use crate::bus::publisher::BusAdapter;
use crate::bus::redis::{run_subscription, RedisPublisher};
use crate::irc::manager::ConnectionManager;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EVENT_QUEUE: usize = 1024;
const PUBLISH_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let path = config::config_path(std::env::args().nth(1));
    let cfg = match config::load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    logging::init(&cfg.log);
    info!(config = %path.display(), networks = cfg.networks.len(), "Starting tenyks");

    run(cfg).await
}

async fn run(cfg: config::AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let stats = Arc::new(RelayStats::default());
    let client = redis::Client::open(cfg.bus.url.as_str()).context("invalid bus url")?;

    let (event_tx, event_rx) = mpsc::channel::<NetworkEvent>(EVENT_QUEUE);
    let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE);

    let adapter = BusAdapter::new(RedisPublisher::new(client.clone()), &cfg.bus, stats.clone());
    let publisher = tokio::spawn(adapter.run(publish_rx));

    let (dispatcher, router) =
        Dispatcher::new(&cfg, event_rx, publish_tx, stats.clone(), &shutdown);

    // Each subscription stops with the process or when its network gives up.
    let subscriptions: Vec<_> = cfg
        .networks
        .iter()
        .map(|network| {
            let stop = dispatcher
                .teardown(&network.name)
                .unwrap_or_else(|| shutdown.child_token());
            tokio::spawn(run_subscription(
                client.clone(),
                network.name.clone(),
                router.clone(),
                cfg.bus.retry_delay(),
                stop,
            ))
        })
        .collect();
    drop(router);
    let dispatcher = tokio::spawn(dispatcher.run());

    // Connect all networks concurrently
    let mut manager = ConnectionManager::new(event_tx, cfg.core.clone(), shutdown.clone());
    for network in &cfg.networks {
        manager.connect(network.clone());
    }

    wait_for_signal().await;
    info!("Shutting down");
    shutdown.cancel();

    for task in subscriptions {
        if let Err(e) = task.await {
            error!(error = %e, "Subscription task failed");
        }
    }
    manager.join().await;
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatcher task failed");
    }
    if let Err(e) = publisher.await {
        error!(error = %e, "Publisher task failed");
    }

    stats.log_summary();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
