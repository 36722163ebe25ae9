//! The republisher process: the destination guild's bot session, the queue
//! consumer, the loopback ingestion endpoint, the layout guardian loops, and
//! the webhook liveness sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;

use mirrorsd::config::ConfigFile;
use mirrorsd::layout;
use mirrorsd::republisher::{self, Republisher};
use mirrorsd::shard::Shard;
use mirrorsd::store::RoutingStore;
use mirrorsd::utils;

const PROCESS_MESSAGE_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 5000);

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::init_logging("republisher").context("log setup failed")?;

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

    let config_file = Arc::new(ConfigFile::new(&config_path));
    let initial = config_file.load().context("cannot start without a valid config")?;
    let destination = initial.destination_server
        .context("config is missing destination_server")?;
    anyhow::ensure!(!initial.bot_token.is_empty(), "config is missing bot_token");

    let store = RoutingStore::connect(&redis_url).await.context("redis connection failed")?;

    let (config_rx, watch_result) = mirrorsd::config::watch_config(Arc::clone(&config_file), initial);
    let _watcher = watch_result.context("config watcher failed to start")?;

    let (shutdown_tx, shutdown_rx) = utils::shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let rep = Republisher::new(config_rx.clone(), Arc::clone(&config_file), store.clone(), destination);
    rep.load_state().await;

    // destination gateway session: control plane + outbound DM relay
    {
        let rep = Arc::clone(&rep);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let client = Arc::clone(&rep.client);
            let mut shard = Shard::new(rep, client, shutdown);
            // the bot session reconnects for as long as the process lives
            let error = shard.run(u32::MAX, RECONNECT_INITIAL, RECONNECT_MAX).await;
            info!("destination session ended: {error}");
        });
    }

    {
        let rep = Arc::clone(&rep);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { rep.run_queue_consumer(shutdown).await });
    }

    tokio::spawn(republisher::serve_process_message(
        Arc::clone(&rep),
        SocketAddr::from(PROCESS_MESSAGE_ADDR),
        shutdown_rx.clone(),
    ));

    tokio::spawn(layout::run_organizer(
        Arc::clone(&rep.client),
        destination,
        shutdown_rx.clone(),
    ));
    tokio::spawn(layout::run_retention(
        Arc::clone(&rep.client),
        store.clone(),
        config_rx.clone(),
        destination,
        shutdown_rx.clone(),
    ));

    {
        let rep = Arc::clone(&rep);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { rep.run_webhook_sweep(shutdown).await });
    }

    let mut shutdown = shutdown_rx;
    let _ = shutdown.changed().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("republisher exiting");
    Ok(())
}
