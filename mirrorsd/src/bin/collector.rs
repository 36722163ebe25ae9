//! The collector pool process: one gateway session per enabled token, the
//! deleted-channel watchers, the DM relay loopback service, and the
//! bot-instance discovery publisher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio::sync::RwLock;

use mirrorsd::collector::{Collector, watcher};
use mirrorsd::config::{Config, ConfigFile};
use mirrorsd::relay;
use mirrorsd::shard::{Shard, ShardError};
use mirrorsd::store::{DM_RELAY_QUEUE, RoutingStore};
use mirrorsd::utils;

/// Sessions identify 5 s apart to avoid a simultaneous identify storm.
const STAGGER: Duration = Duration::from_secs(5);

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

const RELAY_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 5001);

/// How often each collector republishes its discovery record.
const INSTANCE_PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::init_logging("collector").context("log setup failed")?;

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

    let config_file = Arc::new(ConfigFile::new(&config_path));
    let initial = config_file.load().context("cannot start without a valid config")?;

    let store = RoutingStore::connect(&redis_url).await.context("redis connection failed")?;

    let (config_rx, watch_result) = mirrorsd::config::watch_config(Arc::clone(&config_file), initial.clone());
    let _watcher = match watch_result {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("config watcher unavailable, hot reload disabled: {e}");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = utils::shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let collectors: Arc<RwLock<HashMap<String, Arc<Collector>>>> = Arc::default();

    let runnable: Vec<String> = initial.runnable_tokens().map(|(token, _)| token.clone()).collect();
    if runnable.is_empty() {
        anyhow::bail!("no runnable tokens in {config_path}");
    }
    info!("starting {} collector sessions", runnable.len());

    for (index, token) in runnable.into_iter().enumerate() {
        let collector = Arc::new(Collector::new(
            token.clone(),
            config_rx.clone(),
            Arc::clone(&config_file),
            store.clone(),
        ));
        collectors.write().await.insert(token.clone(), Arc::clone(&collector));

        tokio::spawn(watcher::run(Arc::clone(&collector), shutdown_rx.clone()));

        let config_file = Arc::clone(&config_file);
        let config_rx = config_rx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STAGGER * index as u32).await;
            let max_attempts = config_rx.borrow().settings.max_login_attempts;
            let mut shard = Shard::new(Arc::clone(&collector), Arc::clone(&collector.client), shutdown);
            match shard.run(max_attempts, RECONNECT_INITIAL, RECONNECT_MAX).await {
                ShardError::AuthInvalid => {
                    error!("token {}... is invalid, marking failed", head(&token));
                    config_file.mark_token_failed(&token, "authentication failed").await;
                }
                ShardError::Shutdown => info!("session {}... shut down", head(&token)),
                other => {
                    error!("session {}... gave up: {other}", head(&token));
                    config_file.mark_token_failed(&token, &format!("max attempts reached: {other}")).await;
                }
            }
        });
    }

    // the loopback service the republisher relays outbound DMs through
    tokio::spawn(relay::serve_relay(
        Arc::clone(&collectors),
        SocketAddr::from(RELAY_ADDR),
        shutdown_rx.clone(),
    ));

    tokio::spawn(publish_instances(Arc::clone(&collectors), store.clone(), shutdown_rx.clone()));
    tokio::spawn(drain_relay_queue(Arc::clone(&collectors), store.clone(), config_rx.clone(), shutdown_rx.clone()));

    let mut shutdown = shutdown_rx;
    let _ = shutdown.changed().await;
    // let sessions close their websockets
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("collector pool exiting");
    Ok(())
}

fn head(token: &str) -> String {
    token.chars().take(10).collect()
}

/// Publish every ready session's discovery record on an interval.
async fn publish_instances(
    collectors: Arc<RwLock<HashMap<String, Arc<Collector>>>>,
    store: RoutingStore,
    shutdown: utils::ShutdownRx,
) {
    // give sessions a moment to identify first
    tokio::time::sleep(Duration::from_secs(60)).await;
    while !*shutdown.borrow() {
        let mut instances = HashMap::new();
        for (token, collector) in collectors.read().await.iter() {
            if let Some(info) = collector.instance_info().await {
                instances.insert(token.clone(), info);
            }
        }
        if let Err(e) = store.publish_bot_instances(&instances).await {
            error!("failed to publish bot instances: {e}");
        }
        tokio::time::sleep(INSTANCE_PUBLISH_INTERVAL).await;
    }
}

/// Secondary DM-relay path: requests pushed onto the store's list instead of
/// the HTTP service.
async fn drain_relay_queue(
    collectors: Arc<RwLock<HashMap<String, Arc<Collector>>>>,
    store: RoutingStore,
    config: tokio::sync::watch::Receiver<Arc<Config>>,
    shutdown: utils::ShutdownRx,
) {
    while !*shutdown.borrow() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let raw = match store.pop_queue(DM_RELAY_QUEUE).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                error!("dm relay queue pop failed: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        let Ok(request) = serde_json::from_str::<serde_json::Value>(&raw) else {
            error!("invalid json in dm relay queue");
            continue;
        };
        let token = request.get("token").and_then(|t| t.as_str()).unwrap_or_default().to_string();
        let user_id = request.get("user_id").and_then(|u| u.as_str()).and_then(|u| u.parse().ok());
        let mut content = request.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
        if let Some(urls) = request.get("attachments").and_then(|a| a.as_array()) {
            for url in urls.iter().filter_map(|u| u.as_str()) {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(url);
            }
        }

        // fall back to any session the config maps to this peer
        let token = if token.is_empty() {
            user_id.and_then(|id| config.borrow().find_token_for_user(id).map(str::to_string))
                .unwrap_or_default()
        } else {
            token
        };

        let collector = collectors.read().await.get(&token).cloned();
        match (collector, user_id) {
            (Some(collector), Some(user_id)) => {
                if let Err(e) = collector.send_dm(user_id, &content).await {
                    error!("queued dm relay to {user_id} failed: {e}");
                }
            }
            _ => error!("dm relay request without a usable token/user"),
        }
    }
}
