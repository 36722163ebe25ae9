//! The republisher: the single bot-session process that owns the destination
//! guild.
//!
//! It drains the durable queue, resolves every payload to a webhook route
//! (provisioning channels and webhooks on demand), renders the message
//! faithfully, and executes the webhook. It also runs the destination-side
//! gateway session that feeds the control plane and the outbound DM relay.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router as AxumRouter, routing::post};
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;

use crate::collector::normalize::NormalizedMessage;
use crate::config::{Config, ConfigFile};
use crate::control;
use crate::errors::MirrorError;
use crate::http::DiscordClient;
use crate::http::webhook::{ExecuteOutcome, WebhookExecutor, WebhookFile, WebhookPayload};
use crate::model::channel::Channel;
use crate::model::guild::Guild;
use crate::model::ids::*;
use crate::model::message::{Embed, Message};
use crate::relay;
use crate::shard::GatewayHandler;
use crate::shard::dispatch::Ready;
use crate::shard::intents::Intents;
use crate::shard::model::Identify;
use crate::store::RoutingStore;
use crate::utils::{BoundedSet, ShutdownRx};

pub mod attachments;
pub mod render;
pub mod router;

use attachments::{AttachmentFetcher, FetchedAttachment};
use render::MentionContext;
use router::Router;

const DEDUP_CAPACITY: usize = 1000;

/// Batch size between "processed N messages" log lines.
const BATCH_LOG_EVERY: u64 = 50;

pub struct Republisher {
    pub client: Arc<DiscordClient>,
    pub store: RoutingStore,
    pub config: watch::Receiver<Arc<Config>>,
    pub config_file: Arc<ConfigFile>,
    pub router: Router,
    executor: WebhookExecutor,
    fetcher: AttachmentFetcher,
    seen: Mutex<BoundedSet<String>>,
    /// source channel ids silenced by an archive trigger
    suppressed_sources: Mutex<HashSet<String>>,
    /// destination channels deleted by archive triggers
    polar_deleted_channels: Mutex<HashSet<ChannelId>>,
    /// source channel id -> destination channel id, for mention rewriting
    source_to_dest: RwLock<HashMap<ChannelId, ChannelId>>,
    /// destination guild state fed by the gateway session
    destination_channels: RwLock<HashMap<ChannelId, Channel>>,
    destination_roles: RwLock<HashMap<String, RoleId>>,
    processed: AtomicU64,
    pub started_at: Instant,
}

impl Republisher {
    pub fn new(
        config: watch::Receiver<Arc<Config>>,
        config_file: Arc<ConfigFile>,
        store: RoutingStore,
        destination: GuildId,
    ) -> Arc<Self> {
        let bot_token = config.borrow().bot_token.clone();
        let client = Arc::new(DiscordClient::bot(bot_token));
        let router = Router::new(Arc::clone(&client), store.clone(), destination);
        Arc::new(Self {
            client,
            store,
            config,
            config_file,
            router,
            executor: WebhookExecutor::new(),
            fetcher: AttachmentFetcher::new(),
            seen: Mutex::new(BoundedSet::new(DEDUP_CAPACITY)),
            suppressed_sources: Mutex::new(HashSet::new()),
            polar_deleted_channels: Mutex::new(HashSet::new()),
            source_to_dest: RwLock::new(HashMap::new()),
            destination_channels: RwLock::new(HashMap::new()),
            destination_roles: RwLock::new(HashMap::new()),
            processed: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.config.borrow().clone()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub async fn destination_channel_info(&self, id: ChannelId) -> Option<Channel> {
        self.destination_channels.read().await.get(&id).cloned()
    }

    /// Prime caches that survive in the store across restarts.
    pub async fn load_state(&self) {
        match self.store.load_webhooks().await {
            Ok(count) => info!("loaded {count} webhook routes from the store"),
            Err(e) => warn!("could not load webhook routes: {e}"),
        }
        match self.store.channel_monitoring().await {
            Ok(map) => {
                let mut inverted = HashMap::new();
                for (dest, source) in map {
                    if let (Ok(dest), Ok(source)) = (dest.parse(), source.parse()) {
                        inverted.insert(source, dest);
                    }
                }
                *self.source_to_dest.write().await = inverted;
            }
            Err(e) => warn!("could not load channel monitoring map: {e}"),
        }
    }

    /// The queue consumer. Single consumer, RPOP with a configurable delay
    /// between polls; runs until shutdown.
    pub async fn run_queue_consumer(self: &Arc<Self>, shutdown: ShutdownRx) {
        info!("queue consumer started");
        while !*shutdown.borrow() {
            let config = self.snapshot();
            let delay = Duration::from_secs_f64(config.settings.message_delay.max(0.1));
            tokio::time::sleep(delay).await;

            let raw = match self.store.pop_queue(&config.settings.queue_name).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!("queue pop failed: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            self.ingest_raw(&raw).await;
        }
        info!("queue consumer stopped");
    }

    /// Parse and process one raw queue entry. Non-object payloads are logged
    /// and skipped.
    pub async fn ingest_raw(&self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                error!("queue entry is not json, skipping: {e}");
                return;
            }
        };
        if !value.is_object() {
            error!("queue entry is not an object, skipping");
            return;
        }
        self.ingest_value(value).await;
    }

    /// Process an already-parsed payload object (the HTTP endpoint lands
    /// here too).
    pub async fn ingest_value(&self, value: serde_json::Value) {
        if value.get("action").and_then(|a| a.as_str()) == Some("delete_channel") {
            let server = value.get("server_real_name").and_then(|v| v.as_str()).unwrap_or_default();
            let channel = value.get("channel_real_name").and_then(|v| v.as_str()).unwrap_or_default();
            self.handle_source_channel_deleted(server, channel).await;
            return;
        }

        let payload: NormalizedMessage = match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                error!("malformed message payload, skipping: {e}");
                return;
            }
        };

        if !self.seen.lock().await.insert(payload.message_id.clone()) {
            return;
        }

        if let Err(e) = self.process_message(&payload).await {
            if e.is_per_message() {
                warn!("dropped message {}: {e}", payload.message_id);
            } else {
                error!("failed to process message {}: {e}", payload.message_id);
            }
        }

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % BATCH_LOG_EVERY == 0 {
            info!("processed {processed} messages");
        }
    }

    async fn process_message(&self, payload: &NormalizedMessage) -> Result<(), MirrorError> {
        if payload.is_dm() {
            return relay::handle_inbound_dm(self, payload).await;
        }

        if self.suppressed_sources.lock().await.contains(&payload.channel_id) {
            return Ok(());
        }

        if render::is_archive_trigger(payload) {
            self.handle_archive_trigger(payload).await;
            return Ok(());
        }

        let config = self.snapshot();
        let mut url = self.router.resolve(payload, &config).await?;
        let key = router::route_key(&payload.category_name, &payload.server_name, &payload.channel_name);

        let (mut parts, embeds, files) = self.render(payload).await;
        if parts.is_empty() && embeds.is_empty() && files.is_empty() {
            return Ok(());
        }
        if parts.is_empty() {
            parts.push(String::new());
        }

        // one reprovision is allowed per message; a second dead webhook drops it
        let mut may_reprovision = true;
        let total = parts.len();
        let mut i = 0;
        while i < total {
            let part = &parts[i];
            let execution = WebhookPayload {
                username: payload.author_name.clone(),
                avatar_url: payload.author_avatar.clone(),
                content: if part.is_empty() { None } else { Some(part.clone()) },
                embeds: if i == 0 { embeds.clone() } else { Vec::new() },
            };
            let part_files = if i == 0 { files.as_slice() } else { &[] };

            match self.executor.execute(&url, &execution, part_files).await {
                ExecuteOutcome::Success => {}
                ExecuteOutcome::UnknownWebhook => {
                    self.router.evict(&key).await;
                    if !may_reprovision {
                        return Err(MirrorError::WebhookUnknown);
                    }
                    may_reprovision = false;
                    info!("webhook for {key} vanished, reprovisioning");
                    url = self.router.reprovision(payload, &config).await?;
                    // replay the whole message against the fresh route
                    i = 0;
                    continue;
                }
                ExecuteOutcome::UnknownChannel => {
                    self.router.evict(&key).await;
                    return Err(MirrorError::ChannelUnknown);
                }
                ExecuteOutcome::PayloadTooLarge => return Err(MirrorError::PayloadTooLarge),
                ExecuteOutcome::RoleCeiling => {
                    return Err(MirrorError::BadRequest { code: crate::model::DiscordError::MAX_GUILD_ROLES });
                }
                ExecuteOutcome::ContentTooLong => {
                    // over the limit despite splitting: truncate this part and go on
                    let truncated: String = part.chars().take(1900).collect();
                    let retry = WebhookPayload {
                        content: Some(truncated),
                        embeds: Vec::new(),
                        ..execution
                    };
                    if self.executor.execute(&url, &retry, &[]).await != ExecuteOutcome::Success {
                        warn!("part {}/{} of {} dropped after truncation", i + 1, total, payload.message_id);
                    }
                }
                ExecuteOutcome::Failed => {
                    warn!("part {}/{} of message {} failed, not re-enqueuing", i + 1, total, payload.message_id);
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Content parts, cleaned embeds, and downloaded files for a payload.
    async fn render(&self, payload: &NormalizedMessage) -> (Vec<String>, Vec<Embed>, Vec<WebhookFile>) {
        let channel_map = self.source_to_dest.read().await.clone();
        let roles_by_name = self.destination_roles.read().await.clone();
        let ctx = MentionContext { channel_map: &channel_map, roles_by_name: &roles_by_name };

        let mut content = render::render_content(payload, &ctx);

        let embeds: Vec<Embed> = payload.embeds.iter().map(|embed| {
            let mut embed = embed.clone();
            if let Some(description) = &embed.description {
                embed.description = Some(render::rewrite_embed_mentions(description, payload, &ctx));
            }
            embed
        }).collect();

        let mut files = Vec::new();
        let urls = payload.attachments.iter().chain(&payload.forwarded_attachments);
        for url in urls {
            match self.fetcher.fetch(url).await {
                FetchedAttachment::File(file) => files.push(file),
                FetchedAttachment::TooLarge(url) => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&format!("📎 **Large file:** {url}"));
                }
            }
        }

        (render::split_content(&content), embeds, files)
    }

    /// An archive trigger deletes the destination channel instead of
    /// mirroring the message.
    async fn handle_archive_trigger(&self, payload: &NormalizedMessage) {
        let key = router::route_key(&payload.category_name, &payload.server_name, &payload.channel_name);
        info!("archive trigger for {key}");

        let destination = match self.router.destination_channel(&key).await {
            Some(id) => Some(id),
            None => self.find_destination_by_name(&payload.channel_name, &payload.server_name).await,
        };

        if let Some(id) = destination {
            if self.polar_deleted_channels.lock().await.contains(&id) {
                info!("destination channel {id} already archived");
            } else {
                match self.client.delete_channel(id).await {
                    Ok(()) => {
                        info!("archived destination channel {id}");
                        self.polar_deleted_channels.lock().await.insert(id);
                        let _ = self.store.delete_channel_age(id).await;
                    }
                    Err(e) => error!("failed to delete archived channel {id}: {e}"),
                }
            }
        }
        self.router.evict(&key).await;
        self.suppressed_sources.lock().await.insert(payload.channel_id.clone());
    }

    /// A watched source channel disappeared; drop its mirror.
    async fn handle_source_channel_deleted(&self, server_real_name: &str, channel_real_name: &str) {
        info!("source channel #{channel_real_name} in {server_real_name} was deleted");
        if let Some(id) = self.find_destination_by_name(channel_real_name, server_real_name).await {
            let config = self.snapshot();
            if config.is_protected(id) {
                info!("destination channel {id} is protected, keeping it");
                return;
            }
            match self.client.delete_channel(id).await {
                Ok(()) => {
                    info!("deleted mirrored channel {id}");
                    let _ = self.store.delete_channel_age(id).await;
                }
                Err(e) => error!("failed to delete mirrored channel {id}: {e}"),
            }
        }
    }

    async fn find_destination_by_name(&self, channel: &str, server: &str) -> Option<ChannelId> {
        let candidates = router::destination_name_candidates(channel, server);
        let channels = self.destination_channels.read().await;
        channels.values()
            .find(|c| candidates.contains(&crate::utils::normalize_name(c.name())))
            .map(|c| c.id)
    }

    /// The 30-minute webhook liveness sweep.
    pub async fn run_webhook_sweep(self: &Arc<Self>, shutdown: ShutdownRx) {
        const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
        while !*shutdown.borrow() {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if *shutdown.borrow() {
                break;
            }
            self.router.sweep_webhooks().await;
        }
    }
}

#[async_trait]
impl GatewayHandler for Republisher {
    fn identify(&self) -> Identify {
        Identify::bot(self.snapshot().bot_token.clone(), Intents::republisher())
    }

    async fn ready(&self, ready: Ready) -> Result<(), MirrorError> {
        info!("republisher session ready as {}", ready.user.tag());
        match self.client.get_guild_roles(self.router.destination_guild()).await {
            Ok(roles) => {
                let map = roles.into_iter()
                    .map(|role| (role.name.to_lowercase(), role.id))
                    .collect();
                *self.destination_roles.write().await = map;
            }
            Err(e) => warn!("could not load destination roles: {e}"),
        }
        Ok(())
    }

    async fn guild_create(&self, guild: Guild) -> Result<(), MirrorError> {
        if guild.id != self.router.destination_guild() {
            return Ok(());
        }
        let mut channels = self.destination_channels.write().await;
        for channel in guild.channels {
            channels.insert(channel.id, channel);
        }
        let mut roles = self.destination_roles.write().await;
        for role in guild.roles {
            roles.insert(role.name.to_lowercase(), role.id);
        }
        Ok(())
    }

    async fn channel_create(&self, channel: Channel) -> Result<(), MirrorError> {
        if channel.guild_id == Some(self.router.destination_guild()) {
            self.destination_channels.write().await.insert(channel.id, channel);
        }
        Ok(())
    }

    async fn channel_delete(&self, channel: Channel) -> Result<(), MirrorError> {
        if channel.guild_id == Some(self.router.destination_guild()) {
            self.destination_channels.write().await.remove(&channel.id);
        }
        Ok(())
    }

    /// Destination-guild traffic: operator commands and outbound DM relay.
    async fn message_create(&self, message: Message) -> Result<(), MirrorError> {
        // webhook executions are our own mirrors
        if message.webhook_id.is_some() || message.author.is_bot() {
            return Ok(());
        }
        if message.guild_id != Some(self.router.destination_guild()) {
            return Ok(());
        }

        if control::dispatch(self, &message).await? {
            return Ok(());
        }

        let config = self.snapshot();
        if let Some(route) = config.dm_mappings.get(&message.channel_id.to_string()).cloned() {
            relay::relay_outbound(self, &message, &route).await;
        }
        Ok(())
    }
}

/// The loopback ingestion endpoint (`POST /process_message`). Enqueues into
/// the durable queue so the consumer remains the single processing path.
pub async fn serve_process_message(rep: Arc<Republisher>, addr: SocketAddr, mut shutdown: ShutdownRx) {
    let app = AxumRouter::new()
        .route("/process_message", post(process_message_handler))
        .with_state(rep);
    info!("process_message endpoint listening on {addr}");
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
    if let Err(e) = server.await {
        error!("process_message server error: {e}");
    }
}

async fn process_message_handler(
    axum::extract::State(rep): axum::extract::State<Arc<Republisher>>,
    Json(value): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    if !value.is_object() {
        return Json(json!({"status": "error", "message": "payload must be a json object"}));
    }
    // actions skip the queue; messages ride it so ordering/dedup stay in one place
    if value.get("action").is_some() {
        rep.ingest_value(value).await;
        return Json(json!({"status": "success", "message": "action processed"}));
    }
    let queue = rep.snapshot().settings.queue_name.clone();
    match serde_json::to_string(&value) {
        Ok(raw) => match rep.store.push_queue(&queue, &raw).await {
            Ok(()) => Json(json!({"status": "success", "message": "queued"})),
            Err(e) => Json(json!({"status": "error", "message": e.to_string()})),
        },
        Err(e) => Json(json!({"status": "error", "message": e.to_string()})),
    }
}
