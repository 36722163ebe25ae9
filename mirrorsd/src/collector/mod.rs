//! The collector: one user-session gateway client per enabled token.
//!
//! Each session observes every MESSAGE_CREATE in its monitored guilds, runs
//! the ordered eligibility filter, normalizes what passes, and enqueues the
//! result twice: LPUSH onto the durable queue, then a POST to the
//! republisher's loopback endpoint. The republisher dedups by message id, so
//! the double path only narrows the window in which losing one transport
//! loses messages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, watch};

use crate::config::{Config, ConfigFile};
use crate::errors::MirrorError;
use crate::http::DiscordClient;
use crate::model::channel::Channel;
use crate::model::guild::Guild;
use crate::model::ids::*;
use crate::model::message::{Embed, Message};
use crate::model::user::User;
use crate::shard::GatewayHandler;
use crate::shard::dispatch::Ready;
use crate::shard::model::Identify;
use crate::store::{BotInstance, RoutingStore};
use crate::utils::{BoundedSet, normalize_username};

pub mod filters;
pub mod normalize;
pub mod watcher;

use normalize::NormalizedMessage;

/// Bound on the in-process set of recently seen message ids.
const DEDUP_CAPACITY: usize = 1000;

/// Small delay before reading a message, letting Discord register
/// late-arriving attachment metadata.
const ATTACHMENT_SETTLE: Duration = Duration::from_millis(500);

/// Where the republisher listens for the HTTP side of the dual enqueue.
pub const PROCESS_MESSAGE_URL: &str = "http://127.0.0.1:5000/process_message";

static CHANNEL_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<#(\d+)>").unwrap());

/// What a collector keeps per guild: enough to name things, resolve channel
/// mentions, and answer the DM filter's mutual-guild questions.
#[derive(Debug, Default, Clone)]
struct CachedGuild {
    name: String,
    channels: HashMap<ChannelId, Channel>,
    roles: HashMap<RoleId, String>,
    members: HashSet<UserId>,
}

pub struct Collector {
    token: String,
    pub client: Arc<DiscordClient>,
    config: watch::Receiver<Arc<Config>>,
    config_file: Arc<ConfigFile>,
    store: RoutingStore,
    egress: reqwest::Client,
    user: RwLock<Option<User>>,
    guilds: RwLock<HashMap<GuildId, CachedGuild>>,
    seen: Mutex<BoundedSet<MessageId>>,
    egress_outage_logged: AtomicBool,
}

impl Collector {
    pub fn new(
        token: String,
        config: watch::Receiver<Arc<Config>>,
        config_file: Arc<ConfigFile>,
        store: RoutingStore,
    ) -> Self {
        let client = Arc::new(DiscordClient::user(token.clone()));
        let egress = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Unable to build client!");
        Self {
            token,
            client,
            config,
            config_file,
            store,
            egress,
            user: RwLock::new(None),
            guilds: RwLock::new(HashMap::new()),
            seen: Mutex::new(BoundedSet::new(DEDUP_CAPACITY)),
            egress_outage_logged: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn snapshot(&self) -> Arc<Config> {
        self.config.borrow().clone()
    }

    pub async fn own_user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    /// The discovery record published to the store every 30 s, once the
    /// session is ready.
    pub async fn instance_info(&self) -> Option<BotInstance> {
        let user = self.own_user().await?;
        let guilds = self.guilds.read().await.keys().map(ToString::to_string).collect();
        Some(BotInstance {
            user_id: user.id,
            username: user.tag(),
            guilds,
        })
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        self.guilds.read().await.keys().copied().collect()
    }

    /// Send a DM from this session to `user_id`. The relay service calls this
    /// for outbound channel->peer traffic.
    pub async fn send_dm(&self, user_id: UserId, content: &str) -> Result<(), MirrorError> {
        let dm = self.client.create_dm(user_id).await.map_err(MirrorError::from)?;
        self.client.create_message(dm.id, crate::model::message::CreateMessage::text(content))
            .await
            .map_err(MirrorError::from)?;
        info!("sent DM to {user_id}");
        Ok(())
    }

    async fn category_of(&self, guild: GuildId, channel: &Channel) -> (Option<ChannelId>, String) {
        let Some(parent) = channel.parent_id else {
            return (None, "uncategorized".to_string());
        };
        let guilds = self.guilds.read().await;
        let name = guilds.get(&guild)
            .and_then(|g| g.channels.get(&parent))
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "uncategorized".to_string());
        (Some(parent), name)
    }

    /// How many cached guilds contain `peer`, and whether any of them is
    /// currently monitored.
    async fn mutual_guilds(&self, peer: UserId) -> (usize, bool) {
        let monitored = self.snapshot().monitored_server_ids();
        let guilds = self.guilds.read().await;
        let mut count = 0;
        let mut shares_monitored = false;
        for (id, guild) in guilds.iter() {
            if guild.members.contains(&peer) {
                count += 1;
                if monitored.contains(id) {
                    shares_monitored = true;
                }
            }
        }
        (count, shares_monitored)
    }

    /// POST a payload to the republisher's loopback endpoint. Refused
    /// connections retry forever at 10 s intervals and log once per outage.
    pub async fn send_to_destination(&self, payload: &serde_json::Value) {
        loop {
            match self.egress.post(PROCESS_MESSAGE_URL).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    if self.egress_outage_logged.swap(false, Ordering::Relaxed) {
                        info!("destination endpoint reachable again");
                    }
                    return;
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    error!("destination endpoint rejected message ({status}): {text}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) if e.is_connect() => {
                    if !self.egress_outage_logged.swap(true, Ordering::Relaxed) {
                        warn!("destination endpoint unreachable, retrying silently: {e}");
                    }
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Err(e) => {
                    error!("unexpected egress error: {e}");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    }

    async fn enqueue(&self, payload: &NormalizedMessage) {
        let queue = self.snapshot().settings.queue_name.clone();
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!("payload serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = self.store.push_queue(&queue, &json).await {
            error!("failed to push message {} to the queue: {e}", payload.message_id);
        } else {
            info!("queued message {} from {}#{}", payload.message_id, payload.server_name, payload.channel_name);
        }
        // second path, deduplicated on the other end by message id
        if let Ok(value) = serde_json::to_value(payload) {
            self.send_to_destination(&value).await;
        }
    }

    async fn handle_guild_message(&self, message: Message, guild_id: GuildId) -> Result<(), MirrorError> {
        let config = self.snapshot();

        // 1. the guild has to be monitored by this token
        let Some(server) = config.server_config(guild_id) else { return Ok(()) };

        let (channel, guild_name) = {
            let guilds = self.guilds.read().await;
            let Some(cached) = guilds.get(&guild_id) else { return Ok(()) };
            let Some(channel) = cached.channels.get(&message.channel_id).cloned() else {
                return Ok(());
            };
            (channel, cached.name.clone())
        };

        // 2. excluded category, 3. excluded channel
        let (category_id, category_name) = self.category_of(guild_id, &channel).await;
        if let Some(category_id) = category_id {
            if server.excluded_categories.contains(&category_id) {
                return Ok(());
            }
        }
        if server.excluded_channels.contains(&message.channel_id) {
            return Ok(());
        }

        // 4. automated bot reposts
        if filters::is_automated_repost(message.author.is_bot(), &message.content, message.attachments.len()) {
            return Ok(());
        }

        // 5. own messages
        if let Some(user) = self.own_user().await {
            if message.author.id == user.id {
                return Ok(());
            }
        }

        info!("accepted message {} from {guild_name} #{}", message.id, channel.name());

        let payload = self.normalize_guild_message(&message, guild_id, &guild_name, &channel, &category_name).await;
        self.enqueue(&payload).await;
        Ok(())
    }

    async fn normalize_guild_message(
        &self,
        message: &Message,
        guild_id: GuildId,
        guild_name: &str,
        channel: &Channel,
        category_name: &str,
    ) -> NormalizedMessage {
        let guilds = self.guilds.read().await;
        let cached = guilds.get(&guild_id);

        let mentioned_roles: BTreeMap<String, String> = message.mention_roles.iter()
            .filter_map(|role| {
                cached.and_then(|g| g.roles.get(role))
                    .map(|name| (role.to_string(), name.clone()))
            })
            .collect();

        let mentioned_channels: BTreeMap<String, String> = CHANNEL_MENTION
            .captures_iter(&message.content)
            .filter_map(|captures| {
                let id: ChannelId = captures[1].parse().ok()?;
                let name = cached?.channels.get(&id)?.name().to_string();
                Some((id.to_string(), name))
            })
            .collect();
        drop(guilds);

        let reply = normalize::detect_reply(message);
        let forward = normalize::detect_forward(message);
        let is_forwarded = forward.is_some();
        let embeds = normalize::payload_embeds(message, forward.as_ref());
        let author_name = normalize::display_name(
            &message.author,
            message.member.as_ref().and_then(|m| m.nick.as_deref()),
        );

        NormalizedMessage {
            message_type: "regular".to_string(),
            message_id: message.id.to_string(),
            channel_id: message.channel_id.to_string(),
            channel_name: channel.name().to_string(),
            category_name: category_name.to_string(),
            server_id: guild_id.to_string(),
            server_name: guild_name.to_string(),
            content: message.content.clone(),
            author_id: message.author.id.to_string(),
            author_name,
            author_avatar: message.author.avatar_url(),
            timestamp: message.timestamp.to_rfc3339(),
            attachments: message.attachments.iter().map(|a| a.url.clone()).collect(),
            embeds,
            mentioned_roles,
            mentioned_channels,
            reply_to: reply.as_ref().map(|(to, _)| to.clone()),
            reply_text: reply.map(|(_, text)| text),
            forwarded_from: forward.as_ref().map(|f| f.from.clone()),
            forwarded_attachments: forward.map(|f| f.attachments).unwrap_or_default(),
            is_forwarded,
            channel_real_name: channel.name().to_string(),
            server_real_name: guild_name.to_string(),
            ..NormalizedMessage::default()
        }
    }

    async fn handle_dm(&self, message: Message) -> Result<(), MirrorError> {
        let config = self.snapshot();
        let Some(token_config) = config.tokens.get(&self.token) else { return Ok(()) };
        if !token_config.dm_mirroring.enabled {
            return Ok(());
        }

        let Some(user) = self.own_user().await else { return Ok(()) };
        if message.author.id == user.id {
            return Ok(());
        }

        let author_name = normalize::display_name(&message.author, None);
        if message.author.is_bot() {
            if !filters::is_allowed_bot(&author_name) {
                info!("blocked DM from unauthorized bot {author_name}");
                return Ok(());
            }
        } else {
            let (mutuals, shares_monitored) = self.mutual_guilds(message.author.id).await;
            if !filters::should_allow_dm(&message.content, mutuals, shares_monitored) {
                info!("blocked DM from {author_name}: {}",
                      message.content.chars().take(50).collect::<String>());
                return Ok(());
            }
        }

        let Some(destination) = token_config.dm_mirroring.destination_server_id else {
            warn!("DM mirroring enabled but no destination server configured");
            return Ok(());
        };

        let self_name = normalize::display_name(&user, None);
        let channel_name = format!("dm-{}", normalize_username(&author_name));
        let server_name = format!("@{self_name} [DM]");

        let embeds = if message.embeds.is_empty() {
            match message.attachments.first() {
                // a bare attachment still shows up as something
                Some(first) if message.content.trim().is_empty() => vec![Embed::image_only(&first.url)],
                _ => Vec::new(),
            }
        } else {
            message.embeds.clone()
        };

        let payload = NormalizedMessage {
            message_type: "dm".to_string(),
            message_id: message.id.to_string(),
            channel_id: message.channel_id.to_string(),
            channel_name: channel_name.clone(),
            category_name: server_name.clone(),
            server_id: "dm".to_string(),
            server_name: server_name.clone(),
            content: message.content.clone(),
            author_id: message.author.id.to_string(),
            author_name: author_name.clone(),
            author_avatar: message.author.avatar_url(),
            timestamp: message.timestamp.to_rfc3339(),
            attachments: message.attachments.iter().map(|a| a.url.clone()).collect(),
            embeds,
            channel_real_name: channel_name,
            server_real_name: server_name,
            destination_server_id: Some(destination.to_string()),
            dm_user_id: Some(message.author.id.to_string()),
            dm_username: Some(author_name),
            self_user_id: Some(user.id.to_string()),
            self_username: Some(self_name),
            receiving_token: Some(self.token.clone()),
            sender_user_id: Some(message.author.id.to_string()),
            is_bot: Some(message.author.is_bot()),
            bot_name: message.author.is_bot().then(|| message.author.tag()),
            ..NormalizedMessage::default()
        };
        self.enqueue(&payload).await;
        Ok(())
    }

    /// Notify the republisher that a watched source channel disappeared.
    pub async fn send_channel_delete(&self, server_real_name: &str, channel_real_name: &str) {
        let payload = json!({
            "action": "delete_channel",
            "server_real_name": server_real_name,
            "channel_real_name": channel_real_name,
        });
        self.send_to_destination(&payload).await;
    }
}

#[async_trait]
impl GatewayHandler for Collector {
    fn identify(&self) -> Identify {
        Identify::user(self.token.clone())
    }

    async fn ready(&self, ready: Ready) -> Result<(), MirrorError> {
        info!("collector session ready as {}", ready.user.tag());
        let user = ready.user.clone();
        *self.user.write().await = Some(user.clone());
        for guild in ready.guilds {
            if !guild.unavailable {
                self.guild_create(guild).await?;
            }
        }
        // remember who this token belongs to
        let result = self.config_file.update(|config| {
            if let Some(data) = config.tokens.get_mut(&self.token) {
                data.user_info = Some(crate::config::UserInfo {
                    id: user.id,
                    name: user.tag(),
                    last_successful_login: Some(Utc::now()),
                });
                data.status = "active".to_string();
            }
        }).await;
        if let Err(e) = result {
            warn!("could not persist user info: {e}");
        }
        Ok(())
    }

    async fn guild_create(&self, guild: Guild) -> Result<(), MirrorError> {
        let mut cached = CachedGuild {
            name: guild.name(),
            ..CachedGuild::default()
        };
        for channel in guild.channels {
            cached.channels.insert(channel.id, channel);
        }
        for role in guild.roles {
            cached.roles.insert(role.id, role.name);
        }
        for member in guild.members {
            if let Some(user) = member.user {
                cached.members.insert(user.id);
            }
        }
        self.guilds.write().await.insert(guild.id, cached);
        Ok(())
    }

    async fn channel_create(&self, channel: Channel) -> Result<(), MirrorError> {
        if let Some(guild_id) = channel.guild_id {
            if let Some(cached) = self.guilds.write().await.get_mut(&guild_id) {
                cached.channels.insert(channel.id, channel);
            }
        }
        Ok(())
    }

    async fn channel_delete(&self, channel: Channel) -> Result<(), MirrorError> {
        if let Some(guild_id) = channel.guild_id {
            if let Some(cached) = self.guilds.write().await.get_mut(&guild_id) {
                cached.channels.remove(&channel.id);
            }
        }
        Ok(())
    }

    async fn message_create(&self, message: Message) -> Result<(), MirrorError> {
        tokio::time::sleep(ATTACHMENT_SETTLE).await;

        if !self.seen.lock().await.insert(message.id) {
            return Ok(());
        }

        match message.guild_id {
            Some(guild_id) => self.handle_guild_message(message, guild_id).await,
            // no guild id and kind Dm-adjacent: a direct message
            None => self.handle_dm(message).await,
        }
    }

    async fn on_error(&self, error: MirrorError) {
        error!("collector event error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ring_suppresses_and_evicts() {
        let mut ring = BoundedSet::new(DEDUP_CAPACITY);
        assert!(ring.insert(MessageId(1)));
        assert!(!ring.insert(MessageId(1)));
        for i in 2..=(DEDUP_CAPACITY as u64 + 1) {
            assert!(ring.insert(MessageId(i)));
        }
        // id 1 was evicted by the 1001st distinct insert
        assert!(ring.insert(MessageId(1)));
        assert!(ring.len() <= DEDUP_CAPACITY);
    }

    #[test]
    fn channel_mention_regex() {
        let captures: Vec<_> = CHANNEL_MENTION.captures_iter("see <#123> and <#456>")
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(captures, vec!["123", "456"]);
    }
}
