//! Route resolution: payload names to a webhook URL, provisioning the
//! destination channel and webhook when no route exists yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::RwLock;

use crate::collector::normalize::NormalizedMessage;
use crate::config::Config;
use crate::errors::MirrorError;
use crate::http::DiscordClient;
use crate::http::webhook::WebhookExecutor;
use crate::model::channel::{Channel, ChannelType, CreateChannel};
use crate::model::ids::{ChannelId, GuildId};
use crate::model::message::CreateMessage;
use crate::store::RoutingStore;
use crate::utils::normalize_name;

/// The webhook every mirrored channel gets.
pub const WEBHOOK_NAME: &str = "1Tap Notify";

/// Retention window padding: age keys outlive the longest window (7 days) by
/// an hour so the sweep always sees them.
const CHANNEL_AGE_TTL_SECS: usize = 7 * 24 * 60 * 60 + 60 * 60;

/// The routing key for a payload: `"{category}-[{server}]/{channel}"`, all
/// parts normalized.
pub fn route_key(category: &str, server: &str, channel: &str) -> String {
    format!(
        "{}-[{}]/{}",
        normalize_name(category),
        normalize_name(server),
        normalize_name(channel),
    )
}

/// The names a destination channel mirroring `channel` from `server` might
/// already carry, normalized. Search order matters: the first pattern is also
/// the name used when creating.
pub fn destination_name_candidates(channel: &str, server: &str) -> Vec<String> {
    let channel = normalize_name(channel);
    let server = normalize_name(server);
    vec![
        format!("{channel}-[{server}]"),
        format!("{channel}-{server}"),
        format!("{channel}_{server}"),
        format!("{server}-{channel}"),
    ]
}

/// The display name for a created destination channel.
pub fn destination_channel_name(channel: &str, server: &str) -> String {
    format!("{} [{}]", normalize_name(channel), normalize_name(server))
}

pub struct Router {
    client: Arc<DiscordClient>,
    store: RoutingStore,
    executor: WebhookExecutor,
    guild: GuildId,
    /// route key -> destination channel id, filled as routes are provisioned
    /// or rediscovered; the archive trigger needs the id, not just the url
    channels: RwLock<HashMap<String, ChannelId>>,
}

impl Router {
    pub fn new(client: Arc<DiscordClient>, store: RoutingStore, guild: GuildId) -> Self {
        Self {
            client,
            store,
            executor: WebhookExecutor::new(),
            guild,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn destination_guild(&self) -> GuildId {
        self.guild
    }

    pub async fn destination_channel(&self, key: &str) -> Option<ChannelId> {
        self.channels.read().await.get(key).copied()
    }

    /// Resolve a payload to a webhook URL, provisioning on miss.
    pub async fn resolve(&self, payload: &NormalizedMessage, config: &Config) -> Result<String, MirrorError> {
        let key = route_key(&payload.category_name, &payload.server_name, &payload.channel_name);
        if let Some(url) = self.store.get_webhook(&key).await {
            return Ok(url);
        }
        // cold start fallback: the config carries the last known map
        if let Some(url) = config.webhooks.get(&key) {
            self.store.put_webhook(&key, url).await?;
            return Ok(url.clone());
        }
        self.provision(&key, payload, config).await
    }

    /// Evict a route everywhere. Returns the destination channel id that was
    /// associated, when known.
    pub async fn evict(&self, key: &str) -> Option<ChannelId> {
        if let Err(e) = self.store.delete_webhook(key).await {
            error!("failed to evict route {key}: {e}");
        }
        self.channels.write().await.remove(key)
    }

    /// Re-resolve after an eviction.
    pub async fn reprovision(&self, payload: &NormalizedMessage, config: &Config) -> Result<String, MirrorError> {
        let key = route_key(&payload.category_name, &payload.server_name, &payload.channel_name);
        self.provision(&key, payload, config).await
    }

    async fn provision(&self, key: &str, payload: &NormalizedMessage, config: &Config) -> Result<String, MirrorError> {
        // forum-mapped categories become threads inside the mapped forum
        let forum_key = format!(
            "{}-[{}]",
            normalize_name(&payload.category_name),
            normalize_name(&payload.server_name),
        );
        if let Some(&forum) = config.forum_mappings.get(&forum_key) {
            return self.provision_forum_thread(key, forum, payload).await;
        }

        let channel = match self.find_existing_channel(payload).await? {
            Some(channel) => channel,
            None => self.create_channel(payload).await?,
        };

        let url = self.get_or_create_webhook(channel.id, WEBHOOK_NAME).await?;
        self.store.put_webhook(key, &url).await?;
        if let Ok(source) = payload.channel_id.parse() {
            let _ = self.store.set_channel_monitoring(channel.id, source).await;
        }
        self.channels.write().await.insert(key.to_string(), channel.id);
        info!("provisioned route {key} -> #{}", channel.name());
        Ok(url)
    }

    async fn provision_forum_thread(
        &self,
        key: &str,
        forum: ChannelId,
        payload: &NormalizedMessage,
    ) -> Result<String, MirrorError> {
        let name = normalize_name(&payload.channel_name);
        let starter = CreateMessage::text(format!(
            "Mirror of #{} from {}",
            payload.channel_real_name, payload.server_real_name,
        ));
        let thread = self.client.start_forum_thread(forum, &name, starter).await
            .map_err(MirrorError::from)?;
        let url = self.get_or_create_webhook(thread.id, WEBHOOK_NAME).await?;
        self.store.put_webhook(key, &url).await?;
        self.channels.write().await.insert(key.to_string(), thread.id);
        info!("provisioned forum thread route {key}");
        Ok(url)
    }

    /// Search the destination guild for a channel already mirroring this
    /// source channel, by any of the historical naming patterns.
    async fn find_existing_channel(&self, payload: &NormalizedMessage) -> Result<Option<Channel>, MirrorError> {
        let candidates = destination_name_candidates(&payload.channel_name, &payload.server_name);
        let channels = self.client.get_guild_channels(self.guild).await.map_err(MirrorError::from)?;
        Ok(channels.into_iter()
            .filter(|c| c.kind == ChannelType::Text)
            .find(|c| candidates.contains(&normalize_name(c.name()))))
    }

    async fn create_channel(&self, payload: &NormalizedMessage) -> Result<Channel, MirrorError> {
        let name = destination_channel_name(&payload.channel_name, &payload.server_name);
        info!("creating destination channel {name}");
        let channel = self.client
            .create_guild_channel(self.guild, CreateChannel::text(name))
            .await
            .map_err(MirrorError::from)?;
        let _ = self.store
            .set_channel_age(channel.id, channel.id.timestamp(), CHANNEL_AGE_TTL_SECS)
            .await;
        Ok(channel)
    }

    /// Reuse the channel's first webhook or create one.
    pub async fn get_or_create_webhook(&self, channel: ChannelId, name: &str) -> Result<String, MirrorError> {
        let webhooks = self.client.get_channel_webhooks(channel).await.map_err(MirrorError::from)?;
        if let Some(url) = webhooks.first().and_then(crate::model::channel::Webhook::execute_url) {
            return Ok(url);
        }
        let webhook = self.client.create_webhook(channel, name).await.map_err(MirrorError::from)?;
        webhook.execute_url()
            .ok_or_else(|| MirrorError::ConfigInvalid("webhook created without token".to_string()))
    }

    /// The periodic liveness sweep: HEAD every stored webhook and evict dead
    /// entries from memory and the store.
    pub async fn sweep_webhooks(&self) {
        let routes = self.store.all_webhooks().await;
        let total = routes.len();
        let mut evicted = 0_usize;
        for (key, url) in routes {
            if !self.executor.is_alive(&url).await {
                warn!("webhook for {key} is dead, evicting");
                self.evict(&key).await;
                evicted += 1;
            }
            // don't hammer the webhook endpoints
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if evicted > 0 {
            info!("webhook sweep: {evicted}/{total} routes evicted");
        } else {
            info!("webhook sweep: all {total} routes alive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_normalizes_every_part() {
        assert_eq!(route_key("INFO", "S1", "general"), "info-[s1]/general");
        assert_eq!(
            route_key("⚡ Drops", "Kith Monitor", "04-17│jordan"),
            "drops-[kith-monitor]/04-17jordan",
        );
    }

    #[test]
    fn key_is_stable_across_recomputation() {
        let first = route_key("Daily Schedule", "s1", "11am restock");
        let second = route_key("Daily Schedule", "s1", "11am restock");
        assert_eq!(first, second);
    }

    #[test]
    fn candidates_cover_all_historical_patterns() {
        let candidates = destination_name_candidates("general", "S1");
        assert_eq!(candidates, vec![
            "general-[s1]".to_string(),
            "general-s1".to_string(),
            "general_s1".to_string(),
            "s1-general".to_string(),
        ]);
        // the created name normalizes to the first candidate
        assert_eq!(normalize_name(&destination_channel_name("general", "S1")), candidates[0]);
    }
}
