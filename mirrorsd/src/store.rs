//! The routing store: the durable key–value half of the pipeline.
//!
//! Backed by redis and mirrored in memory where it matters (the webhook map is
//! read on every routed message). Consistency is eventual and every key may
//! disappear at any time; consumers treat misses as "not yet provisioned".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::DmRoute;
use crate::errors::MirrorError;
use crate::model::ids::{ChannelId, UserId};

const WEBHOOKS_KEY: &str = "webhooks";
const DM_ROUTES_KEY: &str = "dm_routes";
const CHANNEL_MONITORING_KEY: &str = "channel_monitoring";
const RECENT_MESSAGES_KEY: &str = "recent_messages";
const BOT_INSTANCES_KEY: &str = "bot_instances";
pub const DM_RELAY_QUEUE: &str = "dm_relay_queue";

/// Four hours, matching the dedup set's advertised expiry.
const RECENT_MESSAGES_TTL_SECS: usize = 4 * 60 * 60;

pub type StoreResult<T> = Result<T, MirrorError>;

/// What each collector publishes about itself for discovery.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BotInstance {
    pub user_id: UserId,
    pub username: String,
    pub guilds: Vec<String>,
}

#[derive(Clone)]
pub struct RoutingStore {
    conn: ConnectionManager,
    /// in-memory mirror of the webhook hash; read first, store consulted on
    /// miss
    webhooks: Arc<RwLock<HashMap<String, String>>>,
}

impl RoutingStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(MirrorError::Store)?;
        let conn = client.get_connection_manager().await.map_err(MirrorError::Store)?;
        Ok(Self { conn, webhooks: Arc::default() })
    }

    // ---- webhook routes ----

    /// Replace the in-memory mirror with the store's webhook hash. Called once
    /// at startup; later writes keep both sides in step.
    pub async fn load_webhooks(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let stored: HashMap<String, String> = conn.hgetall(WEBHOOKS_KEY).await?;
        let count = stored.len();
        *self.webhooks.write().await = stored;
        Ok(count)
    }

    pub async fn put_webhook(&self, key: &str, url: &str) -> StoreResult<()> {
        self.webhooks.write().await.insert(key.to_string(), url.to_string());
        let mut conn = self.conn.clone();
        let _: () = conn.hset(WEBHOOKS_KEY, key, url).await?;
        Ok(())
    }

    pub async fn get_webhook(&self, key: &str) -> Option<String> {
        if let Some(url) = self.webhooks.read().await.get(key) {
            return Some(url.clone());
        }
        let mut conn = self.conn.clone();
        match conn.hget::<_, _, Option<String>>(WEBHOOKS_KEY, key).await {
            Ok(Some(url)) => {
                self.webhooks.write().await.insert(key.to_string(), url.clone());
                Some(url)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("webhook lookup fell back to memory only: {e}");
                None
            }
        }
    }

    pub async fn delete_webhook(&self, key: &str) -> StoreResult<()> {
        self.webhooks.write().await.remove(key);
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(WEBHOOKS_KEY, key).await?;
        Ok(())
    }

    /// Snapshot of every known route, for the liveness sweep.
    pub async fn all_webhooks(&self) -> HashMap<String, String> {
        self.webhooks.read().await.clone()
    }

    // ---- DM routes ----

    pub async fn put_dm_route(&self, channel: ChannelId, route: &DmRoute) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(route)
            .map_err(|e| MirrorError::ConfigInvalid(e.to_string()))?;
        let _: () = conn.hset(DM_ROUTES_KEY, channel.to_string(), json).await?;
        Ok(())
    }

    pub async fn get_dm_route(&self, channel: ChannelId) -> Option<DmRoute> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.hget(DM_ROUTES_KEY, channel.to_string()).await.ok()?;
        serde_json::from_str(&json?).ok()
    }

    // ---- channel age ----

    fn channel_created_key(channel: ChannelId) -> String {
        format!("channel_created_{channel}")
    }

    pub async fn set_channel_age(
        &self,
        channel: ChannelId,
        created_at: DateTime<Utc>,
        ttl_secs: usize,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(Self::channel_created_key(channel), created_at.to_rfc3339(), ttl_secs as u64).await?;
        Ok(())
    }

    pub async fn get_channel_age(&self, channel: ChannelId) -> Option<DateTime<Utc>> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn.get(Self::channel_created_key(channel)).await.ok()?;
        DateTime::parse_from_rfc3339(&stored?).ok().map(|dt| dt.with_timezone(&Utc))
    }

    pub async fn delete_channel_age(&self, channel: ChannelId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::channel_created_key(channel)).await?;
        Ok(())
    }

    // ---- queues ----

    pub async fn push_queue(&self, name: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(name, payload).await?;
        Ok(())
    }

    pub async fn pop_queue(&self, name: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpop(name, None).await?)
    }

    // ---- source-to-destination channel map ----

    pub async fn set_channel_monitoring(&self, destination: ChannelId, source: ChannelId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(CHANNEL_MONITORING_KEY, destination.to_string(), source.to_string()).await?;
        Ok(())
    }

    pub async fn channel_monitoring(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(CHANNEL_MONITORING_KEY).await?)
    }

    // ---- cross-process dedup (optional second line) ----

    pub async fn remember_message(&self, hash: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(RECENT_MESSAGES_KEY, hash).await?;
        let _: () = conn.expire(RECENT_MESSAGES_KEY, RECENT_MESSAGES_TTL_SECS as i64).await?;
        Ok(added == 1)
    }

    // ---- discovery ----

    pub async fn publish_bot_instances(&self, instances: &HashMap<String, BotInstance>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(instances)
            .map_err(|e| MirrorError::ConfigInvalid(e.to_string()))?;
        let _: () = conn.set(BOT_INSTANCES_KEY, json).await?;
        Ok(())
    }

    pub async fn bot_instances(&self) -> StoreResult<HashMap<String, BotInstance>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(BOT_INSTANCES_KEY).await?;
        match json {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| MirrorError::ConfigInvalid(e.to_string())),
            None => Ok(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_created_key_format() {
        assert_eq!(
            RoutingStore::channel_created_key(ChannelId(41_771_983_423_143_937)),
            "channel_created_41771983423143937",
        );
    }

    #[test]
    fn bot_instance_round_trips() {
        let instance = BotInstance {
            user_id: UserId(53_908_099_506_183_680),
            username: "mason".into(),
            guilds: vec!["197038439483310086".into()],
        };
        let json = serde_json::to_string(&instance).unwrap();
        let back: BotInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.username, "mason");
        assert_eq!(back.guilds.len(), 1);
    }
}
