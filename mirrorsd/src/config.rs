//! The on-disk configuration, its single-writer file guard, and the
//! debounced hot-reload watcher.
//!
//! Everything that mutates configuration (control-plane commands, token
//! failure marking, webhook/DM bookkeeping) goes through [`ConfigFile::update`]
//! so there is exactly one writer at a time, and the [watcher](watch_config)
//! picks the change up and publishes a fresh snapshot to every component.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};

use crate::errors::MirrorError;
use crate::model::ids::{ChannelId, GuildId, UserId};

pub const DEFAULT_QUEUE_NAME: &str = "message_queue";

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// the republisher's bot token
    #[serde(default)]
    pub bot_token: String,
    /// the destination guild id
    #[serde(default)]
    pub destination_server: Option<GuildId>,
    /// webhook route key -> url; mirrored into the store, kept here so a cold
    /// start with an empty store still routes
    #[serde(default)]
    pub webhooks: BTreeMap<String, String>,
    /// destination DM-mirror channel id -> route
    #[serde(default)]
    pub dm_mappings: BTreeMap<String, DmRoute>,
    /// user-session token -> per-token config
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenConfig>,
    #[serde(default)]
    pub settings: Settings,
    /// destination channel ids exempt from automatic deletion
    #[serde(default)]
    pub protected_channels: Vec<ChannelId>,
    /// `"{category}-[{server}]"` -> destination forum channel id
    #[serde(default)]
    pub forum_mappings: BTreeMap<String, ChannelId>,
    #[serde(default)]
    pub ignored_category_tags: Vec<String>,
    /// source category name -> destination category name overrides
    #[serde(default)]
    pub category_mappings: BTreeMap<String, String>,
    /// where the `update` command posts its embed
    #[serde(default)]
    pub updates_channel_id: Option<ChannelId>,
    #[serde(default)]
    pub archived_forums: Vec<ChannelId>,
    #[serde(default)]
    pub source_channel_ids: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Settings {
    /// delay between queue pops, in seconds
    #[serde(default = "default_message_delay")]
    pub message_delay: f64,
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
    /// the durable queue list key
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

fn default_message_delay() -> f64 { 0.75 }
fn default_max_login_attempts() -> u32 { 3 }
fn default_queue_name() -> String { DEFAULT_QUEUE_NAME.to_string() }

impl Default for Settings {
    fn default() -> Self {
        Self {
            message_delay: default_message_delay(),
            max_login_attempts: default_max_login_attempts(),
            queue_name: default_queue_name(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TokenConfig {
    #[serde(default)]
    pub disabled: bool,
    /// `"active"` or `"failed"`; failed tokens never retry until the config
    /// file changes
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    /// monitored server id -> exclusions
    #[serde(default)]
    pub servers: BTreeMap<String, MonitoredServer>,
    #[serde(default)]
    pub dm_mirroring: DmMirroring,
}

fn default_status() -> String { "active".to_string() }

impl TokenConfig {
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }

    pub fn runnable(&self) -> bool {
        !self.disabled && !self.is_failed()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_login: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MonitoredServer {
    #[serde(default)]
    pub excluded_categories: HashSet<ChannelId>,
    #[serde(default)]
    pub excluded_channels: HashSet<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitored_categories: Option<Vec<ChannelId>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DmMirroring {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_server_id: Option<GuildId>,
}

/// One DM-mirror channel's routing data: the peer identity and the tokens
/// able to reach them.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DmRoute {
    pub user_id: UserId,
    pub username: String,
    pub self_user_id: UserId,
    /// the token whose session received the DM
    pub receiving_token: String,
    /// the token able to DM the peer, chosen by `find_token_for_user`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Config {
    /// Tokens that should have a live gateway session.
    pub fn runnable_tokens(&self) -> impl Iterator<Item=(&String, &TokenConfig)> {
        self.tokens.iter().filter(|(_, data)| data.runnable())
    }

    /// Every server id monitored by any token.
    pub fn monitored_server_ids(&self) -> HashSet<GuildId> {
        self.tokens.values()
            .flat_map(|t| t.servers.keys())
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    /// The exclusion sets for a server, from whichever token monitors it.
    pub fn server_config(&self, server: GuildId) -> Option<&MonitoredServer> {
        let key = server.to_string();
        self.tokens.values().find_map(|t| t.servers.get(&key))
    }

    /// The token whose own user is `user` (i.e. the peer is another managed
    /// session), if any.
    pub fn find_token_for_user(&self, user: UserId) -> Option<&str> {
        self.tokens.iter()
            .find(|(_, data)| data.user_info.as_ref().map(|i| i.id) == Some(user))
            .map(|(token, _)| token.as_str())
    }

    pub fn is_protected(&self, channel: ChannelId) -> bool {
        self.protected_channels.contains(&channel)
    }
}

/// The single writer around `config.json`.
pub struct ConfigFile {
    path: PathBuf,
    guard: Mutex<()>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), guard: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file. A missing or malformed file is [`MirrorError::ConfigInvalid`].
    pub fn load(&self) -> Result<Config, MirrorError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| MirrorError::ConfigInvalid(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| MirrorError::ConfigInvalid(format!("{}: {e}", self.path.display())))
    }

    /// Load-modify-save under the writer guard, returning the saved config.
    pub async fn update<F>(&self, mutate: F) -> Result<Config, MirrorError>
        where F: FnOnce(&mut Config),
    {
        let _guard = self.guard.lock().await;
        let mut config = self.load()?;
        mutate(&mut config);
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| MirrorError::ConfigInvalid(e.to_string()))?;
        std::fs::write(&self.path, text)
            .map_err(|e| MirrorError::ConfigInvalid(format!("{}: {e}", self.path.display())))?;
        Ok(config)
    }

    /// Mark `token` failed so no session retries it until the file changes by
    /// hand.
    pub async fn mark_token_failed(&self, token: &str, error: &str) {
        let result = self.update(|config| {
            if let Some(data) = config.tokens.get_mut(token) {
                data.status = "failed".to_string();
                data.last_error = Some(error.to_string());
                data.last_failed_attempt = Some(Utc::now());
            }
        }).await;
        if let Err(e) = result {
            error!("failed to persist token failure: {e}");
        }
    }
}

/// The debounce applied to file events before reloading.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(1);

/// Start watching the config file. Returns the snapshot channel; every
/// successful reload publishes a new `Arc<Config>`, and an invalid file keeps
/// the previous snapshot.
pub fn watch_config(
    file: Arc<ConfigFile>,
    initial: Config,
) -> (watch::Receiver<Arc<Config>>, notify::Result<notify::RecommendedWatcher>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();

    let watcher = {
        let path = file.path().to_path_buf();
        let mut watcher = match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = event_tx.send(());
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => return (snapshot_rx, Err(e)),
        };
        // watch the containing directory, so editor save-and-rename still fires
        let watch_target = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
            return (snapshot_rx, Err(e));
        }
        watcher
    };

    tokio::spawn(async move {
        while event_rx.recv().await.is_some() {
            // debounce: swallow the burst of events a single save produces
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while event_rx.try_recv().is_ok() {}

            match file.load() {
                Ok(config) => {
                    info!("config reloaded: {} tokens, {} monitored servers",
                          config.tokens.len(), config.monitored_server_ids().len());
                    let _ = snapshot_tx.send(Arc::new(config));
                }
                Err(e) => warn!("config reload rejected, keeping previous snapshot: {e}"),
            }
        }
    });

    (snapshot_rx, Ok(watcher))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
  "bot_token": "destination-bot-token",
  "destination_server": "290926798629997250",
  "tokens": {
    "user-token-1": {
      "status": "active",
      "user_info": {"id": "53908099506183680", "name": "mason"},
      "servers": {
        "197038439483310086": {
          "excluded_categories": ["399942396007890945"],
          "excluded_channels": []
        }
      },
      "dm_mirroring": {"enabled": true, "destination_server_id": "290926798629997250"}
    },
    "user-token-2": {
      "disabled": true,
      "servers": {}
    }
  },
  "settings": {"message_delay": 0.5, "max_login_attempts": 5},
  "protected_channels": ["155101607195836416"]
}"#;

    #[test]
    fn parses_and_defaults() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.settings.max_login_attempts, 5);
        assert_eq!(config.settings.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(config.runnable_tokens().count(), 1);
        assert!(config.is_protected(ChannelId(155_101_607_195_836_416)));
    }

    #[test]
    fn monitored_servers_and_exclusions() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        let server = GuildId(197_038_439_483_310_086);
        assert!(config.monitored_server_ids().contains(&server));
        let monitored = config.server_config(server).unwrap();
        assert!(monitored.excluded_categories.contains(&ChannelId(399_942_396_007_890_945)));
    }

    #[test]
    fn find_token_for_user_matches_managed_session() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.find_token_for_user(UserId(53_908_099_506_183_680)),
            Some("user-token-1"),
        );
        assert_eq!(config.find_token_for_user(UserId(1)), None);
    }
}
