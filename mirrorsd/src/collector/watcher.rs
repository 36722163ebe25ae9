//! The deleted-channel watcher. Source guilds constantly rotate their
//! time/date-named channels (release days, restock hours); when one vanishes
//! the destination should drop its mirror too. Every 10 s each collector
//! re-fetches its guilds' channels and reports registered names that are gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::collector::Collector;
use crate::model::channel::ChannelType;
use crate::model::ids::ChannelId;
use crate::utils::ShutdownRx;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

static CLEAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s:\-/]").unwrap());
static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{1,2}[-/]\d{1,2}\b").unwrap());
static TIME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b\d{1,2}(am|pm)\b").unwrap());

/// Whether a channel name encodes a date (`4-17`, `04/17`) or a clock time
/// (`11am`). Only such channels are watched for deletion.
pub fn is_time_or_date_based(name: &str) -> bool {
    let lower = name.to_lowercase();
    let clean = CLEAN.replace_all(&lower, "");
    DATE_PATTERN.is_match(&clean) || TIME_PATTERN.is_match(&clean)
}

#[derive(Debug, Clone)]
struct WatchedChannel {
    server_name: String,
    channel_name: String,
}

/// Poll until shutdown. The registry starts from the current cache and grows
/// as new time/date channels appear.
pub async fn run(collector: Arc<Collector>, shutdown: ShutdownRx) {
    info!("starting deleted channel monitor (time/date based channels only)");
    let mut watched: HashMap<ChannelId, WatchedChannel> = HashMap::new();

    while !*shutdown.borrow() {
        tokio::time::sleep(POLL_INTERVAL).await;

        for guild_id in collector.guild_ids().await {
            let live = match collector.client.get_guild_channels(guild_id).await {
                Ok(channels) => channels,
                Err(e) => {
                    error!("error refreshing channels for {guild_id}: {e}");
                    continue;
                }
            };
            let server_name = {
                let guilds = collector.guilds.read().await;
                guilds.get(&guild_id).map(|g| g.name.clone()).unwrap_or_else(|| guild_id.to_string())
            };

            let mut live_text_ids = std::collections::HashSet::new();
            for channel in &live {
                if channel.kind != ChannelType::Text {
                    continue;
                }
                live_text_ids.insert(channel.id);
                if is_time_or_date_based(channel.name()) && !watched.contains_key(&channel.id) {
                    info!("now monitoring time/date channel {} ({})", channel.name(), channel.id);
                    watched.insert(channel.id, WatchedChannel {
                        server_name: server_name.clone(),
                        channel_name: channel.name().to_string(),
                    });
                }
            }

            let gone: Vec<ChannelId> = watched.iter()
                .filter(|(id, w)| w.server_name == server_name && !live_text_ids.contains(id))
                .map(|(id, _)| *id)
                .collect();
            for id in gone {
                if let Some(w) = watched.remove(&id) {
                    info!("detected deletion of {} ({id}), notifying republisher", w.channel_name);
                    collector.send_channel_delete(&w.server_name, &w.channel_name).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_names_match() {
        assert!(is_time_or_date_based("04-17│jordan-drop"));
        assert!(is_time_or_date_based("4/17 restock"));
    }

    #[test]
    fn time_names_match() {
        assert!(is_time_or_date_based("11am-restock"));
        assert!(is_time_or_date_based("3PM checkout"));
    }

    #[test]
    fn plain_names_do_not_match() {
        assert!(!is_time_or_date_based("general"));
        assert!(!is_time_or_date_based("faq-2024"));
        assert!(!is_time_or_date_based("100am"));
    }
}
