//! The layout guardian: keeps the two moveable categories ("Release Guides"
//! and "Daily Schedule") ordered and pruned, and leaves everything else
//! strictly alone. Channels outside the moveable set are never repositioned,
//! re-parented, or deleted by these loops.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::errors::MirrorError;
use crate::http::DiscordClient;
use crate::model::channel::{Channel, ChannelType, ModifyChannel};
use crate::model::ids::{ChannelId, GuildId};
use crate::store::RoutingStore;
use crate::utils::ShutdownRx;

pub const RELEASE_GUIDES: &str = "Release Guides";
pub const DAILY_SCHEDULE: &str = "Daily Schedule";

const ORGANIZE_INTERVAL: Duration = Duration::from_secs(30);
const RETENTION_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Daily Schedule channels older than this are deleted.
const DAILY_MAX_AGE_HOURS: i64 = 24;
/// Release Guides channels older than this are deleted even without a parsed
/// date.
const RELEASE_MAX_AGE_DAYS: i64 = 7;

static RELEASE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})[-/](\d{1,2})\b").unwrap());
static SCHEDULE_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(am|pm)\b").unwrap());

/// Parse an `MM-DD` (or `M/D`) date out of a channel name.
pub fn parse_release_date(name: &str) -> Option<(u32, u32)> {
    let captures = RELEASE_DATE.captures(name)?;
    let month: u32 = captures[1].parse().ok()?;
    let day: u32 = captures[2].parse().ok()?;
    if (1..=12).contains(&month) && (1..=31).contains(&day) {
        Some((month, day))
    } else {
        None
    }
}

/// Parse an `11am` / `3pm` style hour out of a channel name, in 24-hour form.
pub fn parse_schedule_hour(name: &str) -> Option<u32> {
    let captures = SCHEDULE_TIME.captures(name)?;
    let hour: u32 = captures[1].parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let pm = captures[2].eq_ignore_ascii_case("pm");
    Some(match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    })
}

/// The sort key within a moveable category; unparseable names sink to the
/// bottom in their existing order.
fn sort_key(category: &str, name: &str) -> u32 {
    match category {
        RELEASE_GUIDES => parse_release_date(name)
            .map(|(m, d)| m * 100 + d)
            .unwrap_or(u32::MAX),
        _ => parse_schedule_hour(name).unwrap_or(u32::MAX),
    }
}

/// Whether a Daily Schedule channel has outlived its day.
pub fn daily_schedule_expired(age: chrono::Duration) -> bool {
    age >= chrono::Duration::hours(DAILY_MAX_AGE_HOURS)
}

/// Whether a Release Guides channel should go: its encoded date is in the
/// past, or it has simply been around too long.
pub fn release_guides_expired(name: &str, age: chrono::Duration, today: NaiveDate) -> bool {
    if let Some((month, day)) = parse_release_date(name) {
        if let Some(date) = NaiveDate::from_ymd_opt(today.year(), month, day) {
            if date < today {
                return true;
            }
        }
    }
    age >= chrono::Duration::days(RELEASE_MAX_AGE_DAYS)
}

struct MoveableCategories {
    release_guides: Option<ChannelId>,
    daily_schedule: Option<ChannelId>,
}

fn find_moveable(channels: &[Channel]) -> MoveableCategories {
    let find = |name: &str| {
        channels.iter()
            .find(|c| c.kind == ChannelType::Category && c.name().eq_ignore_ascii_case(name))
            .map(|c| c.id)
    };
    MoveableCategories {
        release_guides: find(RELEASE_GUIDES),
        daily_schedule: find(DAILY_SCHEDULE),
    }
}

/// One organizer pass. Returns how many channels were moved or repositioned.
pub async fn organize_once(client: &DiscordClient, guild: GuildId) -> Result<usize, MirrorError> {
    let channels = client.get_guild_channels(guild).await.map_err(MirrorError::from)?;
    let moveable = find_moveable(&channels);
    let mut adjusted = 0_usize;

    // a date-named channel sitting in Daily Schedule belongs in Release Guides
    if let (Some(release), Some(daily)) = (moveable.release_guides, moveable.daily_schedule) {
        for channel in &channels {
            if channel.kind == ChannelType::Text
                && channel.parent_id == Some(daily)
                && parse_schedule_hour(channel.name()).is_none()
                && parse_release_date(channel.name()).is_some()
            {
                info!("moving {} into {RELEASE_GUIDES}", channel.name());
                let modify = ModifyChannel { parent_id: Some(Some(release)), ..Default::default() };
                if let Err(e) = client.modify_channel(channel.id, modify).await {
                    error!("failed to move {}: {e}", channel.name());
                } else {
                    adjusted += 1;
                }
            }
        }
    }

    for (category_id, category_name) in [
        (moveable.release_guides, RELEASE_GUIDES),
        (moveable.daily_schedule, DAILY_SCHEDULE),
    ] {
        let Some(category_id) = category_id else { continue };
        adjusted += sort_category(client, &channels, category_id, category_name).await;
    }
    Ok(adjusted)
}

async fn sort_category(
    client: &DiscordClient,
    channels: &[Channel],
    category: ChannelId,
    category_name: &str,
) -> usize {
    let mut members: Vec<&Channel> = channels.iter()
        .filter(|c| c.kind == ChannelType::Text && c.parent_id == Some(category))
        .collect();
    members.sort_by_key(|c| c.position.unwrap_or(0));

    let mut desired = members.clone();
    desired.sort_by(|a, b| {
        sort_key(category_name, a.name()).cmp(&sort_key(category_name, b.name()))
            .then(a.position.unwrap_or(0).cmp(&b.position.unwrap_or(0)))
    });

    if members.iter().map(|c| c.id).eq(desired.iter().map(|c| c.id)) {
        return 0;
    }

    let base = members.iter().filter_map(|c| c.position).min().unwrap_or(0);
    let mut adjusted = 0;
    for (i, channel) in desired.iter().enumerate() {
        let position = base + i as u32;
        if channel.position == Some(position) {
            continue;
        }
        let modify = ModifyChannel { position: Some(position), ..Default::default() };
        if let Err(e) = client.modify_channel(channel.id, modify).await {
            error!("failed to reposition {}: {e}", channel.name());
        } else {
            adjusted += 1;
        }
    }
    info!("sorted {category_name}: {adjusted} positions edited");
    adjusted
}

/// The 30 s organizer loop.
pub async fn run_organizer(client: Arc<DiscordClient>, guild: GuildId, shutdown: ShutdownRx) {
    while !*shutdown.borrow() {
        tokio::time::sleep(ORGANIZE_INTERVAL).await;
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = organize_once(&client, guild).await {
            error!("organizer pass failed: {e}");
        }
    }
}

/// The 30-minute retention loop: expire Daily Schedule by age and Release
/// Guides by encoded date or age, never touching protected channels.
pub async fn run_retention(
    client: Arc<DiscordClient>,
    store: RoutingStore,
    config: watch::Receiver<Arc<Config>>,
    guild: GuildId,
    shutdown: ShutdownRx,
) {
    while !*shutdown.borrow() {
        tokio::time::sleep(RETENTION_INTERVAL).await;
        if *shutdown.borrow() {
            break;
        }
        let config_snapshot = config.borrow().clone();
        if let Err(e) = retention_pass(&client, &store, &config_snapshot, guild).await {
            error!("retention pass failed: {e}");
        }
    }
}

async fn retention_pass(
    client: &DiscordClient,
    store: &RoutingStore,
    config: &Config,
    guild: GuildId,
) -> Result<(), MirrorError> {
    let channels = client.get_guild_channels(guild).await.map_err(MirrorError::from)?;
    let moveable = find_moveable(&channels);
    let now = Utc::now();
    let today = now.date_naive();

    for channel in &channels {
        if channel.kind != ChannelType::Text {
            continue;
        }
        let in_daily = moveable.daily_schedule.is_some() && channel.parent_id == moveable.daily_schedule;
        let in_release = moveable.release_guides.is_some() && channel.parent_id == moveable.release_guides;
        if !in_daily && !in_release {
            continue;
        }
        if config.is_protected(channel.id) {
            continue;
        }

        let created = store.get_channel_age(channel.id).await
            .unwrap_or_else(|| channel.id.timestamp());
        let age = now.signed_duration_since(created);

        let expired = if in_daily {
            daily_schedule_expired(age)
        } else {
            release_guides_expired(channel.name(), age, today)
        };
        if !expired {
            continue;
        }

        info!("retention: deleting {} (age {}h)", channel.name(), age.num_hours());
        match client.delete_channel(channel.id).await {
            Ok(()) => {
                if let Err(e) = store.delete_channel_age(channel.id).await {
                    warn!("could not drop age key for {}: {e}", channel.id);
                }
            }
            Err(e) => error!("retention failed to delete {}: {e}", channel.name()),
        }
    }
    Ok(())
}

/// A point-in-time capture of the destination layout, written to
/// `layouts/{server_id}.json`. Reference only; nothing enforces it.
#[derive(Serialize, Debug)]
struct ServerLayout {
    server_id: String,
    categories: BTreeMap<String, CategoryLayout>,
    uncategorized_channels: Vec<ChannelLayout>,
}

#[derive(Serialize, Debug)]
struct CategoryLayout {
    name: String,
    position: u32,
    channels: Vec<ChannelLayout>,
}

#[derive(Serialize, Debug)]
struct ChannelLayout {
    id: String,
    name: String,
    position: u32,
}

pub async fn capture_layout(client: &DiscordClient, guild: GuildId) -> Result<PathBuf, MirrorError> {
    let channels = client.get_guild_channels(guild).await.map_err(MirrorError::from)?;

    let mut categories: BTreeMap<String, CategoryLayout> = channels.iter()
        .filter(|c| c.kind == ChannelType::Category)
        .map(|c| (c.id.to_string(), CategoryLayout {
            name: c.name().to_string(),
            position: c.position.unwrap_or(0),
            channels: Vec::new(),
        }))
        .collect();
    let mut uncategorized = Vec::new();

    for channel in channels.iter().filter(|c| c.kind == ChannelType::Text) {
        let layout = ChannelLayout {
            id: channel.id.to_string(),
            name: channel.name().to_string(),
            position: channel.position.unwrap_or(0),
        };
        match channel.parent_id.map(|p| p.to_string()).and_then(|p| categories.get_mut(&p)) {
            Some(category) => category.channels.push(layout),
            None => uncategorized.push(layout),
        }
    }

    let snapshot = ServerLayout {
        server_id: guild.to_string(),
        categories,
        uncategorized_channels: uncategorized,
    };

    std::fs::create_dir_all("layouts")
        .map_err(|e| MirrorError::ConfigInvalid(format!("layouts dir: {e}")))?;
    let path = PathBuf::from(format!("layouts/{guild}.json"));
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| MirrorError::ConfigInvalid(e.to_string()))?;
    std::fs::write(&path, json)
        .map_err(|e| MirrorError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    info!("captured layout of {guild} to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_dates_parse() {
        assert_eq!(parse_release_date("04-17│foo"), Some((4, 17)));
        assert_eq!(parse_release_date("5/1 bar"), Some((5, 1)));
        assert_eq!(parse_release_date("jordan-4-retro"), None);
        assert_eq!(parse_release_date("no date here"), None);
        assert_eq!(parse_release_date("13-40"), None);
    }

    #[test]
    fn schedule_hours_parse_to_24h() {
        assert_eq!(parse_schedule_hour("11am-restock"), Some(11));
        assert_eq!(parse_schedule_hour("3pm drop"), Some(15));
        assert_eq!(parse_schedule_hour("12am midnight"), Some(0));
        assert_eq!(parse_schedule_hour("12pm noon"), Some(12));
        assert_eq!(parse_schedule_hour("restocks"), None);
    }

    #[test]
    fn date_sorting_order() {
        assert!(sort_key(RELEASE_GUIDES, "04-17│foo") < sort_key(RELEASE_GUIDES, "05-01│bar"));
        assert_eq!(sort_key(RELEASE_GUIDES, "general"), u32::MAX);
    }

    #[test]
    fn time_sorting_order() {
        assert!(sort_key(DAILY_SCHEDULE, "9am") < sort_key(DAILY_SCHEDULE, "3pm"));
        assert_eq!(sort_key(DAILY_SCHEDULE, "no-time"), u32::MAX);
    }

    #[test]
    fn daily_expiry_at_24h() {
        assert!(!daily_schedule_expired(chrono::Duration::hours(23)));
        assert!(daily_schedule_expired(chrono::Duration::hours(25)));
    }

    #[test]
    fn release_expiry_by_past_date() {
        let today = NaiveDate::from_ymd_opt(2025, 5, 2).unwrap();
        // encoded date has passed, age irrelevant
        assert!(release_guides_expired("04-30│foo", chrono::Duration::hours(1), today));
        // future date, young channel
        assert!(!release_guides_expired("05-10│bar", chrono::Duration::hours(1), today));
        // no date at all falls back to the 7 day window
        assert!(release_guides_expired("jordan retro", chrono::Duration::days(8), today));
        assert!(!release_guides_expired("jordan retro", chrono::Duration::days(6), today));
    }
}
