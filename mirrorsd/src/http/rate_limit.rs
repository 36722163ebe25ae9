use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::time::Sleep;

use crate::http::routes::Route;
use crate::model::ids::*;

#[derive(Debug, Default)]
pub struct RateLimit {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset: Option<Instant>,
}

impl RateLimit {
    fn limit(&self) -> Option<Duration> {
        match self.remaining {
            Some(0) => {
                let duration = self.reset.and_then(|reset| reset.checked_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO);
                Some(duration)
            }
            _ => None,
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("limit", &self.limit)
            .field("remaining", &self.remaining)
            .field("reset", &self.reset.and_then(|reset| reset.checked_duration_since(Instant::now())))
            .finish()
    }
}

/// One bucket per rate-limited resource; mirror routes mostly bucket by
/// channel.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum BucketKey {
    GetGateway,
    GetChannel(ChannelId),
    EditChannel(ChannelId),
    DeleteChannel(ChannelId),
    GuildChannels(GuildId),
    GetMessage(ChannelId),
    PostMessage(ChannelId),
    CreateReaction(ChannelId),
    Webhooks(ChannelId),
    StartForumThread(ChannelId),
    GetUser,
    CreateDm,
    GetGuildRoles(GuildId),
}

impl From<&Route> for BucketKey {
    fn from(route: &Route) -> Self {
        match route {
            Route::GetGateway | Route::GetGatewayBot => Self::GetGateway,
            Route::GetChannel(c) => Self::GetChannel(*c),
            Route::EditChannel(c) => Self::EditChannel(*c),
            Route::DeleteChannel(c) => Self::DeleteChannel(*c),
            Route::GetGuildChannels(g) | Route::CreateGuildChannel(g) => Self::GuildChannels(*g),
            Route::GetMessage(c, _) => Self::GetMessage(*c),
            Route::PostMessage(c) => Self::PostMessage(*c),
            Route::CreateReaction(c, _, _) => Self::CreateReaction(*c),
            Route::GetChannelWebhooks(c) | Route::CreateWebhook(c) => Self::Webhooks(*c),
            Route::StartForumThread(c) => Self::StartForumThread(*c),
            Route::GetUser(_) => Self::GetUser,
            Route::CreateDm => Self::CreateDm,
            Route::GetGuildRoles(g) => Self::GetGuildRoles(*g),
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter(HashMap<BucketKey, RateLimit>);

impl RateLimiter {
    pub fn get_rate_limit(&self, key: &BucketKey) -> Option<Sleep> {
        if let Some(rate_limit) = self.0.get(key) {
            if let Some(duration) = rate_limit.limit() {
                log::info!("{:?} ==> {}", key, rate_limit);
                Some(tokio::time::sleep(duration))
            } else {
                None
            }
        } else {
            None
        }
    }

    pub fn update(&mut self, key: BucketKey, headers: &HeaderMap) {
        let rate_limit = self.0.entry(key).or_default();
        if let Some(limit) = header_number::<u32>(headers, "X-RateLimit-Limit") {
            rate_limit.limit = Some(limit);
        }
        if let Some(remaining) = header_number::<u32>(headers, "X-RateLimit-Remaining") {
            rate_limit.remaining = Some(remaining);
        }
        if let Some(reset_after) = header_number::<f64>(headers, "X-RateLimit-Reset-After") {
            rate_limit.reset = Some(Instant::now() + Duration::from_secs_f64(reset_after));
        }
    }
}

fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?
        .to_str().ok()?
        .parse().ok()
}
