//! The system-wide error taxonomy. Every I/O call site maps Discord, queue,
//! and store failures onto these kinds, and the long-running loops branch on
//! the tag; nothing here ever terminates a loop except a deliberate shutdown.

use thiserror::Error;

use crate::http::ClientError;
use crate::model::DiscordError;
use crate::shard::ShardError;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// Invalid or revoked token; terminal for that token until the config
    /// file changes.
    #[error("token is invalid or revoked")]
    AuthInvalid,
    /// Disconnect/resume/reset; recovered locally with backoff.
    #[error("transient gateway failure: {0}")]
    GatewayTransient(String),
    /// 404 Unknown Webhook: evict the route and reprovision.
    #[error("webhook no longer exists")]
    WebhookUnknown,
    /// 404 Unknown Channel: evict the route and drop the message.
    #[error("destination channel no longer exists")]
    ChannelUnknown,
    #[error("rate limited for {retry_after}s")]
    RateLimited { retry_after: f64 },
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("bad request (discord code {code})")]
    BadRequest { code: u32 },
    /// Local HTTP egress refused; retried indefinitely at 10 s intervals.
    #[error("upstream endpoint unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("configuration rejected: {0}")]
    ConfigInvalid(String),
    #[error("key-value store error: {0}")]
    Store(#[from] redis::RedisError),
    #[error(transparent)]
    Client(ClientError),
}

impl From<ClientError> for MirrorError {
    fn from(e: ClientError) -> Self {
        if e.is_unauthorized() {
            return Self::AuthInvalid;
        }
        match e.discord_code() {
            Some(DiscordError::UNKNOWN_WEBHOOK) => Self::WebhookUnknown,
            Some(DiscordError::UNKNOWN_CHANNEL) => Self::ChannelUnknown,
            Some(code) => Self::BadRequest { code },
            None => Self::Client(e),
        }
    }
}

impl From<ShardError> for MirrorError {
    fn from(e: ShardError) -> Self {
        match e {
            ShardError::AuthInvalid => Self::AuthInvalid,
            other => Self::GatewayTransient(other.to_string()),
        }
    }
}

impl MirrorError {
    /// True for the kinds a caller should simply log and move past (the
    /// per-message failure policy).
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::WebhookUnknown
                | Self::ChannelUnknown
                | Self::PayloadTooLarge
                | Self::BadRequest { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_auth_maps_to_auth_invalid() {
        let e = MirrorError::from(ShardError::AuthInvalid);
        assert!(matches!(e, MirrorError::AuthInvalid));
    }

    #[test]
    fn shard_restart_maps_to_transient() {
        let e = MirrorError::from(ShardError::NeedRestart);
        assert!(matches!(e, MirrorError::GatewayTransient(_)));
    }
}
