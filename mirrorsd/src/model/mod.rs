//! Rust structures representing the information sent by Discord's API.

use std::fmt::{self, Display};

use serde::Deserialize;
use thiserror::Error;

#[macro_use]
pub mod ids;
pub mod channel;
pub mod guild;
pub mod message;
pub mod user;

/// Information returned from the `/gateway` and `/gateway/bot` endpoints.
#[derive(Deserialize, Debug)]
pub struct Gateway {
    /// The WSS URL that can be used for connecting to the gateway
    pub url: String,
    /// The recommended number of shards to use when connecting (bot sessions only)
    #[serde(default)]
    pub shards: Option<u64>,
}

/// The error body Discord returns alongside 4xx statuses.
///
/// `code` is one of Discord's
/// [JSON error codes](https://discord.com/developers/docs/topics/opcodes-and-status-codes#json-json-error-codes);
/// the ones this crate branches on are named as constants.
#[derive(Deserialize, Debug, Error)]
pub struct DiscordError {
    pub code: u32,
    pub message: String,
    #[serde(default)]
    pub errors: serde_json::Value,
}

impl DiscordError {
    pub const UNKNOWN_CHANNEL: u32 = 10003;
    pub const UNKNOWN_WEBHOOK: u32 = 10015;
    /// Maximum number of guild roles reached (250)
    pub const MAX_GUILD_ROLES: u32 = 30005;
    pub const INVALID_FORM_BODY: u32 = 50035;
}

impl Display for DiscordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
