use serde::Deserialize;

use crate::model::channel::Channel;
use crate::model::guild::Guild;
use crate::model::ids::*;
use crate::model::message::Message;
use crate::model::user::User;

/// The dispatch events the mirror acts on. Everything else Discord sends
/// (presence, typing, voice, ...) lands in `Unknown` and is dropped without
/// failing the payload parse.
#[allow(clippy::large_enum_variant)]
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum DispatchPayload {
    // Connection
    Ready(Ready),
    Resumed(Resumed),

    // Guilds
    GuildCreate(Guild),
    GuildDelete(GuildDelete),

    // Channels
    ChannelCreate(Channel),
    ChannelDelete(Channel),

    // Messages
    MessageCreate(Message),

    #[serde(other)]
    Unknown,
}

/// The Ready event is dispatched when a client has completed the initial
/// handshake with the gateway.
#[derive(Deserialize, Debug, Clone)]
pub struct Ready {
    /// gateway protocol version
    pub v: u8,
    /// information about the user including email
    pub user: User,
    /// the guilds the user is in; unavailable stubs for bot sessions, full
    /// objects for user sessions
    #[serde(default)]
    pub guilds: Vec<Guild>,
    /// used for resuming connections
    pub session_id: String,
    /// the gateway url to use when resuming
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Resumed {}

#[derive(Deserialize, Debug, Clone)]
pub struct GuildDelete {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_create_dispatch() {
        let payload: DispatchPayload = serde_json::from_str(r#"{
  "t": "MESSAGE_CREATE",
  "d": {
    "id": "334385199974967042",
    "channel_id": "290926798999357250",
    "author": {"id": "53908099506183680", "username": "mason", "discriminator": "0", "avatar": null},
    "content": "hi",
    "timestamp": "2017-07-11T17:27:07.299000+00:00",
    "type": 0
  }
}"#).unwrap();
        match payload {
            DispatchPayload::MessageCreate(message) => assert_eq!(message.content, "hi"),
            other => panic!("expected MessageCreate, got {other:?}"),
        }
    }

    #[test]
    fn unhandled_dispatch_is_unknown() {
        let payload: DispatchPayload =
            serde_json::from_str(r#"{"t": "TYPING_START", "d": {"channel_id": "1", "user_id": "2", "timestamp": 3}}"#)
                .unwrap();
        assert!(matches!(payload, DispatchPayload::Unknown));
    }
}
