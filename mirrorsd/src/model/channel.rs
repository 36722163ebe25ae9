use serde::{Deserialize, Serialize};

use crate::model::ids::*;
pub use crate::model::ids::ChannelId;
use crate::model::user::User;

serde_repr! {
    /// The `type` tag on a [`Channel`].
    pub enum ChannelType: u8 {
        /// a text channel within a server
        Text = 0,
        /// a direct message between users
        Dm = 1,
        /// a voice channel within a server
        Voice = 2,
        /// a direct message between multiple users
        GroupDm = 3,
        /// an organizational category that contains up to 50 channels
        Category = 4,
        /// a channel that users can follow and crosspost into their own server
        Announcement = 5,
        /// a temporary sub-channel within a GUILD_ANNOUNCEMENT channel
        AnnouncementThread = 10,
        /// a temporary sub-channel within a GUILD_TEXT channel
        PublicThread = 11,
        /// a temporary sub-channel only viewable by those invited
        PrivateThread = 12,
        /// a voice channel for hosting events with an audience
        GuildStageVoice = 13,
        /// the channel in a hub containing the listed servers
        GuildDirectory = 14,
        /// channel that can only contain threads
        GuildForum = 15,
    }
}

/// Represents a guild or DM channel within Discord. One struct with a type
/// tag rather than an enum per type: every call site here switches on
/// [`kind`](Channel::kind) at most once and otherwise only needs the common
/// fields.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Channel {
    /// the id of this channel
    pub id: ChannelId,
    /// the type of channel
    #[serde(rename = "type")]
    pub kind: ChannelType,
    /// the id of the guild (may be missing for some channel objects received
    /// over gateway dispatches)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    /// sorting position of the channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// the name of the channel (1-100 characters)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// the channel topic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// for guild channels: id of the parent category; for threads: id of the
    /// text channel this thread was created in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ChannelId>,
    /// the recipients of the DM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<User>>,
    /// the id of the last message sent in this channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
}

id_eq!(Channel);
impl Id for Channel {
    type Id = ChannelId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Channel {
    pub fn is_text(&self) -> bool {
        self.kind == ChannelType::Text
    }

    pub fn is_category(&self) -> bool {
        self.kind == ChannelType::Category
    }

    pub fn is_dm(&self) -> bool {
        self.kind == ChannelType::Dm
    }

    /// The channel's name, or `""` for unnamed (DM) channels.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// The single DM recipient, for [`ChannelType::Dm`] channels.
    pub fn dm_recipient(&self) -> Option<&User> {
        self.recipients.as_ref()?.first()
    }
}

/// Fields for `POST /guilds/{id}/channels`.
#[derive(Serialize, Debug, Clone)]
pub struct CreateChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl CreateChannel {
    pub fn text(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ChannelType::Text, parent_id: None, topic: None }
    }

    pub fn category(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ChannelType::Category, parent_id: None, topic: None }
    }

    pub fn parent(mut self, parent: ChannelId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// Fields for `PATCH /channels/{id}`. Only the bits the organizer loop edits.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ModifyChannel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    /// `Some(None)` moves the channel out of any category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Option<ChannelId>>,
}

/// An incoming webhook, as returned by the webhook create/list endpoints.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Webhook {
    pub id: WebhookId,
    pub channel_id: ChannelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// the secure token of the webhook (returned for incoming webhooks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// the url used for executing the webhook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Webhook {
    /// The execute url, rebuilt from id + token when Discord omits the
    /// premade `url` field.
    pub fn execute_url(&self) -> Option<String> {
        match (&self.url, &self.token) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(token)) => Some(api!("/webhooks/{}/{}", self.id, token)),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Channel {
        match serde_json::from_str(json) {
            Ok(channel) => channel,
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    fn guild_text() {
        let channel = parse(r#"{
  "type": 0,
  "id": "41771983423143937",
  "guild_id": "41771983423143937",
  "name": "general",
  "position": 6,
  "rate_limit_per_user": 2,
  "nsfw": true,
  "topic": "24/7 chat about how to gank Mike #2",
  "last_message_id": "155117677105512449",
  "parent_id": "399942396007890945"
}"#);
        assert!(channel.is_text());
        assert_eq!(channel.name(), "general");
        assert_eq!(channel.parent_id, Some(ChannelId(399_942_396_007_890_945)));
    }

    #[test]
    fn dm() {
        let channel = parse(r#"{
  "type": 1,
  "id": "319674150115610528",
  "last_message_id": "3343820033257021450",
  "recipients": [
    {
      "id": "82198898841029460",
      "username": "test",
      "discriminator": "9999",
      "avatar": "33ecab261d4681afa4d85a04691c4a01"
    }
  ]
}"#);
        assert!(channel.is_dm());
        assert_eq!(channel.dm_recipient().unwrap().username, "test");
    }

    #[test]
    fn category() {
        let channel = parse(r#"{
  "type": 4,
  "id": "399942396007890945",
  "guild_id": "290926798629997250",
  "name": "Test",
  "position": 0
}"#);
        assert!(channel.is_category());
    }

    #[test]
    fn webhook_execute_url_from_parts() {
        let webhook: Webhook = serde_json::from_str(r#"{
  "id": "223704706495545344",
  "channel_id": "199737254929760256",
  "name": "1Tap Notify",
  "token": "3d89bb7572e0fb30d8128367b3b1b44fecd1726de135cbe28a41f8b2f777c372ba2939e72279b94526ff5d1bd4358d65cf11"
}"#).unwrap();
        assert_eq!(
            webhook.execute_url().unwrap(),
            format!(
                "https://discord.com/api/v10/webhooks/223704706495545344/{}",
                "3d89bb7572e0fb30d8128367b3b1b44fecd1726de135cbe28a41f8b2f777c372ba2939e72279b94526ff5d1bd4358d65cf11",
            ),
        );
    }
}
