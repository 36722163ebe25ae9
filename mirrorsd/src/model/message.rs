use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::ids::*;
use crate::model::user::User;

/// A message sent in a channel within Discord, trimmed to the mirror's needs.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    /// present in MESSAGE_CREATE dispatches for guild messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    pub author: User,
    /// partial member object for the author, in guild dispatches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<PartialMember>,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<User>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_roles: Vec<RoleId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    /// present when the message is a webhook execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<WebhookId>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// present for messages posted by applications (including crossposts);
    /// explicitly NOT treated as forwarding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<ApplicationId>,
    /// reply / crosspost / forward source data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
    /// the message this message references, resolved by Discord when it can be
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_message: Option<Box<Message>>,
}

id_eq!(Message);
impl Id for Message {
    type Id = MessageId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Message {
    /// True when the message carries neither text, embeds, nor attachments.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.embeds.is_empty() && self.attachments.is_empty()
    }
}

/// `type` on a [`Message`]. Only the values this crate distinguishes are
/// named; everything else parses as `Other` rather than failing the whole
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Default,
    Reply,
    Other(u8),
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let n = match self {
            Self::Default => 0,
            Self::Reply => 19,
            Self::Other(n) => *n,
        };
        n.serialize(s)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(match u8::deserialize(d)? {
            0 => Self::Default,
            19 => Self::Reply,
            n => Self::Other(n),
        })
    }
}

/// A file attached to a message.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    /// size of file in bytes
    pub size: u64,
    /// source url of file
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A reference to another message: reply, crosspost, or forward.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MessageReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
}

/// Embedded rich content. The same shape travels in three places: gateway
/// messages, the queue payload, and outgoing webhook executions, so null
/// fields are skipped when serializing.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
}

impl Embed {
    /// An embed whose only content is an image, used to surface DM
    /// attachments that arrive without text.
    pub fn image_only(url: impl Into<String>) -> Self {
        Self {
            image: Some(EmbedImage { url: url.into() }),
            ..Self::default()
        }
    }

    /// Title + description concatenated, for trigger-phrase scans.
    pub fn text(&self) -> String {
        let mut text = String::new();
        if let Some(title) = &self.title {
            text.push_str(title);
        }
        if let Some(description) = &self.description {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(description);
        }
        text
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EmbedAuthor {
    pub name: String,
}

/// Partial guild member, as attached to message dispatches. The nick feeds
/// display-name resolution.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PartialMember {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleId>,
}

/// Fields for `POST /channels/{id}/messages`; only what the control plane and
/// the DM provisioning path send.
#[derive(Serialize, Debug, Clone, Default)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embeds: Vec<Embed>,
}

impl CreateMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), embeds: Vec::new() }
    }

    pub fn embed(embed: Embed) -> Self {
        Self { content: None, embeds: vec![embed] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_create_payload() {
        let message: Message = serde_json::from_str(r#"{
  "id": "334385199974967042",
  "channel_id": "290926798999357250",
  "guild_id": "290926798626357250",
  "author": {
    "id": "53908099506183680",
    "username": "mason",
    "discriminator": "0",
    "avatar": "a_bab14f271d565501444b2ca3be944b25"
  },
  "member": {
    "nick": "masn",
    "roles": ["290926798626357999"]
  },
  "content": "Supa Hot",
  "timestamp": "2017-07-11T17:27:07.299000+00:00",
  "tts": false,
  "mention_everyone": false,
  "mentions": [],
  "mention_roles": [],
  "attachments": [],
  "embeds": [],
  "pinned": false,
  "type": 0
}"#).unwrap();
        assert_eq!(message.kind, MessageType::Default);
        assert!(!message.is_empty());
        assert_eq!(message.member.unwrap().nick.as_deref(), Some("masn"));
    }

    #[test]
    fn unknown_message_type_does_not_fail() {
        let kind: MessageType = serde_json::from_str("8").unwrap();
        assert_eq!(kind, MessageType::Other(8));
    }

    #[test]
    fn embed_skips_null_keys() {
        let embed = Embed {
            title: Some("Channel Archive".into()),
            ..Embed::default()
        };
        assert_eq!(serde_json::to_string(&embed).unwrap(), r#"{"title":"Channel Archive"}"#);
    }

    #[test]
    fn embed_text_concatenates() {
        let embed = Embed {
            title: Some("t".into()),
            description: Some("d".into()),
            ..Embed::default()
        };
        assert_eq!(embed.text(), "t\nd");
    }
}
