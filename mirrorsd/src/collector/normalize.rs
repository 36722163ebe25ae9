//! Turning a raw gateway [`Message`] into the one shape the republisher
//! accepts. Display names, reply context, forwarded-message detection, and
//! embed copying all happen here, once, on the collector side.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::message::{Embed, Message};
use crate::model::user::User;

/// Reply text is clipped to this many characters.
const REPLY_CLIP: usize = 180;

/// The queue payload. Immutable once enqueued; every field is already a
/// plain string/number so the republisher never needs gateway context.
///
/// `mentioned_channels` supplements the base shape: collectors resolve
/// `<#id>` names from their guild cache because the republisher has no view
/// of source guilds. It defaults empty, so older payloads still parse.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct NormalizedMessage {
    #[serde(default = "default_message_type")]
    pub message_type: String,
    pub message_id: String,
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub category_name: String,
    pub server_id: String,
    pub server_name: String,
    #[serde(default)]
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_avatar: Option<String>,
    pub timestamp: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub mentioned_roles: BTreeMap<String, String>,
    #[serde(default)]
    pub mentioned_channels: BTreeMap<String, String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub forwarded_from: Option<String>,
    #[serde(default)]
    pub forwarded_attachments: Vec<String>,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub channel_real_name: String,
    #[serde(default)]
    pub server_real_name: String,

    // dm-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_bot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
}

fn default_message_type() -> String {
    "regular".to_string()
}

impl NormalizedMessage {
    pub fn is_dm(&self) -> bool {
        self.message_type == "dm"
    }
}

/// The best display name for a user: global name, else guild nick, else the
/// username with any `#0` discriminator dropped.
pub fn display_name(user: &User, nick: Option<&str>) -> String {
    if let Some(global) = user.global_name.as_deref().filter(|n| !n.is_empty()) {
        return global.to_string();
    }
    if let Some(nick) = nick.filter(|n| !n.is_empty()) {
        return nick.to_string();
    }
    user.tag()
}

/// A reply's `(reply_to, reply_text)`, when the message references another
/// message and Discord resolved it.
pub fn detect_reply(message: &Message) -> Option<(String, String)> {
    let referenced = message.referenced_message.as_deref()?;
    let author = display_name(
        &referenced.author,
        referenced.member.as_ref().and_then(|m| m.nick.as_deref()),
    );
    let text: String = referenced.content.chars().take(REPLY_CLIP).collect();
    Some((author, text))
}

#[derive(Debug, Clone, Default)]
pub struct ForwardInfo {
    pub from: String,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<String>,
}

static FORWARD_SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:forwarded from|originally from)\s*[@:]?\s*([^\n\r]+)").unwrap()
});

/// Forwarded-message detection, first match wins:
///
/// 1. a native cross-guild reference whose referenced message resolved;
/// 2. an empty user message that only quotes another message with substance;
/// 3. a "forwarded from" / "originally from" phrase in the content.
///
/// Cross-posting and application-id messages are NOT forwarding.
pub fn detect_forward(message: &Message) -> Option<ForwardInfo> {
    // native forward: the reference points at a different guild
    if let (Some(reference), Some(referenced)) =
        (&message.message_reference, message.referenced_message.as_deref())
    {
        if reference.guild_id.is_some() && reference.guild_id != message.guild_id {
            return Some(forward_from_referenced(referenced));
        }
    }

    // an empty message quoting a message that has substance
    if message.is_empty() && !message.author.is_bot() {
        if let Some(referenced) = message.referenced_message.as_deref() {
            if !referenced.is_empty() {
                return Some(forward_from_referenced(referenced));
            }
        }
    }

    // a manually typed forward marker
    if let Some(captures) = FORWARD_SUBJECT.captures(&message.content) {
        return Some(ForwardInfo {
            from: captures[1].trim().to_string(),
            embeds: Vec::new(),
            attachments: Vec::new(),
        });
    }

    None
}

fn forward_from_referenced(referenced: &Message) -> ForwardInfo {
    ForwardInfo {
        from: display_name(
            &referenced.author,
            referenced.member.as_ref().and_then(|m| m.nick.as_deref()),
        ),
        embeds: referenced.embeds.clone(),
        attachments: referenced.attachments.iter().map(|a| a.url.clone()).collect(),
    }
}

/// The embeds a payload carries: the forward's embeds when forwarding, else
/// the message's own.
pub fn payload_embeds(message: &Message, forward: Option<&ForwardInfo>) -> Vec<Embed> {
    match forward {
        Some(forward) if !forward.embeds.is_empty() => forward.embeds.clone(),
        _ => message.embeds.clone(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::model::ids::*;
    use crate::model::message::{Attachment, MessageReference, MessageType};

    use super::*;

    fn user(name: &str, global: Option<&str>, bot: bool) -> User {
        User {
            id: UserId(1),
            username: name.to_string(),
            discriminator: "0".to_string(),
            global_name: global.map(str::to_string),
            avatar: None,
            bot: bot.then(|| true),
        }
    }

    fn message(content: &str, author: User) -> Message {
        Message {
            id: MessageId(10),
            channel_id: ChannelId(20),
            guild_id: Some(GuildId(30)),
            author,
            member: None,
            content: content.to_string(),
            timestamp: Utc::now(),
            mentions: vec![],
            mention_roles: vec![],
            attachments: vec![],
            embeds: vec![],
            webhook_id: None,
            kind: MessageType::Default,
            application_id: None,
            message_reference: None,
            referenced_message: None,
        }
    }

    #[test]
    fn display_name_precedence() {
        assert_eq!(display_name(&user("alice", Some("Alice W"), false), Some("ally")), "Alice W");
        assert_eq!(display_name(&user("alice", None, false), Some("ally")), "ally");
        assert_eq!(display_name(&user("alice", None, false), None), "alice");
    }

    #[test]
    fn reply_clips_to_180() {
        let mut referenced = message(&"x".repeat(500), user("bob", Some("Bob"), false));
        referenced.id = MessageId(9);
        let mut reply = message("ack", user("alice", None, false));
        reply.message_reference = Some(MessageReference {
            message_id: Some(MessageId(9)),
            channel_id: Some(ChannelId(20)),
            guild_id: Some(GuildId(30)),
        });
        reply.referenced_message = Some(Box::new(referenced));

        let (to, text) = detect_reply(&reply).unwrap();
        assert_eq!(to, "Bob");
        assert_eq!(text.chars().count(), 180);
    }

    #[test]
    fn cross_guild_reference_is_forwarded() {
        let mut referenced = message("original", user("bob", Some("Bob"), false));
        referenced.guild_id = Some(GuildId(99));
        referenced.embeds = vec![Embed { title: Some("one".into()), ..Embed::default() }];
        let mut forward = message("", user("alice", None, false));
        forward.message_reference = Some(MessageReference {
            message_id: Some(MessageId(9)),
            channel_id: Some(ChannelId(21)),
            guild_id: Some(GuildId(99)),
        });
        forward.referenced_message = Some(Box::new(referenced));

        let info = detect_forward(&forward).unwrap();
        assert_eq!(info.from, "Bob");
        assert_eq!(info.embeds.len(), 1);
    }

    #[test]
    fn empty_quote_of_substantive_message_is_forwarded() {
        let mut referenced = message("", user("bob", None, false));
        referenced.attachments = vec![Attachment {
            id: AttachmentId(1),
            filename: "pic.png".into(),
            size: 10,
            url: "https://cdn.example/pic.png".into(),
            proxy_url: None,
            content_type: None,
        }];
        let mut forward = message("", user("alice", None, false));
        // same guild, so rule 1 does not fire
        forward.message_reference = Some(MessageReference {
            message_id: Some(MessageId(9)),
            channel_id: Some(ChannelId(20)),
            guild_id: Some(GuildId(30)),
        });
        forward.referenced_message = Some(Box::new(referenced));

        let info = detect_forward(&forward).unwrap();
        assert_eq!(info.attachments, vec!["https://cdn.example/pic.png".to_string()]);
    }

    #[test]
    fn typed_forward_marker_extracts_subject() {
        let m = message("Forwarded from: SneakerNews\ncheck this", user("alice", None, false));
        let info = detect_forward(&m).unwrap();
        assert_eq!(info.from, "SneakerNews");

        let m = message("originally from @DropAlerts", user("alice", None, false));
        assert_eq!(detect_forward(&m).unwrap().from, "DropAlerts");
    }

    #[test]
    fn crosspost_is_not_forwarded() {
        let mut m = message("announcement", user("newsbot", None, true));
        m.application_id = Some(ApplicationId(5));
        assert!(detect_forward(&m).is_none());
    }

    #[test]
    fn canonical_payload_parses() {
        let payload: NormalizedMessage = serde_json::from_str(r#"{
  "message_type": "regular",
  "message_id": "10", "channel_id": "20", "channel_name": "general",
  "category_name": "INFO", "server_id": "30", "server_name": "s1",
  "content": "hi", "author_id": "1", "author_name": "Alice",
  "author_avatar": null, "timestamp": "2025-05-02T00:00:00Z",
  "attachments": [], "embeds": [],
  "mentioned_roles": {"7": "traders"},
  "reply_to": null, "reply_text": null,
  "forwarded_from": null, "forwarded_attachments": [],
  "is_forwarded": false,
  "channel_real_name": "general", "server_real_name": "s1"
}"#).unwrap();
        assert!(!payload.is_dm());
        assert_eq!(payload.mentioned_roles.get("7").unwrap(), "traders");
    }
}
