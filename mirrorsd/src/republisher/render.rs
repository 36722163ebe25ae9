//! Turning a queue payload into webhook content: reply and forward headers,
//! mention rewriting, and the 2000-character split.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::collector::normalize::NormalizedMessage;
use crate::model::ids::{ChannelId, RoleId};

/// Discord caps message content at 2000 characters; parts aim lower to leave
/// headroom for headers added later.
const HARD_LIMIT: usize = 2000;
const PART_TARGET: usize = 1900;

static ROLE_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@&(\d+)>").unwrap());
static CHANNEL_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<#(\d+)>").unwrap());

/// How `<#id>` mentions resolve on the destination side.
pub struct MentionContext<'a> {
    /// source channel id -> destination channel id
    pub channel_map: &'a HashMap<ChannelId, ChannelId>,
    /// destination guild roles, for the embed-description lookups
    pub roles_by_name: &'a HashMap<String, RoleId>,
}

/// Rewrite mentions in message content. Role mentions always become bold
/// plain text (creating roles to satisfy them would run into Discord's role
/// ceiling); channel mentions become the destination channel when one is
/// mapped, else a readable `server > #channel` literal; user mentions pass
/// through untouched.
pub fn rewrite_content_mentions(
    content: &str,
    payload: &NormalizedMessage,
    ctx: &MentionContext<'_>,
) -> String {
    let content = ROLE_MENTION.replace_all(content, |captures: &regex::Captures| {
        match payload.mentioned_roles.get(&captures[1]) {
            Some(name) => format!("**@{name}**"),
            None => captures[0].to_string(),
        }
    });
    CHANNEL_MENTION.replace_all(&content, |captures: &regex::Captures| {
        let source: Option<ChannelId> = captures[1].parse().ok();
        if let Some(destination) = source.and_then(|id| ctx.channel_map.get(&id)) {
            return format!("<#{destination}>");
        }
        match payload.mentioned_channels.get(&captures[1]) {
            Some(name) => format!("`{} > #{name}`", payload.server_name),
            None => captures[0].to_string(),
        }
    }).into_owned()
}

/// Rewrite mentions inside an embed description. Unlike content, an embed may
/// reuse an existing destination role by case-insensitive name; there is
/// still no role creation.
pub fn rewrite_embed_mentions(
    description: &str,
    payload: &NormalizedMessage,
    ctx: &MentionContext<'_>,
) -> String {
    let description = ROLE_MENTION.replace_all(description, |captures: &regex::Captures| {
        let Some(name) = payload.mentioned_roles.get(&captures[1]) else {
            return captures[0].to_string();
        };
        match ctx.roles_by_name.get(&name.to_lowercase()) {
            Some(role) => format!("<@&{role}>"),
            None => format!("@{name}"),
        }
    });
    CHANNEL_MENTION.replace_all(&description, |captures: &regex::Captures| {
        let source: Option<ChannelId> = captures[1].parse().ok();
        if let Some(destination) = source.and_then(|id| ctx.channel_map.get(&id)) {
            return format!("<#{destination}>");
        }
        match payload.mentioned_channels.get(&captures[1]) {
            Some(name) => format!("`{} > #{name}`", payload.server_name),
            None => captures[0].to_string(),
        }
    }).into_owned()
}

/// The reply header: quoted author, then each line of the reply text quoted.
pub fn reply_header(reply_to: &str, reply_text: &str) -> String {
    let mut header = format!("> **{reply_to}**\n");
    for line in reply_text.lines() {
        header.push_str("> ");
        header.push_str(line);
        header.push('\n');
    }
    header
}

pub fn forward_header(subject: &str) -> String {
    format!("📤 **Forwarded from:** {subject}\n")
}

/// Assemble the final content: forward header, reply header, rewritten body.
pub fn render_content(payload: &NormalizedMessage, ctx: &MentionContext<'_>) -> String {
    let mut content = String::new();
    if let Some(subject) = payload.forwarded_from.as_deref() {
        content.push_str(&forward_header(subject));
    }
    if let (Some(reply_to), Some(reply_text)) = (payload.reply_to.as_deref(), payload.reply_text.as_deref()) {
        content.push_str(&reply_header(reply_to, reply_text));
    }
    content.push_str(&rewrite_content_mentions(&payload.content, payload, ctx));
    content
}

/// Split content into sendable parts. Content at or under the hard limit is a
/// single part. Longer content splits at line boundaries into parts around
/// [`PART_TARGET`]; a single line that exceeds the hard limit splits at word
/// boundaries, and an unbreakable run splits at the hard limit itself.
pub fn split_content(content: &str) -> Vec<String> {
    if content.chars().count() <= HARD_LIMIT {
        return vec![content.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for line in content.split('\n') {
        let line_len = line.chars().count();
        let current_len = current.chars().count();
        if current_len > 0 && current_len + 1 + line_len > PART_TARGET {
            parts.push(std::mem::take(&mut current));
        }
        if line_len > HARD_LIMIT {
            split_long_line(line, &mut parts, &mut current);
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts.retain(|part| !part.trim().is_empty());
    parts
}

fn split_long_line(line: &str, parts: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        parts.push(std::mem::take(current));
    }
    let mut chunk = String::new();
    for word in line.split(' ') {
        let word_len = word.chars().count();
        let chunk_len = chunk.chars().count();
        if word_len > HARD_LIMIT {
            // unbreakable: hard-split at the limit
            if !chunk.is_empty() {
                parts.push(std::mem::take(&mut chunk));
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(HARD_LIMIT) {
                let piece: String = piece.iter().collect();
                if piece.chars().count() == HARD_LIMIT {
                    parts.push(piece);
                } else {
                    chunk = piece;
                }
            }
        } else if chunk_len > 0 && chunk_len + 1 + word_len > PART_TARGET {
            parts.push(std::mem::take(&mut chunk));
            chunk.push_str(word);
        } else {
            if !chunk.is_empty() {
                chunk.push(' ');
            }
            chunk.push_str(word);
        }
    }
    *current = chunk;
}

/// The archive-trigger author.
pub const ARCHIVE_AUTHOR: &str = "Polar Helper";

/// Whether this payload is an archive trigger: the destination channel should
/// be deleted instead of the message being mirrored.
pub fn is_archive_trigger(payload: &NormalizedMessage) -> bool {
    let content = payload.content.trim().to_lowercase();
    if content == "!archive" || content == "channel archive" {
        return true;
    }
    if content.contains("archived to forum thread") {
        return true;
    }
    if payload.author_name.starts_with(ARCHIVE_AUTHOR) {
        if content.contains("channel archive") {
            return true;
        }
        if payload.embeds.iter().any(|e| e.text().to_lowercase().contains("channel archive")) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn payload() -> NormalizedMessage {
        NormalizedMessage {
            server_name: "s1".to_string(),
            ..NormalizedMessage::default()
        }
    }

    fn empty_ctx() -> (HashMap<ChannelId, ChannelId>, HashMap<String, RoleId>) {
        (HashMap::new(), HashMap::new())
    }

    #[test]
    fn reply_header_quotes_every_line() {
        let mut p = payload();
        p.reply_to = Some("Bob".into());
        p.reply_text = Some("hello world\nsecond".into());
        p.content = "ack".into();
        let (channels, roles) = empty_ctx();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "> **Bob**\n> hello world\n> second\nack");
    }

    #[test]
    fn forward_header_prefixes() {
        let mut p = payload();
        p.forwarded_from = Some("SneakerNews".into());
        p.content = String::new();
        let (channels, roles) = empty_ctx();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "📤 **Forwarded from:** SneakerNews\n");
    }

    #[test]
    fn role_mentions_render_bold() {
        let mut p = payload();
        p.mentioned_roles.insert("7".into(), "traders".into());
        p.content = "ping <@&7> now".into();
        let (channels, roles) = empty_ctx();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "ping **@traders** now");
    }

    #[test]
    fn embed_role_mentions_prefer_existing_destination_role() {
        let mut p = payload();
        p.mentioned_roles.insert("7".into(), "Traders".into());
        let channels = HashMap::new();
        let mut roles = HashMap::new();
        roles.insert("traders".to_string(), RoleId(99));
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(rewrite_embed_mentions("go <@&7>", &p, &ctx), "go <@&99>");

        let no_roles = HashMap::new();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &no_roles };
        assert_eq!(rewrite_embed_mentions("go <@&7>", &p, &ctx), "go @Traders");
    }

    #[test]
    fn channel_mentions_map_or_fall_back_to_literal() {
        let mut p = payload();
        p.mentioned_channels.insert("123".into(), "restocks".into());
        p.content = "see <#123> and <#999>".into();
        let mut channels = HashMap::new();
        channels.insert(ChannelId(123), ChannelId(555));
        let roles = HashMap::new();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "see <#555> and <#999>");

        let empty = HashMap::new();
        let ctx = MentionContext { channel_map: &empty, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "see `s1 > #restocks` and <#999>");
    }

    #[test]
    fn user_mentions_pass_through() {
        let mut p = payload();
        p.content = "hey <@42>".into();
        let (channels, roles) = empty_ctx();
        let ctx = MentionContext { channel_map: &channels, roles_by_name: &roles };
        assert_eq!(render_content(&p, &ctx), "hey <@42>");
    }

    #[test]
    fn content_at_limit_is_one_part() {
        let content = "a".repeat(2000);
        assert_eq!(split_content(&content), vec![content]);
    }

    #[test]
    fn content_over_limit_with_no_breaks_hard_splits() {
        let content = "a".repeat(2001);
        let parts = split_content(&content);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), 2000);
        assert_eq!(parts[1], "a");
    }

    #[test]
    fn content_splits_at_line_boundaries() {
        let line = "b".repeat(600);
        let content = format!("{line}\n{line}\n{line}\n{line}");
        let parts = split_content(&content);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.chars().count() <= 1900));
        assert_eq!(parts[0], format!("{line}\n{line}\n{line}"));
    }

    #[test]
    fn long_single_line_splits_at_word_boundaries() {
        let word = "c".repeat(100);
        let words: Vec<String> = (0..30).map(|_| word.clone()).collect();
        let content = words.join(" ");
        let parts = split_content(&content);
        assert!(parts.len() >= 2);
        assert!(parts.iter().all(|p| p.chars().count() <= 1900));
        assert!(parts.iter().all(|p| !p.starts_with(' ') && !p.ends_with(' ')));
    }

    #[test]
    fn archive_triggers() {
        let mut p = payload();
        p.content = "!archive".into();
        assert!(is_archive_trigger(&p));

        let mut p = payload();
        p.author_name = "Polar Helper".into();
        p.embeds = vec![crate::model::message::Embed {
            title: Some("Channel Archive".into()),
            ..Default::default()
        }];
        assert!(is_archive_trigger(&p));

        let mut p = payload();
        p.author_name = "Somebody".into();
        p.content = "we should archive this channel".into();
        assert!(!is_archive_trigger(&p));
    }
}
