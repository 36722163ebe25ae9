//! The operator command registry. Commands arrive as ordinary messages in
//! the destination guild (`!name args...`); every mutation is written through
//! the config file so the watcher propagates it to the rest of the system.

use itertools::Itertools;
use log::info;

use crate::errors::MirrorError;
use crate::layout;
use crate::model::ids::ChannelId;
use crate::model::message::{CreateMessage, Embed, EmbedField, Message};
use crate::republisher::Republisher;

const PREFIX: char = '!';

/// name, usage, description. The single source for dispatch and `!help`.
const COMMANDS: &[(&str, &str, &str)] = &[
    ("ping", "!ping", "liveness check"),
    ("help", "!help", "list commands"),
    ("status", "!status", "processed count, routes, and session uptime"),
    ("debug", "!debug", "metadata for the current channel"),
    ("servers", "!servers", "monitored server list"),
    ("block", "!block <server_id> <channel_id>", "exclude a source channel"),
    ("unblock", "!unblock <server_id> <channel_id>", "remove a source channel exclusion"),
    ("listblocked", "!listblocked", "list excluded channels per server"),
    ("protect", "!protect [channel_id]", "exempt a destination channel from deletion"),
    ("unprotect", "!unprotect [channel_id]", "remove a deletion exemption"),
    ("listprotected", "!listprotected", "list protected channels"),
    ("dmstats", "!dmstats", "DM mirror statistics"),
    ("dmfilters", "!dmfilters", "active DM filter thresholds"),
    ("update", "!update <text>", "post a versioned update embed"),
    ("capture_layout", "!capture_layout", "snapshot the destination layout to disk"),
    ("organize_channels", "!organize_channels", "run the organizer once"),
];

/// Try to interpret `message` as an operator command. Returns whether it was
/// one (and was answered).
pub async fn dispatch(rep: &Republisher, message: &Message) -> Result<bool, MirrorError> {
    let content = message.content.trim();
    if !content.starts_with(PREFIX) {
        return Ok(false);
    }
    let mut words = content[1..].split_whitespace();
    let Some(name) = words.next() else { return Ok(false) };
    let name = name.to_lowercase();
    if !COMMANDS.iter().any(|(n, _, _)| *n == name) {
        return Ok(false);
    }
    let args: Vec<&str> = words.collect();

    info!("command {name} from {}", message.author.tag());
    let reply = run(rep, &name, &args, message).await?;
    if let Some(reply) = reply {
        rep.client.create_message(message.channel_id, reply).await.map_err(MirrorError::from)?;
    }
    Ok(true)
}

async fn run(
    rep: &Republisher,
    name: &str,
    args: &[&str],
    message: &Message,
) -> Result<Option<CreateMessage>, MirrorError> {
    let config = rep.snapshot();
    let reply = match name {
        "ping" => CreateMessage::text("pong"),
        "help" => CreateMessage::text(
            COMMANDS.iter()
                .map(|(_, usage, what)| format!("`{usage}` - {what}"))
                .join("\n"),
        ),
        "status" => {
            let uptime = rep.started_at.elapsed();
            let routes = rep.store.all_webhooks().await.len();
            let instances = rep.store.bot_instances().await.map(|m| m.len()).unwrap_or(0);
            CreateMessage::text(format!(
                "processed {} messages, {} routes, {} collector sessions, up {}h{:02}m",
                rep.processed_count(),
                routes,
                instances,
                uptime.as_secs() / 3600,
                (uptime.as_secs() % 3600) / 60,
            ))
        }
        "debug" => {
            match rep.destination_channel_info(message.channel_id).await {
                Some(channel) => CreateMessage::text(format!(
                    "id: {}\nname: {}\nkind: {:?}\nparent: {}",
                    channel.id,
                    channel.name(),
                    channel.kind,
                    channel.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string()),
                )),
                None => CreateMessage::text("channel not in the destination cache"),
            }
        }
        "servers" => {
            let mut lines = Vec::new();
            for (token, data) in &config.tokens {
                let who = data.user_info.as_ref().map(|i| i.name.clone())
                    .unwrap_or_else(|| format!("{}...", token.chars().take(8).collect::<String>()));
                for server in data.servers.keys() {
                    lines.push(format!("{server} (via {who})"));
                }
            }
            if lines.is_empty() {
                CreateMessage::text("no monitored servers")
            } else {
                CreateMessage::text(lines.join("\n"))
            }
        }
        "block" | "unblock" => {
            let (Some(server), Some(channel)) = (args.first(), args.get(1)) else {
                return Ok(Some(CreateMessage::text("usage: !block <server_id> <channel_id>")));
            };
            let Ok(channel) = channel.parse::<ChannelId>() else {
                return Ok(Some(CreateMessage::text("bad channel id")));
            };
            let server = (*server).to_string();
            let blocking = name == "block";
            rep.config_file.update(|config| {
                for data in config.tokens.values_mut() {
                    if let Some(monitored) = data.servers.get_mut(&server) {
                        if blocking {
                            monitored.excluded_channels.insert(channel);
                        } else {
                            monitored.excluded_channels.remove(&channel);
                        }
                    }
                }
            }).await?;
            CreateMessage::text(format!(
                "{} {channel} in {server}",
                if blocking { "blocked" } else { "unblocked" },
            ))
        }
        "listblocked" => {
            let mut lines = Vec::new();
            for data in config.tokens.values() {
                for (server, monitored) in &data.servers {
                    if !monitored.excluded_channels.is_empty() || !monitored.excluded_categories.is_empty() {
                        lines.push(format!(
                            "{server}: {} channels, {} categories excluded",
                            monitored.excluded_channels.len(),
                            monitored.excluded_categories.len(),
                        ));
                    }
                }
            }
            if lines.is_empty() {
                CreateMessage::text("nothing blocked")
            } else {
                CreateMessage::text(lines.join("\n"))
            }
        }
        "protect" | "unprotect" => {
            let target = match args.first() {
                Some(arg) => match arg.parse::<ChannelId>() {
                    Ok(id) => id,
                    Err(_) => return Ok(Some(CreateMessage::text("bad channel id"))),
                },
                None => message.channel_id,
            };
            let protecting = name == "protect";
            rep.config_file.update(|config| {
                if protecting {
                    if !config.protected_channels.contains(&target) {
                        config.protected_channels.push(target);
                    }
                } else {
                    config.protected_channels.retain(|id| *id != target);
                }
            }).await?;
            CreateMessage::text(format!(
                "{} {target}",
                if protecting { "protected" } else { "unprotected" },
            ))
        }
        "listprotected" => {
            if config.protected_channels.is_empty() {
                CreateMessage::text("no protected channels")
            } else {
                let lines: Vec<String> = config.protected_channels.iter()
                    .map(|id| format!("<#{id}> ({id})"))
                    .collect();
                CreateMessage::text(lines.join("\n"))
            }
        }
        "dmstats" => {
            let enabled = config.tokens.values().filter(|t| t.dm_mirroring.enabled).count();
            CreateMessage::text(format!(
                "{} DM mirror channels mapped, {} tokens with DM mirroring enabled",
                config.dm_mappings.len(),
                enabled,
            ))
        }
        "dmfilters" => CreateMessage::text(
            "DM filter: peers in monitored guilds always pass; otherwise rejected on \
             2+ spam keywords, more than one link, more than 10 emoji, more than 500 \
             characters, or fewer than 2 mutual guilds.",
        ),
        "update" => {
            let Some(channel) = config.updates_channel_id else {
                return Ok(Some(CreateMessage::text("no updates channel configured")));
            };
            let text = args.join(" ");
            if text.is_empty() {
                return Ok(Some(CreateMessage::text("usage: !update <text>")));
            }
            let embed = Embed {
                title: Some(format!("Update v{}", env!("CARGO_PKG_VERSION"))),
                description: Some(text),
                fields: vec![EmbedField {
                    name: "Posted by".to_string(),
                    value: message.author.tag(),
                }],
                ..Embed::default()
            };
            rep.client.create_message(channel, CreateMessage::embed(embed)).await
                .map_err(MirrorError::from)?;
            CreateMessage::text("update posted")
        }
        "capture_layout" => {
            let guild = rep.router.destination_guild();
            let path = layout::capture_layout(&rep.client, guild).await?;
            CreateMessage::text(format!("layout captured to {}", path.display()))
        }
        "organize_channels" => {
            let guild = rep.router.destination_guild();
            let moved = layout::organize_once(&rep.client, guild).await?;
            CreateMessage::text(format!("organizer ran, {moved} channels adjusted"))
        }
        _ => return Ok(None),
    };
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_has_usage_starting_with_its_name() {
        for (name, usage, _) in COMMANDS {
            assert!(usage.starts_with(&format!("!{name}")), "{name} vs {usage}");
        }
    }

    #[test]
    fn command_names_are_unique() {
        let mut names: Vec<&str> = COMMANDS.iter().map(|(n, _, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COMMANDS.len());
    }
}
