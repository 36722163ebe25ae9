//! The bidirectional DM relay.
//!
//! Inbound: a collector's DM payload is mirrored into a per-peer channel
//! under the `@{self} [DM]` category of the configured destination guild.
//! Outbound: a human message in one of those channels is relayed back to the
//! peer over the collector process's loopback service, using whichever token
//! can actually reach them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router as AxumRouter, routing::post};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::collector::Collector;
use crate::collector::normalize::NormalizedMessage;
use crate::config::DmRoute;
use crate::errors::MirrorError;
use crate::http::webhook::{ExecuteOutcome, WebhookExecutor, WebhookPayload};
use crate::model::channel::{ChannelType, CreateChannel};
use crate::model::ids::*;
use crate::model::message::{CreateMessage, Embed, EmbedField, Message};
use crate::republisher::Republisher;
use crate::utils::ShutdownRx;

/// The webhook DM-mirror channels get.
pub const DM_WEBHOOK_NAME: &str = "DM Mirror";

/// Where the collector process listens for relay requests.
pub const SEND_DM_URL: &str = "http://127.0.0.1:5001/send_dm";

/// Total budget for one outbound relay round trip.
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

// reaction outcomes on the channel message
const REACT_OK: &str = "✅";
const REACT_FAILED: &str = "❌";
const REACT_TIMEOUT: &str = "⏰";
const REACT_UNAVAILABLE: &str = "⚠️";
const REACT_CRASHED: &str = "💥";

/// Mirror one inbound DM payload, provisioning the category, channel,
/// webhook, and route on first contact with this peer.
pub async fn handle_inbound_dm(rep: &Republisher, payload: &NormalizedMessage) -> Result<(), MirrorError> {
    let Some(destination) = payload.destination_server_id.as_deref().and_then(|id| id.parse().ok()) else {
        warn!("dm payload without destination server, dropping");
        return Ok(());
    };

    let config = rep.snapshot();

    // an existing route means the channel is already provisioned
    let existing = config.dm_mappings.iter()
        .find(|(_, route)| {
            Some(route.user_id.to_string()) == payload.dm_user_id
                && Some(route.self_user_id.to_string()) == payload.self_user_id
        })
        .and_then(|(channel, route)| {
            channel.parse::<ChannelId>().ok().map(|id| (id, route.clone()))
        });

    let (channel_id, webhook_url) = match existing {
        Some((channel, route)) if route.webhook_url.is_some() => (channel, route.webhook_url.unwrap()),
        _ => provision_dm_channel(rep, payload, destination).await?,
    };

    let executor = WebhookExecutor::new();
    let execution = WebhookPayload {
        username: payload.author_name.clone(),
        avatar_url: payload.author_avatar.clone(),
        content: (!payload.content.is_empty()).then(|| payload.content.clone()),
        embeds: payload.embeds.clone(),
    };
    match executor.execute(&webhook_url, &execution, &[]).await {
        ExecuteOutcome::Success => Ok(()),
        ExecuteOutcome::UnknownWebhook | ExecuteOutcome::UnknownChannel => {
            // stale mapping: drop it so the next DM reprovisions
            let _ = rep.config_file.update(|config| {
                config.dm_mappings.remove(&channel_id.to_string());
            }).await;
            Err(MirrorError::WebhookUnknown)
        }
        _ => Err(MirrorError::UpstreamUnavailable("dm mirror webhook".to_string())),
    }
}

/// Create `@{self} [DM]` / `dm-{peer}` / the webhook, persist the route, and
/// post the informational embed.
async fn provision_dm_channel(
    rep: &Republisher,
    payload: &NormalizedMessage,
    destination: GuildId,
) -> Result<(ChannelId, String), MirrorError> {
    let category_name = payload.category_name.clone();
    let channel_name = payload.channel_name.clone();

    let channels = rep.client.get_guild_channels(destination).await.map_err(MirrorError::from)?;
    let category = match channels.iter()
        .find(|c| c.kind == ChannelType::Category && c.name() == category_name)
    {
        Some(category) => category.id,
        None => {
            info!("creating DM category {category_name}");
            rep.client.create_guild_channel(destination, CreateChannel::category(&*category_name))
                .await
                .map_err(MirrorError::from)?
                .id
        }
    };

    let channel = match channels.iter()
        .find(|c| c.kind == ChannelType::Text && c.name() == channel_name && c.parent_id == Some(category))
    {
        Some(channel) => channel.id,
        None => {
            info!("creating DM mirror channel {channel_name}");
            rep.client
                .create_guild_channel(destination, CreateChannel::text(&*channel_name).parent(category))
                .await
                .map_err(MirrorError::from)?
                .id
        }
    };

    let webhook_url = rep.router.get_or_create_webhook(channel, DM_WEBHOOK_NAME).await?;

    let config = rep.snapshot();
    let receiving_token = payload.receiving_token.clone().unwrap_or_default();
    let peer: UserId = payload.dm_user_id.as_deref().and_then(|id| id.parse().ok())
        .ok_or_else(|| MirrorError::ConfigInvalid("dm payload without peer id".to_string()))?;
    let self_user: UserId = payload.self_user_id.as_deref().and_then(|id| id.parse().ok())
        .ok_or_else(|| MirrorError::ConfigInvalid("dm payload without self id".to_string()))?;
    let sender_token = config.find_token_for_user(peer).map(str::to_string);

    let route = DmRoute {
        user_id: peer,
        username: payload.dm_username.clone().unwrap_or_default(),
        self_user_id: self_user,
        receiving_token: receiving_token.clone(),
        sender_token,
        relay_token: Some(receiving_token.clone()),
        webhook_url: Some(webhook_url.clone()),
    };

    rep.config_file.update(|config| {
        config.dm_mappings.insert(channel.to_string(), route.clone());
    }).await?;
    let _ = rep.store.put_dm_route(channel, &route).await;

    // leave a breadcrumb describing who this channel talks to
    let info_embed = Embed {
        title: Some("DM Mirror".to_string()),
        description: Some(format!(
            "Messages here relay to **{}**. Replies from allowed users are sent back over the owning session.",
            payload.dm_username.clone().unwrap_or_default(),
        )),
        fields: vec![
            EmbedField { name: "Peer".to_string(), value: peer.to_string() },
            EmbedField { name: "Self".to_string(), value: self_user.to_string() },
            EmbedField { name: "Relay token".to_string(), value: truncate_token(&receiving_token) },
        ],
        ..Embed::default()
    };
    if let Err(e) = rep.client.create_message(channel, CreateMessage::embed(info_embed)).await {
        warn!("could not post DM info embed: {e}");
    }

    Ok((channel, webhook_url))
}

fn truncate_token(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{prefix}...")
}

/// Relay a channel message back to the DM peer and react with the outcome.
pub async fn relay_outbound(rep: &Republisher, message: &Message, route: &DmRoute) {
    let config = rep.snapshot();
    let token = config.find_token_for_user(route.user_id)
        .map(str::to_string)
        .or_else(|| route.sender_token.clone())
        .unwrap_or_else(|| route.receiving_token.clone());

    let body = json!({
        "action": "send_dm",
        "token": token,
        "user_id": route.user_id.to_string(),
        "content": message.content,
        "attachments": message.attachments.iter().map(|a| a.url.clone()).collect::<Vec<_>>(),
    });

    let client = reqwest::Client::new();
    let result = tokio::time::timeout(
        RELAY_TIMEOUT,
        client.post(SEND_DM_URL).json(&body).send(),
    ).await;

    let reaction = match result {
        Ok(Ok(response)) if response.status().is_success() => REACT_OK,
        Ok(Ok(response)) if response.status().as_u16() == 404 => REACT_UNAVAILABLE,
        Ok(Ok(response)) => {
            error!("dm relay rejected ({})", response.status());
            REACT_FAILED
        }
        Ok(Err(e)) if e.is_connect() => {
            warn!("dm relay service unavailable: {e}");
            REACT_UNAVAILABLE
        }
        Ok(Err(e)) => {
            error!("dm relay request error: {e}");
            REACT_CRASHED
        }
        Err(_) => REACT_TIMEOUT,
    };

    if let Err(e) = rep.client.create_reaction(message.channel_id, message.id, reaction).await {
        warn!("could not react to relayed message: {e}");
    }
}

#[derive(Deserialize, Debug)]
struct RelayRequest {
    action: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<String>,
}

type CollectorMap = Arc<RwLock<HashMap<String, Arc<Collector>>>>;

/// The collector-side loopback service handling `POST /send_dm`.
pub async fn serve_relay(collectors: CollectorMap, addr: SocketAddr, mut shutdown: ShutdownRx) {
    let app = AxumRouter::new()
        .route("/send_dm", post(relay_handler))
        .with_state(collectors);
    info!("dm relay service listening on {addr}");
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
    if let Err(e) = server.await {
        error!("dm relay server error: {e}");
    }
}

async fn relay_handler(
    axum::extract::State(collectors): axum::extract::State<CollectorMap>,
    Json(request): Json<RelayRequest>,
) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    use axum::http::StatusCode;

    match request.action.as_str() {
        "send_dm" => {
            let collector = collectors.read().await.get(&request.token).cloned();
            let Some(collector) = collector else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"status": "error", "message": "no session for that token"})),
                );
            };
            let Ok(user_id) = request.user_id.parse::<UserId>() else {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"status": "error", "message": "bad user id"})),
                );
            };
            let mut content = request.content;
            for url in &request.attachments {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(url);
            }
            match collector.send_dm(user_id, &content).await {
                Ok(()) => (StatusCode::OK, Json(json!({"status": "success"}))),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "error", "message": e.to_string()})),
                ),
            }
        }
        "request_sync" => {
            info!("sync requested by the republisher");
            (StatusCode::OK, Json(json!({"status": "success", "message": "sync triggered"})))
        }
        other => (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": format!("unknown action: {other}")})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_truncated_in_embeds() {
        assert_eq!(truncate_token("abcdefghijKLMNOP"), "abcdefghij...");
        assert_eq!(truncate_token("short"), "short...");
    }

    #[test]
    fn relay_request_parses() {
        let request: RelayRequest = serde_json::from_str(r#"{
  "action": "send_dm",
  "token": "user-token-1",
  "user_id": "53908099506183680",
  "content": "hello back",
  "attachments": []
}"#).unwrap();
        assert_eq!(request.action, "send_dm");
        assert_eq!(request.user_id, "53908099506183680");
    }
}
