//! Discord API requests involving channels, webhooks, and the handful of
//! guild/user endpoints the mirror needs.

use serde::Serialize;

use crate::http::ClientResult;
use crate::http::DiscordClient;
use crate::http::routes::Route::*;
use crate::model::channel::{Channel, CreateChannel, ModifyChannel, Webhook};
use crate::model::guild::Role;
use crate::model::ids::*;
use crate::model::message::{CreateMessage, Message};
use crate::model::user::User;

/// Channel related http requests
impl DiscordClient {
    /// Get a channel by ID. Returns a [`Channel`] object.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Channel`
    pub async fn get_channel(&self, id: ChannelId) -> ClientResult<Channel> {
        self.get(GetChannel(id)).await
    }

    /// List a guild's channels (no threads).
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Vec<Channel>`
    pub async fn get_guild_channels(&self, guild: GuildId) -> ClientResult<Vec<Channel>> {
        self.get(GetGuildChannels(guild)).await
    }

    /// Create a text channel or category in the guild. Requires the
    /// `MANAGE_CHANNELS` permission.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Channel`
    pub async fn create_guild_channel(&self, guild: GuildId, channel: CreateChannel) -> ClientResult<Channel> {
        self.post(CreateGuildChannel(guild), &channel).await
    }

    /// Update a channel's settings; the organizer loop only ever edits
    /// position and parent.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Channel`
    pub async fn modify_channel(&self, id: ChannelId, modify: ModifyChannel) -> ClientResult<Channel> {
        self.patch(EditChannel(id), &modify).await
    }

    /// Delete a channel. Requires the `MANAGE_CHANNELS` permission.
    ///
    /// # Errors
    ///
    /// If the http request fails
    pub async fn delete_channel(&self, id: ChannelId) -> ClientResult<()> {
        self.delete(DeleteChannel(id)).await
    }

    /// Returns a specific message in the channel, used to resolve replies the
    /// gateway didn't resolve for us.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Message`.
    pub async fn get_message(&self, channel: ChannelId, message: MessageId) -> ClientResult<Message> {
        self.get(GetMessage(channel, message)).await
    }

    /// Post a message in the specified channel
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Message`.
    pub async fn create_message(&self, channel: ChannelId, message: CreateMessage) -> ClientResult<Message> {
        self.post(PostMessage(channel), &message).await
    }

    /// React to a message with a unicode emoji. The DM relay uses this to
    /// report outcomes on the mirrored channel message.
    ///
    /// # Errors
    ///
    /// If the http request fails
    pub async fn create_reaction(&self, channel: ChannelId, message: MessageId, emoji: &str) -> ClientResult<()> {
        self.put_unit(CreateReaction(channel, message, emoji.to_string()), &"").await
    }
}

/// Webhook and thread requests
impl DiscordClient {
    /// List the webhooks of a channel. Requires the `MANAGE_WEBHOOKS`
    /// permission.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Vec<Webhook>`
    pub async fn get_channel_webhooks(&self, channel: ChannelId) -> ClientResult<Vec<Webhook>> {
        self.get(GetChannelWebhooks(channel)).await
    }

    /// Create an incoming webhook on the channel. Requires the
    /// `MANAGE_WEBHOOKS` permission.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Webhook`
    pub async fn create_webhook(&self, channel: ChannelId, name: &str) -> ClientResult<Webhook> {
        #[derive(Serialize)]
        struct CreateWebhookBody<'a> {
            name: &'a str,
        }
        self.post(CreateWebhook(channel), &CreateWebhookBody { name }).await
    }

    /// Start a thread in a forum channel with a starter message. Returns the
    /// created thread channel.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Channel`
    pub async fn start_forum_thread(
        &self,
        forum: ChannelId,
        name: &str,
        starter: CreateMessage,
    ) -> ClientResult<Channel> {
        #[derive(Serialize)]
        struct StartThreadBody<'a> {
            name: &'a str,
            message: &'a CreateMessage,
        }
        self.post(StartForumThread(forum), &StartThreadBody { name, message: &starter }).await
    }
}

/// User requests
impl DiscordClient {
    /// Get a user by id.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `User`
    pub async fn get_user(&self, user: UserId) -> ClientResult<User> {
        self.get(GetUser(user)).await
    }

    /// Open (or fetch the existing) DM channel with a user.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Channel`
    pub async fn create_dm(&self, recipient: UserId) -> ClientResult<Channel> {
        #[derive(Serialize)]
        struct CreateDmBody {
            recipient_id: UserId,
        }
        self.post(CreateDm, &CreateDmBody { recipient_id: recipient }).await
    }

    /// List a guild's roles, for the by-name lookups the embed renderer does.
    ///
    /// # Errors
    ///
    /// If the http request fails, or fails to deserialize the response into a `Vec<Role>`
    pub async fn get_guild_roles(&self, guild: GuildId) -> ClientResult<Vec<Role>> {
        self.get(GetGuildRoles(guild)).await
    }
}
