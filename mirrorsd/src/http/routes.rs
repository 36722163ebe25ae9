use Route::*;

use crate::model::ids::*;

#[derive(Debug, Clone)]
pub enum Route {
    // general
    GetGateway,
    GetGatewayBot,

    // channels
    GetChannel(ChannelId),
    EditChannel(ChannelId),
    DeleteChannel(ChannelId),
    GetGuildChannels(GuildId),
    CreateGuildChannel(GuildId),

    // messages
    GetMessage(ChannelId, MessageId),
    PostMessage(ChannelId),
    CreateReaction(ChannelId, MessageId, String),

    // webhooks
    GetChannelWebhooks(ChannelId),
    CreateWebhook(ChannelId),

    // threads
    StartForumThread(ChannelId),

    // users
    GetUser(UserId),
    CreateDm,

    // guilds
    GetGuildRoles(GuildId),
}

impl Route {
    pub fn url(&self) -> String {
        match self {
            GetGateway => api!("/gateway"),
            GetGatewayBot => api!("/gateway/bot"),

            GetChannel(c) => api!("/channels/{}", c),
            EditChannel(c) => api!("/channels/{}", c),
            DeleteChannel(c) => api!("/channels/{}", c),
            GetGuildChannels(g) => api!("/guilds/{}/channels", g),
            CreateGuildChannel(g) => api!("/guilds/{}/channels", g),

            GetMessage(c, m) => api!("/channels/{}/messages/{}", c, m),
            PostMessage(c) => api!("/channels/{}/messages", c),
            CreateReaction(c, m, e) => api!("/channels/{}/messages/{}/reactions/{}/@me", c, m, e),

            GetChannelWebhooks(c) => api!("/channels/{}/webhooks", c),
            CreateWebhook(c) => api!("/channels/{}/webhooks", c),

            StartForumThread(c) => api!("/channels/{}/threads", c),

            GetUser(u) => api!("/users/{}", u),
            CreateDm => api!("/users/@me/channels"),

            GetGuildRoles(g) => api!("/guilds/{}/roles", g),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        assert_eq!(GetGateway.url(), "https://discord.com/api/v10/gateway");
        assert_eq!(
            CreateGuildChannel(GuildId(197_038_439_483_310_086)).url(),
            "https://discord.com/api/v10/guilds/197038439483310086/channels",
        );
        assert_eq!(
            CreateReaction(ChannelId(1), MessageId(2), "✅".to_string()).url(),
            "https://discord.com/api/v10/channels/1/messages/2/reactions/✅/@me",
        );
    }
}
