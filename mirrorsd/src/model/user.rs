use serde::{Deserialize, Serialize};

use crate::model::ids::*;
pub use crate::model::ids::UserId;

/// Users in Discord are generally considered the base entity. This carries the
/// subset of fields the mirror needs; notably `global_name`, which takes
/// precedence when choosing a display name.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    /// the user's id
    pub id: UserId,
    /// the user's username, not unique across the platform
    pub username: String,
    /// the user's 4-digit discord-tag, `"0"` for migrated users
    #[serde(default)]
    pub discriminator: String,
    /// the user's display name, if it is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_name: Option<String>,
    /// the user's avatar hash
    pub avatar: Option<String>,
    /// whether the user belongs to an OAuth2 application
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot: Option<bool>,
}

id_eq!(User);
impl Id for User {
    type Id = UserId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl User {
    pub fn is_bot(&self) -> bool {
        self.bot == Some(true)
    }

    /// The url where this user's avatar can be retrieved from Discord, if they
    /// have one. Always requested as png; animated avatars fall back to the
    /// first frame, which is all a webhook needs.
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref()
            .map(|avatar| cdn!("avatars/{}/{}.png", self.id, avatar))
    }

    /// `username#1234`, or just `username` for migrated (`#0`) users.
    pub fn tag(&self) -> String {
        if self.discriminator.is_empty() || self.discriminator == "0" {
            self.username.clone()
        } else {
            format!("{}#{}", self.username, self.discriminator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrated_user_tag_drops_discriminator() {
        let user: User = serde_json::from_str(r#"{
  "id": "82198898841029460",
  "username": "alice",
  "discriminator": "0",
  "global_name": "Alice",
  "avatar": null
}"#).unwrap();
        assert_eq!(user.tag(), "alice");
        assert!(!user.is_bot());
    }

    #[test]
    fn legacy_user_tag() {
        let user: User = serde_json::from_str(r#"{
  "id": "82198898841029460",
  "username": "test",
  "discriminator": "9999",
  "avatar": "33ecab261d4681afa4d85a04691c4a01",
  "bot": true
}"#).unwrap();
        assert_eq!(user.tag(), "test#9999");
        assert!(user.is_bot());
        assert_eq!(
            user.avatar_url().unwrap(),
            "https://cdn.discordapp.com/avatars/82198898841029460/33ecab261d4681afa4d85a04691c4a01.png",
        );
    }
}
