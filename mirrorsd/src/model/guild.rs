use serde::{Deserialize, Serialize};

use crate::model::channel::Channel;
use crate::model::ids::*;
pub use crate::model::ids::GuildId;
use crate::model::message::PartialMember;
use crate::model::user::User;

/// A guild, as delivered by the GUILD_CREATE dispatch. Collectors keep one of
/// these per monitored server for name lookups, channel-mention resolution,
/// and the mutual-guild checks in the DM filter.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Guild {
    pub id: GuildId,
    /// missing in the unavailable-guild stubs sent before the full dispatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<GuildMember>,
    #[serde(default)]
    pub unavailable: bool,
}

id_eq!(Guild);
impl Id for Guild {
    type Id = GuildId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Guild {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Roles represent a set of permissions attached to a group of users. Only
/// names and ids matter here; the republisher never creates roles, it only
/// looks existing ones up by name.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    #[serde(default)]
    pub position: i32,
}

id_eq!(Role);
impl Id for Role {
    type Id = RoleId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GuildMember {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(flatten)]
    pub member: PartialMember,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_guild_stub() {
        let guild: Guild = serde_json::from_str(r#"{"id": "41771983423143937", "unavailable": true}"#).unwrap();
        assert!(guild.unavailable);
        assert_eq!(guild.name(), "41771983423143937");
    }

    #[test]
    fn guild_create() {
        let guild: Guild = serde_json::from_str(r#"{
  "id": "197038439483310086",
  "name": "Discord Testers",
  "roles": [{"id": "197038439483310087", "name": "Testers", "position": 1}],
  "channels": [
    {"type": 4, "id": "399942396007890945", "name": "INFO", "position": 0},
    {"type": 0, "id": "399942396007890946", "name": "general", "position": 1, "parent_id": "399942396007890945"}
  ],
  "members": [
    {"user": {"id": "53908099506183680", "username": "mason", "discriminator": "0", "avatar": null}, "roles": []}
  ]
}"#).unwrap();
        assert_eq!(guild.name(), "Discord Testers");
        assert_eq!(guild.channels.len(), 2);
        assert_eq!(guild.members[0].user.as_ref().unwrap().username, "mason");
    }
}
