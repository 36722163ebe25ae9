//! The `snowflake` types Discord uses to identify different objects.

use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error;

use crate::model::ids::sealed::IsId;

const DISCORD_EPOCH: u64 = 1_420_070_400_000;

macro_rules! id_impl {
    ($($id:tt),+ $(,)?) => {
        $(
            #[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
            pub struct $id(pub u64);

            impl $id {
                /// The creation time encoded in the snowflake. The retention
                /// loop uses this as the fallback channel age when the store's
                /// ttl key has expired.
                pub fn timestamp(&self) -> DateTime<Utc> {
                    let millis = (self.0 >> 22) + DISCORD_EPOCH;
                    let seconds = millis / 1000;
                    let nanos = (millis % 1000) * 1_000_000;

                    let dt = NaiveDateTime::from_timestamp(seconds as _, nanos as _);
                    DateTime::from_utc(dt, Utc)
                }
            }

            impl Display for $id {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $id {
                type Err = ParseIntError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Ok(Self(s.parse()?))
                }
            }

            impl<'de> Deserialize<'de> for $id {
                fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                    struct IdVisitor;

                    impl<'de> ::serde::de::Visitor<'de> for IdVisitor {
                        type Value = $id;

                        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                            write!(f, "a string ({})", stringify!($id))
                        }

                        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }

                        fn visit_borrowed_str<E>(self, v: &'de str) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }

                        fn visit_string<E>(self, v: String) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }
                    }

                    d.deserialize_str(IdVisitor)
                }
            }

            impl Serialize for $id {
                fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                    let str = self.0.to_string();
                    s.serialize_str(&str)
                }
            }

            impl sealed::IsId for $id {}

            impl Id for $id {
                type Id = Self;

                fn id(&self) -> Self { *self }
            }
        )+
    };
}

id_impl!(
    GuildId,
    ChannelId,
    UserId,
    MessageId,
    AttachmentId,
    ApplicationId,
    WebhookId,
    RoleId,
);

mod sealed {
    pub trait IsId: Copy + Send + Sync + 'static {}
}

/// Anything with an id of type [`Self::Id`].
pub trait Id {
    type Id: IsId + Eq;

    fn id(&self) -> Self::Id;
}

impl<I: Id> Id for &I {
    type Id = I::Id;

    fn id(&self) -> Self::Id {
        (*self).id()
    }
}

/// `PartialEq` by id for model types.
macro_rules! id_eq {
    ($id:ty) => {
        impl PartialEq for $id {
            fn eq(&self, other: &Self) -> bool {
                use $crate::model::ids::Id;
                self.id() == other.id()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_as_strings() {
        let id: ChannelId = serde_json::from_str(r#""492122906864779276""#).unwrap();
        assert_eq!(id, ChannelId(492_122_906_864_779_276));
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""492122906864779276""#);
    }

    #[test]
    fn snowflake_timestamp() {
        // 2015-01-01T00:00:00 is the Discord epoch
        let id = ChannelId(0);
        assert_eq!(id.timestamp().timestamp_millis() as u64, DISCORD_EPOCH);
    }
}
