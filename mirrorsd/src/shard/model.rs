use std::convert::TryFrom;
use std::fmt::{self, Display};

use serde::{de, Deserialize, Serialize, Serializer};
use serde::ser::{Error, SerializeMap};
use serde_json::value::RawValue;

use crate::shard::dispatch::DispatchPayload;
use crate::shard::intents::Intents;

#[derive(Deserialize, Debug)]
#[serde(try_from = "RawPayload")]
pub(crate) enum Payload {
    /// Receive: An event was dispatched.
    Dispatch {
        event: DispatchPayload,
        seq_num: u64,
    },
    /// Send/Receive: Fired periodically by the client to keep the connection alive.
    Heartbeat(Heartbeat),
    /// Send: Starts a new session during the initial handshake.
    Identify(Identify),
    /// Send: Resume a previous session that was disconnected.
    Resume(Resume),
    /// Receive: You should attempt to reconnect and resume immediately.
    Reconnect,
    /// Receive: The session has been invalidated.
    ///
    /// The `bool` indicates whether the session may be resumable
    InvalidSession(bool),
    /// Receive: Sent immediately after connecting, contains the heartbeat_interval to use.
    Hello(HelloPayload),
    /// Receive: Sent in response to receiving a heartbeat to acknowledge that it has been received.
    HeartbeatAck,
}

impl Payload {
    const fn opcode(&self) -> u8 {
        match self {
            Self::Dispatch { .. } => 0,
            Self::Heartbeat(_) => 1,
            Self::Identify(_) => 2,
            Self::Resume(_) => 6,
            Self::Reconnect => 7,
            Self::InvalidSession(_) => 9,
            Self::Hello(_) => 10,
            Self::HeartbeatAck => 11,
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("op", &self.opcode())?;
        match &self {
            Self::Identify(identify) => map.serialize_entry("d", identify)?,
            Self::Heartbeat(Heartbeat { seq_num }) => map.serialize_entry("d", seq_num)?,
            Self::Resume(resume) => map.serialize_entry("d", resume)?,
            Self::Dispatch { .. }
            | Self::Reconnect
            | Self::InvalidSession(_)
            | Self::Hello(_)
            | Self::HeartbeatAck => return Err(S::Error::custom("should not be serialized")),
        };
        map.end()
    }
}

// Exists to mediate deserialization to Payload
#[derive(Deserialize)]
struct RawPayload<'a> {
    op: u8,
    d: Option<&'a RawValue>,
    s: Option<u64>,
    t: Option<&'a str>,
}

impl<'a> TryFrom<RawPayload<'a>> for Payload {
    type Error = crate::serde_utils::Error;

    fn try_from(raw: RawPayload<'a>) -> Result<Self, Self::Error> {
        use crate::serde_utils::nice_from_str;

        let RawPayload { op, d, s, t } = raw;
        let d = d.map(RawValue::get).unwrap_or("null");
        match op {
            0 => {
                // guaranteed to be present in dispatch events
                let s = s.ok_or_else(|| de::Error::custom("dispatch without `s`"))?;
                let t = t.ok_or_else(|| de::Error::custom("dispatch without `t`"))?;

                let json = format!(r#"{{"t":"{}","d":{}}}"#, t, d);
                match nice_from_str(&json) {
                    Ok(event) => Ok(Self::Dispatch { event, seq_num: s }),
                    Err(e) => Err(e),
                }
            }
            1 => {
                let seq_num = nice_from_str(d)?;
                Ok(Self::Heartbeat(Heartbeat { seq_num }))
            }
            7 => Ok(Self::Reconnect),
            9 => {
                let resumable = nice_from_str(d)?;
                Ok(Self::InvalidSession(resumable))
            }
            10 => Ok(Self::Hello(nice_from_str(d)?)),
            11 => Ok(Self::HeartbeatAck),
            2 => Err(de::Error::custom("`Identify` should not be received")),
            6 => Err(de::Error::custom("`Resume` should not be received")),
            _ => Err(de::Error::custom(format!("Unrecognized opcode {}", op))),
        }
    }
}

/// Sent on connection to the websocket. Defines the heartbeat interval that the client should heartbeat to.
#[derive(Deserialize, Debug)]
pub struct HelloPayload {
    /// the interval (in milliseconds) the client should heartbeat with
    pub heartbeat_interval: u64,
}

// ser/de is handled by the implementation on `Payload`
#[derive(Debug)]
pub struct Heartbeat {
    pub seq_num: u64,
}

impl From<Heartbeat> for Payload {
    fn from(heartbeat: Heartbeat) -> Self {
        Self::Heartbeat(heartbeat)
    }
}

impl Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Heartbeat {{ {} }}", self.seq_num)
    }
}

/// Used to trigger the initial handshake with the gateway. Bot sessions carry
/// intents; user sessions identify bare, the way first-party clients do.
#[derive(Serialize, Debug, Clone)]
pub struct Identify {
    /// authentication token
    pub(crate) token: String,
    /// connection properties
    properties: ConnectionProperties,
    /// whether this connection supports compression of packets
    #[serde(skip_serializing_if = "Option::is_none")]
    compress: Option<bool>,
    /// the Gateway Intents to receive (bot sessions only)
    #[serde(skip_serializing_if = "Option::is_none")]
    intents: Option<Intents>,
}

impl Identify {
    pub fn bot(token: String, intents: Intents) -> Self {
        Self {
            token,
            properties: Default::default(),
            compress: None,
            intents: Some(intents),
        }
    }

    pub fn user(token: String) -> Self {
        Self {
            token,
            properties: Default::default(),
            compress: None,
            intents: None,
        }
    }
}

impl From<Identify> for Payload {
    fn from(identify: Identify) -> Self {
        Self::Identify(identify)
    }
}

/// Don't display the token.
impl Display for Identify {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Identify")
            .field("properties", &self.properties)
            .field("intents", &self.intents)
            .finish()
    }
}

/// Use the impl of Default
#[derive(Serialize, Debug, Clone)]
pub struct ConnectionProperties {
    os: String,
    browser: String,
    device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: "windows".into(),
            browser: "mirrorsd".into(),
            device: "mirrorsd".into(),
        }
    }
}

/// Used to replay missed events when a disconnected client resumes.
#[derive(Serialize, Debug)]
pub struct Resume {
    /// session token
    pub token: String,
    /// session id
    pub session_id: String,
    /// last sequence number received
    pub seq: u64,
}

impl From<Resume> for Payload {
    fn from(resume: Resume) -> Self {
        Self::Resume(resume)
    }
}

/// Don't display the token, this impl is used in `Shard::send`
impl Display for Resume {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Resume")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello() {
        let payload: Payload = serde_json::from_str(r#"{"op": 10, "d": {"heartbeat_interval": 41250}}"#).unwrap();
        match payload {
            Payload::Hello(hello) => assert_eq!(hello.heartbeat_interval, 41250),
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_ack_has_no_data() {
        let payload: Payload = serde_json::from_str(r#"{"op": 11}"#).unwrap();
        assert!(matches!(payload, Payload::HeartbeatAck));
    }

    #[test]
    fn user_identify_omits_intents() {
        let json = serde_json::to_string(&Payload::from(Identify::user("tok".into()))).unwrap();
        assert!(!json.contains("intents"));
        assert!(json.contains(r#""op":2"#));
    }

    #[test]
    fn bot_identify_keeps_intents() {
        let json = serde_json::to_string(
            &Payload::from(Identify::bot("tok".into(), Intents::republisher())),
        ).unwrap();
        assert!(json.contains("intents"));
    }
}
