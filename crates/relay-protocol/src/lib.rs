// relay-protocol: broker wire protocol types and serialization.
//
// All socket messages are Envelopes with a top-level `type` field for
// discriminated deserialization.  The enum variants map 1:1 to the envelope
// kinds routed by the daemon.

use serde::{Deserialize, Serialize};

pub mod framing;
pub mod outbox;

mod dedup;
pub use dedup::DedupWindow;

/// Wire protocol version carried in every envelope's `v` field.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The universal wire unit.
///
/// Every frame on the socket decodes to exactly one `Envelope`.  `id` is a
/// 32-character hex string with enough entropy to avoid collisions inside the
/// dedup window; `ts` is milliseconds since the Unix epoch.
///
/// ```json
/// { "v": 1, "type": "send", "id": "…", "ts": 1700000000000,
///   "from": "A", "to": "B", "payload": { "kind": "message", "body": "hi" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub id: String,
    pub ts: u64,
    /// Sender agent name; absent on client-originated HELLO.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Recipient: an agent name, `*` for broadcast, or a channel name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current timestamp.
    pub fn new(body: Body) -> Self {
        Envelope {
            v: PROTOCOL_VERSION,
            id: new_envelope_id(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            body,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// The envelope kind as its wire tag, for logging.
    pub fn kind_tag(&self) -> &'static str {
        match &self.body {
            Body::Hello { .. } => "hello",
            Body::Send { .. } => "send",
            Body::Deliver { .. } => "deliver",
            Body::Ack { .. } => "ack",
            Body::Subscribe { .. } => "subscribe",
            Body::Unsubscribe { .. } => "unsubscribe",
            Body::ChannelJoin { .. } => "channel_join",
            Body::ChannelLeave { .. } => "channel_leave",
            Body::ChannelMessage { .. } => "channel_message",
            Body::Spawn { .. } => "spawn",
            Body::SpawnResult { .. } => "spawn_result",
            Body::Release { .. } => "release",
            Body::ReleaseResult { .. } => "release_result",
        }
    }
}

/// Generate a fresh 32-character envelope id (hyphen-less UUIDv4).
pub fn new_envelope_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Body — top-level discriminated union
// ---------------------------------------------------------------------------

/// All envelope kinds, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Hello { payload: HelloPayload },
    Send { payload: MessagePayload },
    Deliver { payload: MessagePayload, delivery: DeliveryInfo },
    Ack { payload: AckPayload },
    Subscribe { payload: TopicPayload },
    Unsubscribe { payload: TopicPayload },
    ChannelJoin { payload: ChannelMemberPayload },
    ChannelLeave { payload: ChannelMemberPayload },
    ChannelMessage { payload: ChannelMessagePayload },
    Spawn { payload: SpawnPayload },
    SpawnResult { payload: SpawnResultPayload },
    Release { payload: ReleasePayload },
    ReleaseResult { payload: ReleaseResultPayload },
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// Entity kind declared in HELLO.  Users are exempt from processing-state
/// tracking; agents are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    User,
}

/// Handshake payload.  Must be the first envelope on a new connection.
///
/// Reconnecting with the same `name` and `sessionId` triggers replay of
/// persisted unacked deliveries for that session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub name: String,
    #[serde(rename = "entityType")]
    pub entity_type: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// SEND / DELIVER payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// E.g. "message", "request", "system".
    pub kind: String,
    pub body: String,
    /// Free-form metadata; the daemon adds underscore-prefixed markers here
    /// (see [`markers`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// Per-delivery block attached to DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Strictly increasing per (recipient connection, topic-or-"default",
    /// originating sender).
    pub seq: u64,
    /// The recipient's session id at delivery time.
    pub session_id: String,
    /// Set only when it differs from `to` (e.g. broadcast to `*`).
    #[serde(
        default,
        rename = "originalTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_to: Option<String>,
}

/// ACK payload; `ack_id` references the DELIVER's envelope id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_id: String,
}

/// SUBSCRIBE / UNSUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPayload {
    pub topic: String,
}

/// CHANNEL_JOIN / CHANNEL_LEAVE payload.
///
/// `member` is set when a caller joins or removes someone other than itself
/// (admin mode); member notifications are suppressed in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMemberPayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

/// CHANNEL_MESSAGE payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessagePayload {
    pub channel: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
}

/// SPAWN request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub name: String,
    pub cli: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// SPAWN_RESULT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RELEASE request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
}

/// RELEASE_RESULT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Connection close reasons
// ---------------------------------------------------------------------------

/// Reasons a connection is failed by the daemon.
pub mod close_reasons {
    /// Bad frame, unknown type, or traffic before HELLO.
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    /// Peer went away.
    pub const TRANSPORT_CLOSED: &str = "TRANSPORT_CLOSED";
    /// Write queue stayed blocked past the deadline.
    pub const BACKPRESSURE_TIMEOUT: &str = "BACKPRESSURE_TIMEOUT";
}

// ---------------------------------------------------------------------------
// Payload data markers
// ---------------------------------------------------------------------------

/// Underscore-prefixed keys the daemon sets inside `payload.data`.
pub mod markers {
    /// Message persisted for a known-but-offline (or spawning) recipient.
    pub const OFFLINE_QUEUED: &str = "_offlineQueued";
    /// Message handed to the cross-machine handler.
    pub const CROSS_MACHINE: &str = "_crossMachine";
    /// Delivery is a shadow copy, not the primary delivery.
    pub const SHADOW_COPY: &str = "_shadowCopy";
    /// Name of the shadowed primary agent.
    pub const SHADOW_OF: &str = "_shadowOf";
    /// "incoming" or "outgoing" relative to the primary.
    pub const SHADOW_DIRECTION: &str = "_shadowDirection";
    /// Trigger name on SHADOW_TRIGGER deliveries.
    pub const SHADOW_TRIGGER: &str = "_shadowTrigger";
    /// Stored channel-message record flag.
    pub const IS_CHANNEL_MESSAGE: &str = "_isChannelMessage";
}

/// Reserved sender name used by daemon-originated system broadcasts.
pub const SYSTEM_SENDER: &str = "_system";

/// Reserved topic name used for seq accounting when no topic is set.
pub const DEFAULT_TOPIC: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids_are_32_chars() {
        let id = new_envelope_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn send_round_trips_with_tag() {
        let env = Envelope::new(Body::Send {
            payload: MessagePayload {
                kind: "message".to_owned(),
                body: "hi".to_owned(),
                data: None,
                thread: None,
            },
        })
        .with_from("A")
        .with_to("B");

        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"send\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn deliver_serializes_original_to_only_when_set() {
        let mut env = Envelope::new(Body::Deliver {
            payload: MessagePayload {
                kind: "message".to_owned(),
                body: "b".to_owned(),
                data: None,
                thread: None,
            },
            delivery: DeliveryInfo {
                seq: 1,
                session_id: "s-42".to_owned(),
                original_to: None,
            },
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("originalTo"));

        if let Body::Deliver { delivery, .. } = &mut env.body {
            delivery.original_to = Some("*".to_owned());
        }
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"originalTo\":\"*\""));
    }

    #[test]
    fn hello_uses_camel_case_field_names() {
        let env = Envelope::new(Body::Hello {
            payload: HelloPayload {
                name: "A".to_owned(),
                entity_type: EntityKind::Agent,
                cli: None,
                program: None,
                model: None,
                task: None,
                cwd: None,
                session_id: "s-1".to_owned(),
            },
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"entityType\":\"agent\""));
        assert!(json.contains("\"sessionId\":\"s-1\""));
    }

    #[test]
    fn unknown_type_tag_fails_to_parse() {
        let json = r#"{"v":1,"id":"x","ts":0,"type":"bogus","payload":{}}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }
}
