//! Wire types shared by the server and the dashboard client.
//!
//! WebSocket traffic is one-way (server to client) JSON envelopes of the form
//! `{"type": "...", "data": ...}`. HTTP bodies live here too.

use crate::activity::ActivityEvent;
use crate::history::MessageEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server-to-client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full status snapshot.
    Status(Value),
    /// One parsed feed line.
    Activity(ActivityEvent),
    BeadCreated(Value),
    BeadUpdated(Value),
    WorkSlung(Value),
    ConvoyCreated(Value),
    ConvoyUpdated(Value),
    MailReceived(Value),
    MayorMessage(MessageEntry),
    ServiceStarted(ServiceStarted),
    RigAdded(Value),
    RigRemoved(Value),
    /// Part of the envelope vocabulary the client stores dispatch on. This
    /// server never emits it; other publishers on the same socket may.
    AgentStarted(Value),
    AgentStopped(Value),
    /// Client-facing only, like `AgentStarted`.
    AgentRestarted(Value),
}

/// Payload of `service_started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStarted {
    pub service: String,
    #[serde(rename = "autoStarted", default)]
    pub auto_started: bool,
}

/// Discriminant of [`ServerMessage`], used for typed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Status,
    Activity,
    BeadCreated,
    BeadUpdated,
    WorkSlung,
    ConvoyCreated,
    ConvoyUpdated,
    MailReceived,
    MayorMessage,
    ServiceStarted,
    RigAdded,
    RigRemoved,
    AgentStarted,
    AgentStopped,
    AgentRestarted,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::Status,
        Self::Activity,
        Self::BeadCreated,
        Self::BeadUpdated,
        Self::WorkSlung,
        Self::ConvoyCreated,
        Self::ConvoyUpdated,
        Self::MailReceived,
        Self::MayorMessage,
        Self::ServiceStarted,
        Self::RigAdded,
        Self::RigRemoved,
        Self::AgentStarted,
        Self::AgentStopped,
        Self::AgentRestarted,
    ];

    /// The envelope `type` string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Activity => "activity",
            Self::BeadCreated => "bead_created",
            Self::BeadUpdated => "bead_updated",
            Self::WorkSlung => "work_slung",
            Self::ConvoyCreated => "convoy_created",
            Self::ConvoyUpdated => "convoy_updated",
            Self::MailReceived => "mail_received",
            Self::MayorMessage => "mayor_message",
            Self::ServiceStarted => "service_started",
            Self::RigAdded => "rig_added",
            Self::RigRemoved => "rig_removed",
            Self::AgentStarted => "agent_started",
            Self::AgentStopped => "agent_stopped",
            Self::AgentRestarted => "agent_restarted",
        }
    }

    /// Look up a kind by its envelope `type` string.
    #[must_use]
    pub fn from_type(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl ServerMessage {
    /// Discriminant of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Status(_) => MessageKind::Status,
            Self::Activity(_) => MessageKind::Activity,
            Self::BeadCreated(_) => MessageKind::BeadCreated,
            Self::BeadUpdated(_) => MessageKind::BeadUpdated,
            Self::WorkSlung(_) => MessageKind::WorkSlung,
            Self::ConvoyCreated(_) => MessageKind::ConvoyCreated,
            Self::ConvoyUpdated(_) => MessageKind::ConvoyUpdated,
            Self::MailReceived(_) => MessageKind::MailReceived,
            Self::MayorMessage(_) => MessageKind::MayorMessage,
            Self::ServiceStarted(_) => MessageKind::ServiceStarted,
            Self::RigAdded(_) => MessageKind::RigAdded,
            Self::RigRemoved(_) => MessageKind::RigRemoved,
            Self::AgentStarted(_) => MessageKind::AgentStarted,
            Self::AgentStopped(_) => MessageKind::AgentStopped,
            Self::AgentRestarted(_) => MessageKind::AgentRestarted,
        }
    }

    /// Serialize to the envelope JSON text.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization should never fail")
    }
}

/// Result of decoding one incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(ServerMessage),
    /// Well-formed envelope with a `type` this build does not know.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode an envelope. Malformed JSON, a missing `type`, or a known type
/// with a payload of the wrong shape is an error.
pub fn decode(text: &str) -> Result<Decoded, serde_json::Error> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    if MessageKind::from_type(&raw.kind).is_none() {
        return Ok(Decoded::Unknown(raw.kind));
    }
    let envelope = serde_json::json!({ "type": raw.kind, "data": raw.data });
    serde_json::from_value(envelope).map(Decoded::Known)
}

/// `GET /api/health` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub cache_entries: usize,
    pub feed_running: bool,
}

/// `POST /api/nudge` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NudgeRequest {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "autoStart", default = "default_auto_start")]
    pub auto_start: bool,
}

const fn default_auto_start() -> bool {
    true
}

/// `POST /api/nudge` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NudgeResponse {
    pub ok: bool,
    pub target: String,
    pub message: String,
    pub was_auto_started: bool,
    pub message_id: String,
}

/// Pane capture of an agent's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub session: String,
    pub output: Option<String>,
    pub running: bool,
}

/// Mayor pane capture plus recent messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MayorOutput {
    pub session: String,
    pub output: Option<String>,
    pub running: bool,
    pub recent_messages: Vec<MessageEntry>,
}

/// Body of simple action endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let message = ServerMessage::ServiceStarted(ServiceStarted {
            service: "mayor".into(),
            auto_started: true,
        });
        let value: Value = serde_json::from_str(&message.encode()).expect("json");
        assert_eq!(
            value,
            json!({"type": "service_started", "data": {"service": "mayor", "autoStarted": true}})
        );
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_type(kind.as_str()), Some(kind));
        }
        let value: Value =
            serde_json::from_str(&ServerMessage::RigAdded(json!({"name": "tw"})).encode())
                .expect("json");
        assert_eq!(value["type"], MessageKind::RigAdded.as_str());
    }

    #[test]
    fn test_decode_known_and_unknown() {
        let decoded = decode(r#"{"type":"status","data":{"rigs":[]}}"#).expect("decode");
        assert_eq!(decoded, Decoded::Known(ServerMessage::Status(json!({"rigs": []}))));

        let decoded = decode(r#"{"type":"weather","data":1}"#).expect("decode");
        assert_eq!(decoded, Decoded::Unknown("weather".into()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"data":1}"#).is_err());
        assert!(decode(r#"{"type":"activity","data":{"id":1}}"#).is_err());
    }

    #[test]
    fn test_nudge_request_defaults() {
        let request: NudgeRequest = serde_json::from_str(r#"{"message":"hi"}"#).expect("parse");
        assert_eq!(request.target, None);
        assert!(request.auto_start);
    }
}
