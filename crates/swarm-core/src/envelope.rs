//! Message envelope: the shape carried on every hop between agents and the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::Activity;

/// Target id for agent → coordinator traffic
pub const COORDINATOR_TARGET: &str = "coordinator";

/// Longest payload excerpt kept in audit lines
const PREVIEW_CHARS: usize = 50;

/// Which side of the protocol produced an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Agent,
    Coordinator,
}

/// Every `type` tag the protocol defines
pub const MESSAGE_KINDS: [&str; 14] = [
    "AGENT_CONNECT",
    "COORDINATOR_ACCEPTED_CONNECTION",
    "COORDINATOR_REJECTED_CONNECTION",
    "COORDINATOR_BROADCAST_MESSAGE",
    "COORDINATOR_IMAGE_BROADCAST",
    "COORDINATOR_IMU_BROADCAST",
    "USER_QUERY",
    "AGENT_THOUGHT",
    "TOOL_CALL",
    "TOOL_RESULT",
    "AGENT_RESPONSE",
    "COORDINATOR_DISCONNECTED_AGENT",
    "COORDINATOR_SHUTDOWN",
    "IMU_DATA_BROADCAST",
];

/// Typed message body. The variant fixes the payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    AgentConnect { requested_name: String },
    #[serde(rename_all = "camelCase")]
    CoordinatorAcceptedConnection { assigned_name: String },
    CoordinatorRejectedConnection { reason: String },
    #[serde(rename_all = "camelCase")]
    CoordinatorBroadcastMessage { sender_name: String, text: String },
    #[serde(rename_all = "camelCase")]
    CoordinatorImageBroadcast { sender_name: String, image_url: String },
    #[serde(rename_all = "camelCase")]
    CoordinatorImuBroadcast {
        sender_id: String,
        sender_name: String,
        activity: Activity,
        /// Seconds
        duration: u64,
    },
    UserQuery { query: String },
    AgentThought { thought: String },
    #[serde(rename_all = "camelCase")]
    ToolCall { tool_name: String, parameters: Value },
    #[serde(rename_all = "camelCase")]
    ToolResult { tool_name: String, result: Value },
    AgentResponse { response: String },
    #[serde(rename_all = "camelCase")]
    CoordinatorDisconnectedAgent { agent_id: String, agent_name: String },
    CoordinatorShutdown { reason: String },
    #[serde(rename_all = "camelCase")]
    ImuDataBroadcast {
        activity: Activity,
        duration: u64,
        sender_name: String,
    },
    /// A `type` outside the closed set, kept verbatim
    #[serde(skip)]
    Unrecognized { kind: String, payload: Value },
}

impl Message {
    /// The wire `type` tag
    pub fn kind(&self) -> &str {
        match self {
            Self::AgentConnect { .. } => "AGENT_CONNECT",
            Self::CoordinatorAcceptedConnection { .. } => "COORDINATOR_ACCEPTED_CONNECTION",
            Self::CoordinatorRejectedConnection { .. } => "COORDINATOR_REJECTED_CONNECTION",
            Self::CoordinatorBroadcastMessage { .. } => "COORDINATOR_BROADCAST_MESSAGE",
            Self::CoordinatorImageBroadcast { .. } => "COORDINATOR_IMAGE_BROADCAST",
            Self::CoordinatorImuBroadcast { .. } => "COORDINATOR_IMU_BROADCAST",
            Self::UserQuery { .. } => "USER_QUERY",
            Self::AgentThought { .. } => "AGENT_THOUGHT",
            Self::ToolCall { .. } => "TOOL_CALL",
            Self::ToolResult { .. } => "TOOL_RESULT",
            Self::AgentResponse { .. } => "AGENT_RESPONSE",
            Self::CoordinatorDisconnectedAgent { .. } => "COORDINATOR_DISCONNECTED_AGENT",
            Self::CoordinatorShutdown { .. } => "COORDINATOR_SHUTDOWN",
            Self::ImuDataBroadcast { .. } => "IMU_DATA_BROADCAST",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    /// Messages every agent appends to its conversation log without a state change
    pub fn is_broadcast_shaped(&self) -> bool {
        matches!(
            self,
            Self::CoordinatorBroadcastMessage { .. }
                | Self::CoordinatorImageBroadcast { .. }
                | Self::CoordinatorImuBroadcast { .. }
                | Self::AgentThought { .. }
                | Self::ToolCall { .. }
                | Self::ToolResult { .. }
                | Self::AgentResponse { .. }
        )
    }

    /// Payload as a JSON value
    pub fn payload(&self) -> Value {
        match self {
            Self::Unrecognized { payload, .. } => payload.clone(),
            known => serde_json::to_value(known)
                .ok()
                .and_then(|mut v| v.get_mut("payload").map(Value::take))
                .unwrap_or(Value::Null),
        }
    }

    fn from_parts(kind: String, payload: Value) -> Result<Self, serde_json::Error> {
        if !MESSAGE_KINDS.contains(&kind.as_str()) {
            return Ok(Self::Unrecognized { kind, payload });
        }
        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
    }
}

/// The envelope wrapping every message on every hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub source: Source,
    pub sender_id: String,
    /// `"coordinator"`, an agent id, or `None` for broadcast
    pub target_id: Option<String>,
    pub message: Message,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Envelope from an agent, addressed to the coordinator
    pub fn from_agent(sender_id: impl Into<String>, message: Message) -> Self {
        Self {
            source: Source::Agent,
            sender_id: sender_id.into(),
            target_id: Some(COORDINATOR_TARGET.to_string()),
            message,
            timestamp: Utc::now(),
        }
    }

    /// Envelope from the coordinator. `target_id = None` means broadcast.
    pub fn from_coordinator(
        sender_id: impl Into<String>,
        target_id: Option<String>,
        message: Message,
    ) -> Self {
        Self {
            source: Source::Coordinator,
            sender_id: sender_id.into(),
            target_id,
            message,
            timestamp: Utc::now(),
        }
    }

    /// Wire `type` tag of the message
    pub fn kind(&self) -> &str {
        self.message.kind()
    }

    /// True when the envelope is a broadcast or addressed to `client_id`
    pub fn is_addressed_to(&self, client_id: &str) -> bool {
        self.target_id.as_deref().is_none_or(|t| t == client_id)
    }

    /// Short payload excerpt for diagnostics
    pub fn payload_preview(&self) -> String {
        let json = self.message.payload().to_string();
        json.chars().take(PREVIEW_CHARS).collect()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    source: Source,
    sender_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
    #[serde(default)]
    payload: Value,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = serde_json::Error;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            source: raw.source,
            sender_id: raw.sender_id,
            target_id: raw.target_id,
            message: Message::from_parts(raw.kind, raw.payload)?,
            timestamp: raw.timestamp,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(env: Envelope) -> Self {
        Self {
            source: env.source,
            kind: env.message.kind().to_string(),
            payload: env.message.payload(),
            sender_id: env.sender_id,
            target_id: env.target_id,
            timestamp: env.timestamp,
        }
    }
}
