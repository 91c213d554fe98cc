//! Agent connection state machine
//!
//! An [`AgentConnection`] is pure protocol state: it turns collaborator intents
//! into envelopes and applies inbound envelopes to its state, conversation log
//! and audit log. Delivery is the caller's job (see [`crate::runner`]).

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::envelope::{Envelope, Message};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 7;

/// What kind of agent sits behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Llm,
    Imu,
}

impl AgentKind {
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Llm => "llm-agent",
            Self::Imu => "imu-device",
        }
    }

    /// Fresh client id, e.g. `llm-agent-k3x9q0a`
    pub fn generate_client_id(&self) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        format!("{}-{}", self.id_prefix(), suffix)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Imu => write!(f, "imu"),
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    /// A connect request is in flight
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Diagnostic record of one message crossing the connection
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub direction: Direction,
    pub kind: String,
    pub line: String,
}

/// One item of the ordered, append-only conversation log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEntry {
    System {
        text: String,
    },
    UserQuery {
        sender: Option<String>,
        text: String,
    },
    Broadcast {
        sender: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Image {
        sender: String,
        image_url: String,
        timestamp: DateTime<Utc>,
    },
    Imu {
        sender: String,
        activity: Activity,
        duration: u64,
        timestamp: DateTime<Utc>,
    },
    Thought {
        text: String,
        timestamp: DateTime<Utc>,
    },
    ToolCall {
        tool_name: String,
        parameters: Value,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        tool_name: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    AgentResponse {
        sender_id: String,
        /// Own assigned name for our own responses, otherwise the sender id
        sender: String,
        response: String,
        timestamp: DateTime<Utc>,
    },
}

impl std::fmt::Display for ConversationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System { text } => write!(f, "{}", text),
            Self::UserQuery { sender, text } => {
                write!(f, "{}: {}", sender.as_deref().unwrap_or("You"), text)
            }
            Self::Broadcast { sender, text, .. } => write!(f, "{}: {}", sender, text),
            Self::Image { sender, image_url, .. } => {
                write!(f, "{}: shared an image ({})", sender, image_url)
            }
            Self::Imu {
                sender,
                activity,
                duration,
                ..
            } => write!(
                f,
                "IMU Broadcast ({}): Activity: {}, Duration: {}s",
                sender, activity, duration
            ),
            Self::Thought { text, .. } => write!(f, "Agent Thought: {}", text),
            Self::ToolCall {
                tool_name,
                parameters,
                ..
            } => write!(f, "Tool Call: {}({})", tool_name, parameters),
            Self::ToolResult {
                tool_name, result, ..
            } => write!(f, "Tool Result ({}): {}", tool_name, result),
            Self::AgentResponse {
                sender, response, ..
            } => write!(f, "Agent Final Response ({}): {}", sender, response),
        }
    }
}

/// Notifications for whoever drives the agent (UI, CLI, simulation)
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Connected { assigned_name: String },
    Rejected { reason: String },
    Disconnected { reason: String },
    PeerLeft { agent_id: String, agent_name: String },
    Logged(ConversationEntry),
    SensorReading { activity: Activity, duration: u64 },
    Notice(String),
    Unhandled { kind: String },
}

/// Client-side protocol state for one agent
#[derive(Debug, Clone)]
pub struct AgentConnection {
    client_id: String,
    kind: AgentKind,
    assigned_name: Option<String>,
    state: ConnectionState,
    conversation: Vec<ConversationEntry>,
    audit: Vec<AuditEntry>,
}

impl AgentConnection {
    /// New disconnected agent with a freshly generated client id
    pub fn new(kind: AgentKind) -> Self {
        Self::with_client_id(kind, kind.generate_client_id())
    }

    pub fn with_client_id(kind: AgentKind, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        info!("{} agent instance created with ID: {}", kind, client_id);
        Self {
            client_id,
            kind,
            assigned_name: None,
            state: ConnectionState::Disconnected,
            conversation: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn assigned_name(&self) -> Option<&str> {
        self.assigned_name.as_deref()
    }

    /// Assigned name, or the client id while unnamed
    pub fn display_name(&self) -> &str {
        self.assigned_name.as_deref().unwrap_or(&self.client_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn conversation(&self) -> &[ConversationEntry] {
        &self.conversation
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Build an `AGENT_CONNECT` request. Names that are empty after trimming
    /// produce nothing and leave the state untouched.
    pub fn connect_request(&mut self, requested_name: &str) -> Option<Envelope> {
        let name = requested_name.trim();
        if name.is_empty() {
            debug!("{}: ignoring connect with empty name", self.client_id);
            return None;
        }
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
        info!("{}: attempting to connect as \"{}\"", self.client_id, name);
        Some(self.outbound(Message::AgentConnect {
            requested_name: name.to_string(),
        }))
    }

    /// The connect request never reached the coordinator. Reported the same
    /// way as a rejection so callers always hear back about a connect.
    pub fn connect_failed(&mut self, reason: &str) -> AgentEvent {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Disconnected;
        }
        info!("{}: connect request failed: {}", self.client_id, reason);
        self.conversation.push(ConversationEntry::System {
            text: format!("Connection rejected: {}", reason),
        });
        AgentEvent::Rejected {
            reason: reason.to_string(),
        }
    }

    /// Build a `USER_QUERY`. Allowed in any state; blank queries produce nothing.
    pub fn query(&mut self, query: &str) -> Option<Envelope> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let env = self.outbound(Message::UserQuery {
            query: query.to_string(),
        });
        self.conversation.push(ConversationEntry::UserQuery {
            sender: self.assigned_name.clone(),
            text: format!("You ({}): \"{}\"", self.kind, query),
        });
        Some(env)
    }

    /// Wrap an arbitrary message for the coordinator and record it
    pub fn outbound(&mut self, message: Message) -> Envelope {
        let env = Envelope::from_agent(self.client_id.clone(), message);
        self.record(Direction::Outbound, &env);
        env
    }

    /// Apply an inbound envelope. Returns what the collaborator should hear about.
    pub fn handle_inbound(&mut self, env: &Envelope) -> Option<AgentEvent> {
        self.record(Direction::Inbound, env);

        match &env.message {
            Message::CoordinatorAcceptedConnection { assigned_name } => {
                if !env.is_addressed_to(&self.client_id) {
                    warn!(
                        "{}: acceptance addressed to {:?}, ignoring",
                        self.client_id, env.target_id
                    );
                    return None;
                }
                self.state = ConnectionState::Connected;
                self.assigned_name = Some(assigned_name.clone());
                info!(
                    "{}: connection successful, assigned name: {}",
                    self.client_id, assigned_name
                );
                self.conversation.push(ConversationEntry::System {
                    text: format!("You are connected as {}.", assigned_name),
                });
                Some(AgentEvent::Connected {
                    assigned_name: assigned_name.clone(),
                })
            }

            Message::CoordinatorRejectedConnection { reason } => {
                if !env.is_addressed_to(&self.client_id) {
                    warn!(
                        "{}: rejection addressed to {:?}, ignoring",
                        self.client_id, env.target_id
                    );
                    return None;
                }
                self.state = ConnectionState::Disconnected;
                self.assigned_name = None;
                info!("{}: connection rejected: {}", self.client_id, reason);
                self.conversation.push(ConversationEntry::System {
                    text: format!("Connection rejected: {}", reason),
                });
                Some(AgentEvent::Rejected {
                    reason: reason.clone(),
                })
            }

            Message::CoordinatorShutdown { reason } => {
                if !self.is_connected() {
                    return None;
                }
                self.state = ConnectionState::Disconnected;
                self.assigned_name = None;
                info!("{}: coordinator disconnected: {}", self.client_id, reason);
                self.conversation.push(ConversationEntry::System {
                    text: format!("Coordinator disconnected: {}", reason),
                });
                Some(AgentEvent::Disconnected {
                    reason: reason.clone(),
                })
            }

            Message::CoordinatorDisconnectedAgent {
                agent_id,
                agent_name,
            } => {
                if agent_id == &self.client_id {
                    return None;
                }
                let entry = ConversationEntry::System {
                    text: format!("{} has left the swarm.", agent_name),
                };
                self.conversation.push(entry);
                Some(AgentEvent::PeerLeft {
                    agent_id: agent_id.clone(),
                    agent_name: agent_name.clone(),
                })
            }

            msg if msg.is_broadcast_shaped() => {
                let entry = conversation_entry(env, self.response_sender(&env.sender_id))?;
                self.conversation.push(entry.clone());
                Some(AgentEvent::Logged(entry))
            }

            other => {
                debug!("{}: unhandled message type: {}", self.client_id, other.kind());
                Some(AgentEvent::Unhandled {
                    kind: other.kind().to_string(),
                })
            }
        }
    }

    fn response_sender(&self, sender_id: &str) -> String {
        match &self.assigned_name {
            Some(name) if sender_id == self.client_id => name.clone(),
            _ => sender_id.to_string(),
        }
    }

    fn record(&mut self, direction: Direction, env: &Envelope) {
        let line = match direction {
            Direction::Inbound => format!(
                "Received message ({}): {}...",
                env.kind(),
                env.payload_preview()
            ),
            Direction::Outbound => format!(
                "Sending message (type: {}): {}...",
                env.kind(),
                env.payload_preview()
            ),
        };
        debug!("AGENT ({}): {}", self.display_name(), line);
        self.audit.push(AuditEntry {
            at: Utc::now(),
            direction,
            kind: env.kind().to_string(),
            line,
        });
    }
}

fn conversation_entry(env: &Envelope, response_sender: String) -> Option<ConversationEntry> {
    let timestamp = env.timestamp;
    let entry = match &env.message {
        Message::CoordinatorBroadcastMessage { sender_name, text } => ConversationEntry::Broadcast {
            sender: sender_name.clone(),
            text: text.clone(),
            timestamp,
        },
        Message::CoordinatorImageBroadcast {
            sender_name,
            image_url,
        } => ConversationEntry::Image {
            sender: sender_name.clone(),
            image_url: image_url.clone(),
            timestamp,
        },
        Message::CoordinatorImuBroadcast {
            sender_name,
            activity,
            duration,
            ..
        } => ConversationEntry::Imu {
            sender: sender_name.clone(),
            activity: *activity,
            duration: *duration,
            timestamp,
        },
        Message::AgentThought { thought } => ConversationEntry::Thought {
            text: thought.clone(),
            timestamp,
        },
        Message::ToolCall {
            tool_name,
            parameters,
        } => ConversationEntry::ToolCall {
            tool_name: tool_name.clone(),
            parameters: parameters.clone(),
            timestamp,
        },
        Message::ToolResult { tool_name, result } => ConversationEntry::ToolResult {
            tool_name: tool_name.clone(),
            result: result.clone(),
            timestamp,
        },
        Message::AgentResponse { response } => ConversationEntry::AgentResponse {
            sender_id: env.sender_id.clone(),
            sender: response_sender,
            response: response.clone(),
            timestamp,
        },
        _ => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hub(target: Option<&str>, message: Message) -> Envelope {
        Envelope::from_coordinator("coordinator", target.map(str::to_string), message)
    }

    fn connected(id: &str, name: &str) -> AgentConnection {
        let mut conn = AgentConnection::with_client_id(AgentKind::Llm, id);
        conn.connect_request(name).unwrap();
        conn.handle_inbound(&from_hub(
            Some(id),
            Message::CoordinatorAcceptedConnection {
                assigned_name: name.to_string(),
            },
        ));
        conn
    }

    #[test]
    fn test_generated_ids() {
        let id = AgentKind::Llm.generate_client_id();
        assert!(id.starts_with("llm-agent-"));
        assert_eq!(id.len(), "llm-agent-".len() + ID_SUFFIX_LEN);
        assert!(AgentKind::Imu.generate_client_id().starts_with("imu-device-"));
    }

    #[test]
    fn test_connect_with_blank_name_sends_nothing() {
        let mut conn = AgentConnection::new(AgentKind::Llm);
        assert!(conn.connect_request("   ").is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.audit_log().is_empty());
    }

    #[test]
    fn test_connect_request_trims_and_moves_to_connecting() {
        let mut conn = AgentConnection::with_client_id(AgentKind::Llm, "llm-agent-0000001");
        let env = conn.connect_request("  Scout ").unwrap();
        assert_eq!(env.sender_id, "llm-agent-0000001");
        assert_eq!(env.target_id.as_deref(), Some("coordinator"));
        assert_eq!(
            env.message,
            Message::AgentConnect {
                requested_name: "Scout".to_string()
            }
        );
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.audit_log().len(), 1);
        assert_eq!(conn.audit_log()[0].direction, Direction::Outbound);

        let event = conn.connect_failed("hub unreachable");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            event,
            AgentEvent::Rejected {
                reason: "hub unreachable".to_string()
            }
        );
    }

    #[test]
    fn test_accept_connects_and_stores_name() {
        let conn = connected("llm-agent-0000001", "Scout");
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.assigned_name(), Some("Scout"));
        assert_eq!(
            conn.conversation().last(),
            Some(&ConversationEntry::System {
                text: "You are connected as Scout.".to_string()
            })
        );
    }

    #[test]
    fn test_rejection_leaves_disconnected_without_name() {
        let mut conn = AgentConnection::with_client_id(AgentKind::Llm, "llm-agent-0000001");
        conn.connect_request("Scout").unwrap();
        let event = conn.handle_inbound(&from_hub(
            Some("llm-agent-0000001"),
            Message::CoordinatorRejectedConnection {
                reason: "name taken".to_string(),
            },
        ));
        assert_eq!(
            event,
            Some(AgentEvent::Rejected {
                reason: "name taken".to_string()
            })
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.assigned_name().is_none());
    }

    #[test]
    fn test_acceptance_for_someone_else_is_ignored() {
        let mut conn = AgentConnection::with_client_id(AgentKind::Llm, "llm-agent-0000001");
        conn.connect_request("Scout").unwrap();
        let event = conn.handle_inbound(&from_hub(
            Some("llm-agent-0000002"),
            Message::CoordinatorAcceptedConnection {
                assigned_name: "Other".to_string(),
            },
        ));
        assert!(event.is_none());
        assert_ne!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_shutdown_disconnects_connected_agent() {
        let mut conn = connected("llm-agent-0000001", "Scout");
        let event = conn.handle_inbound(&from_hub(
            None,
            Message::CoordinatorShutdown {
                reason: "maintenance".to_string(),
            },
        ));
        assert_eq!(
            event,
            Some(AgentEvent::Disconnected {
                reason: "maintenance".to_string()
            })
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.assigned_name().is_none());
    }

    #[test]
    fn test_shutdown_ignored_when_not_connected() {
        let mut conn = AgentConnection::new(AgentKind::Imu);
        let before = conn.conversation().len();
        let event = conn.handle_inbound(&from_hub(
            None,
            Message::CoordinatorShutdown {
                reason: "maintenance".to_string(),
            },
        ));
        assert!(event.is_none());
        assert_eq!(conn.conversation().len(), before);
    }

    #[test]
    fn test_peer_departure_recorded_but_own_ignored() {
        let mut conn = connected("llm-agent-0000001", "Scout");
        let event = conn.handle_inbound(&from_hub(
            None,
            Message::CoordinatorDisconnectedAgent {
                agent_id: "imu-device-0000009".to_string(),
                agent_name: "Wrist".to_string(),
            },
        ));
        assert!(matches!(event, Some(AgentEvent::PeerLeft { .. })));
        assert_eq!(
            conn.conversation().last(),
            Some(&ConversationEntry::System {
                text: "Wrist has left the swarm.".to_string()
            })
        );

        let own = conn.handle_inbound(&from_hub(
            None,
            Message::CoordinatorDisconnectedAgent {
                agent_id: "llm-agent-0000001".to_string(),
                agent_name: "Scout".to_string(),
            },
        ));
        assert!(own.is_none());
        assert!(conn.is_connected());
    }

    #[test]
    fn test_broadcasts_logged_in_any_state() {
        let mut conn = AgentConnection::new(AgentKind::Llm);
        let messages = vec![
            Message::CoordinatorBroadcastMessage {
                sender_name: "Scout".into(),
                text: "hello".into(),
            },
            Message::AgentThought {
                thought: "thinking".into(),
            },
            Message::ToolCall {
                tool_name: "search".into(),
                parameters: serde_json::json!({"q": "rust"}),
            },
            Message::AgentResponse {
                response: "done".into(),
            },
            Message::CoordinatorImageBroadcast {
                sender_name: "Scout".into(),
                image_url: "http://example.com/a.png".into(),
            },
            Message::CoordinatorImuBroadcast {
                sender_id: "imu-device-0000009".into(),
                sender_name: "Wrist".into(),
                activity: Activity::Walking,
                duration: 120,
            },
            Message::ToolResult {
                tool_name: "search".into(),
                result: serde_json::json!({"hits": 3}),
            },
        ];
        for msg in messages {
            let event = conn.handle_inbound(&from_hub(None, msg));
            assert!(matches!(event, Some(AgentEvent::Logged(_))));
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let log = conn.conversation();
        assert_eq!(log.len(), 7);
        assert!(matches!(log[0], ConversationEntry::Broadcast { .. }));
        assert!(matches!(log[1], ConversationEntry::Thought { .. }));
        assert!(matches!(log[2], ConversationEntry::ToolCall { .. }));
        assert!(matches!(log[3], ConversationEntry::AgentResponse { .. }));
        assert!(matches!(log[4], ConversationEntry::Image { .. }));
        assert!(matches!(
            &log[5],
            ConversationEntry::Imu { sender, activity: Activity::Walking, duration: 120, .. } if sender == "Wrist"
        ));
        assert!(matches!(log[6], ConversationEntry::ToolResult { .. }));
    }

    #[test]
    fn test_own_response_shows_assigned_name() {
        let mut conn = connected("llm-agent-0000001", "Scout");
        let own = Envelope::from_agent(
            "llm-agent-0000001",
            Message::AgentResponse {
                response: "mine".into(),
            },
        );
        let peer = Envelope::from_agent(
            "llm-agent-0000002",
            Message::AgentResponse {
                response: "theirs".into(),
            },
        );
        conn.handle_inbound(&own);
        conn.handle_inbound(&peer);

        let log = conn.conversation();
        let n = log.len();
        assert_eq!(log[n - 2].to_string(), "Agent Final Response (Scout): mine");
        assert_eq!(
            log[n - 1].to_string(),
            "Agent Final Response (llm-agent-0000002): theirs"
        );
    }

    #[test]
    fn test_unrecognized_kind_is_non_fatal() {
        let mut conn = connected("llm-agent-0000001", "Scout");
        let env = from_hub(
            None,
            Message::Unrecognized {
                kind: "SOMETHING_NEW".into(),
                payload: Value::Null,
            },
        );
        let event = conn.handle_inbound(&env);
        assert_eq!(
            event,
            Some(AgentEvent::Unhandled {
                kind: "SOMETHING_NEW".to_string()
            })
        );
        assert!(conn.is_connected());
    }

    #[test]
    fn test_query_logged_and_allowed_while_disconnected() {
        let mut conn = AgentConnection::new(AgentKind::Imu);
        assert!(conn.query("  ").is_none());
        let env = conn.query("where is everyone?").unwrap();
        assert_eq!(env.kind(), "USER_QUERY");
        assert!(matches!(
            conn.conversation().last(),
            Some(ConversationEntry::UserQuery { .. })
        ));
    }

    #[test]
    fn test_every_message_is_audited() {
        let mut conn = connected("llm-agent-0000001", "Scout");
        conn.query("ping").unwrap();
        conn.handle_inbound(&from_hub(
            None,
            Message::AgentThought {
                thought: "t".into(),
            },
        ));
        // connect out, accept in, query out, thought in
        assert_eq!(conn.audit_log().len(), 4);
        assert!(conn.audit_log()[1].line.starts_with("Received message (COORDINATOR_ACCEPTED_CONNECTION)"));
    }
}
