//! In-process coordinator that routes envelopes between connected agents

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use swarm_core::{COORDINATOR_TARGET, Coordinator, Envelope, Message};

/// What to do when a requested name is already held by a connected agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamePolicy {
    /// Refuse the connection
    #[default]
    Reject,
    /// Accept under `name-2`, `name-3`, ...
    Suffix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub name_policy: NamePolicy,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    256
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name_policy: NamePolicy::default(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

struct Member {
    /// Set once the connection is accepted
    name: Option<String>,
    mailbox: mpsc::Sender<Envelope>,
}

/// Single-process hub. Every member owns a bounded mailbox; deliveries never
/// wait on a slow member, a full mailbox drops the envelope with a warning.
pub struct LocalHub {
    config: HubConfig,
    members: RwLock<HashMap<String, Member>>,
    /// Set by `shutdown`; later connects are rejected
    closed: AtomicBool,
}

impl LocalHub {
    pub fn new(config: HubConfig) -> Self {
        info!(
            "Created local hub (name policy: {:?}, mailbox capacity: {})",
            config.name_policy, config.mailbox_capacity
        );
        Self {
            config,
            members: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// `(client_id, assigned_name)` of every connected agent, sorted by name
    pub fn connected_agents(&self) -> Vec<(String, String)> {
        let mut agents: Vec<(String, String)> = self
            .members
            .read()
            .iter()
            .filter_map(|(id, m)| m.name.clone().map(|name| (id.clone(), name)))
            .collect();
        agents.sort_by(|a, b| a.1.cmp(&b.1));
        agents
    }

    pub fn connected_count(&self) -> usize {
        self.members.read().values().filter(|m| m.name.is_some()).count()
    }

    /// Tell every member the hub is going away and drop all names. Mailboxes
    /// stay open so later connect attempts still get their rejection.
    pub fn shutdown(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let members: Vec<(String, mpsc::Sender<Envelope>)> = self
            .members
            .write()
            .iter_mut()
            .filter_map(|(id, m)| m.name.take().map(|_| (id.clone(), m.mailbox.clone())))
            .collect();
        info!("Hub shutting down ({} members): {}", members.len(), reason);
        for (id, mailbox) in members {
            let env = Envelope::from_coordinator(
                COORDINATOR_TARGET,
                Some(id.clone()),
                Message::CoordinatorShutdown {
                    reason: reason.to_string(),
                },
            );
            deliver(&id, &mailbox, env);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn handle_connect(&self, client_id: &str, requested_name: &str) -> Result<()> {
        let requested = requested_name.trim();

        // Decide and register under one write lock so two agents cannot win the same name
        let (mailbox, reply) = {
            let mut members = self.members.write();
            let existing = members.get(client_id).and_then(|m| m.name.clone());
            let decision = if self.is_closed() {
                Err("Coordinator has shut down.".to_string())
            } else if let Some(name) = existing {
                // Repeat connect: confirm the name already held
                debug!("Agent {} already connected as {}", client_id, name);
                Ok(name)
            } else if requested.is_empty() {
                Err("Agent name cannot be empty.".to_string())
            } else {
                self.assign_name(&members, requested)
            };

            let member = members
                .get_mut(client_id)
                .ok_or_else(|| anyhow!("No mailbox open for {}", client_id))?;
            let reply = match decision {
                Ok(name) => {
                    member.name = Some(name.clone());
                    info!("Agent {} connected as {}", client_id, name);
                    Message::CoordinatorAcceptedConnection {
                        assigned_name: name,
                    }
                }
                Err(reason) => {
                    info!("Agent {} rejected: {}", client_id, reason);
                    Message::CoordinatorRejectedConnection { reason }
                }
            };
            (member.mailbox.clone(), reply)
        };

        let env = Envelope::from_coordinator(COORDINATOR_TARGET, Some(client_id.to_string()), reply);
        deliver(client_id, &mailbox, env);
        Ok(())
    }

    fn assign_name(
        &self,
        members: &HashMap<String, Member>,
        requested: &str,
    ) -> std::result::Result<String, String> {
        let taken = |candidate: &str| {
            members
                .values()
                .any(|m| m.name.as_deref() == Some(candidate))
        };
        if !taken(requested) {
            return Ok(requested.to_string());
        }
        match self.config.name_policy {
            NamePolicy::Reject => Err(format!("Name '{}' is already taken.", requested)),
            NamePolicy::Suffix => (2..)
                .map(|n| format!("{}-{}", requested, n))
                .find(|candidate| !taken(candidate))
                .ok_or_else(|| format!("Name '{}' is already taken.", requested)),
        }
    }

    /// Fan out to every connected member in mailbox order
    fn broadcast(&self, sender_id: &str, message: Message) {
        let recipients: Vec<(String, mpsc::Sender<Envelope>)> = self
            .members
            .read()
            .iter()
            .filter(|(_, m)| m.name.is_some())
            .map(|(id, m)| (id.clone(), m.mailbox.clone()))
            .collect();

        debug!(
            "Broadcasting {} from {} to {} agents",
            message.kind(),
            sender_id,
            recipients.len()
        );
        for (id, mailbox) in recipients {
            let env = Envelope::from_coordinator(sender_id, None, message.clone());
            deliver(&id, &mailbox, env);
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[async_trait]
impl Coordinator for LocalHub {
    fn open_mailbox(&self, client_id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        let previous = self.members.write().insert(
            client_id.to_string(),
            Member {
                name: None,
                mailbox: tx,
            },
        );
        if previous.is_some() {
            warn!("Mailbox for {} reopened, previous one closed", client_id);
        }
        debug!("Opened mailbox for {}", client_id);
        rx
    }

    async fn submit(&self, envelope: Envelope) -> Result<()> {
        let sender_id = envelope.sender_id.clone();

        if let Message::AgentConnect { requested_name } = &envelope.message {
            return self.handle_connect(&sender_id, requested_name);
        }

        let Some(sender_name) = self
            .members
            .read()
            .get(&sender_id)
            .and_then(|m| m.name.clone())
        else {
            warn!(
                "Dropping {} from {}: not connected",
                envelope.kind(),
                sender_id
            );
            return Ok(());
        };

        let outgoing = match envelope.message {
            Message::UserQuery { query } => Message::CoordinatorBroadcastMessage {
                sender_name,
                text: query,
            },
            Message::ImuDataBroadcast {
                activity, duration, ..
            } => Message::CoordinatorImuBroadcast {
                sender_id: sender_id.clone(),
                sender_name,
                activity,
                duration,
            },
            msg @ (Message::AgentThought { .. }
            | Message::ToolCall { .. }
            | Message::ToolResult { .. }
            | Message::AgentResponse { .. }) => msg,
            other => {
                warn!(
                    "Ignoring {} from {}: not an agent message",
                    other.kind(),
                    sender_id
                );
                return Ok(());
            }
        };

        self.broadcast(&sender_id, outgoing);
        Ok(())
    }

    async fn disconnect(&self, client_id: &str) -> Result<()> {
        let removed = self.members.write().remove(client_id);
        match removed {
            Some(Member {
                name: Some(agent_name),
                ..
            }) => {
                info!("Agent {} ({}) disconnected", agent_name, client_id);
                self.broadcast(
                    COORDINATOR_TARGET,
                    Message::CoordinatorDisconnectedAgent {
                        agent_id: client_id.to_string(),
                        agent_name,
                    },
                );
            }
            Some(_) => debug!("Closed mailbox for unconnected {}", client_id),
            None => debug!("Disconnect for unknown {}", client_id),
        }
        Ok(())
    }
}

fn deliver(client_id: &str, mailbox: &mpsc::Sender<Envelope>, env: Envelope) {
    match mailbox.try_send(env) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(env)) => {
            warn!("Mailbox of {} is full, dropping {}", client_id, env.kind());
        }
        Err(mpsc::error::TrySendError::Closed(env)) => {
            debug!("Mailbox of {} is closed, dropping {}", client_id, env.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::{Activity, Source};

    fn connect(id: &str, name: &str) -> Envelope {
        Envelope::from_agent(
            id,
            Message::AgentConnect {
                requested_name: name.to_string(),
            },
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_accepted_and_addressed() {
        let hub = LocalHub::default();
        let mut rx = hub.open_mailbox("llm-agent-aaaaaaa");
        hub.submit(connect("llm-agent-aaaaaaa", "  Scout ")).await.unwrap();

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].source, Source::Coordinator);
        assert_eq!(replies[0].target_id.as_deref(), Some("llm-agent-aaaaaaa"));
        assert_eq!(
            replies[0].message,
            Message::CoordinatorAcceptedConnection {
                assigned_name: "Scout".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let hub = LocalHub::default();
        let _a = hub.open_mailbox("a");
        let mut b = hub.open_mailbox("b");
        hub.submit(connect("a", "Scout")).await.unwrap();
        hub.submit(connect("b", "Scout")).await.unwrap();

        let replies = drain(&mut b);
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].message,
            Message::CoordinatorRejectedConnection {
                reason: "Name 'Scout' is already taken.".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_suffix_policy() {
        let hub = LocalHub::new(HubConfig {
            name_policy: NamePolicy::Suffix,
            ..HubConfig::default()
        });
        for id in ["a", "b", "c"] {
            let _ = hub.open_mailbox(id);
            hub.submit(connect(id, "Scout")).await.unwrap();
        }
        let names: Vec<String> = hub.connected_agents().into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["Scout", "Scout-2", "Scout-3"]);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let hub = LocalHub::default();
        let mut rx = hub.open_mailbox("a");
        hub.submit(connect("a", "   ")).await.unwrap();

        let replies = drain(&mut rx);
        assert_eq!(
            replies[0].message,
            Message::CoordinatorRejectedConnection {
                reason: "Agent name cannot be empty.".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_repeat_connect_confirms_existing_name() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        let mut b = hub.open_mailbox("b");
        hub.submit(connect("a", "Scout")).await.unwrap();
        hub.submit(connect("b", "Beta")).await.unwrap();
        hub.submit(connect("a", "Other")).await.unwrap();

        let replies: Vec<Message> = drain(&mut a).into_iter().map(|e| e.message).collect();
        assert_eq!(
            replies,
            vec![
                Message::CoordinatorAcceptedConnection {
                    assigned_name: "Scout".to_string()
                },
                Message::CoordinatorAcceptedConnection {
                    assigned_name: "Scout".to_string()
                },
            ]
        );
        assert_eq!(
            hub.connected_agents(),
            vec![
                ("b".to_string(), "Beta".to_string()),
                ("a".to_string(), "Scout".to_string())
            ]
        );

        drain(&mut b);
        hub.submit(Envelope::from_agent(
            "a",
            Message::AgentThought {
                thought: "still here".to_string(),
            },
        ))
        .await
        .unwrap();
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[tokio::test]
    async fn test_query_becomes_broadcast_for_everyone() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        let mut b = hub.open_mailbox("b");
        let mut lurker = hub.open_mailbox("c");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        hub.submit(connect("b", "Beta")).await.unwrap();
        drain(&mut a);
        drain(&mut b);

        hub.submit(Envelope::from_agent(
            "a",
            Message::UserQuery {
                query: "status?".to_string(),
            },
        ))
        .await
        .unwrap();

        for rx in [&mut a, &mut b] {
            let got = drain(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].target_id, None);
            assert_eq!(got[0].sender_id, "a");
            assert_eq!(
                got[0].message,
                Message::CoordinatorBroadcastMessage {
                    sender_name: "Alpha".to_string(),
                    text: "status?".to_string()
                }
            );
        }
        assert!(drain(&mut lurker).is_empty());
    }

    #[tokio::test]
    async fn test_imu_data_rewritten_with_sender() {
        let hub = LocalHub::default();
        let mut rx = hub.open_mailbox("imu-device-1234567");
        hub.submit(connect("imu-device-1234567", "Wrist")).await.unwrap();
        drain(&mut rx);

        hub.submit(Envelope::from_agent(
            "imu-device-1234567",
            Message::ImuDataBroadcast {
                activity: Activity::Jogging,
                duration: 600,
                sender_name: "ignored".to_string(),
            },
        ))
        .await
        .unwrap();

        let got = drain(&mut rx);
        assert_eq!(
            got[0].message,
            Message::CoordinatorImuBroadcast {
                sender_id: "imu-device-1234567".to_string(),
                sender_name: "Wrist".to_string(),
                activity: Activity::Jogging,
                duration: 600,
            }
        );
    }

    #[tokio::test]
    async fn test_unconnected_sender_dropped() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        let _b = hub.open_mailbox("b");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        drain(&mut a);

        hub.submit(Envelope::from_agent(
            "b",
            Message::AgentThought {
                thought: "hmm".to_string(),
            },
        ))
        .await
        .unwrap();
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_announced_once() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        let _b = hub.open_mailbox("b");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        hub.submit(connect("b", "Beta")).await.unwrap();
        drain(&mut a);

        hub.disconnect("b").await.unwrap();
        hub.disconnect("b").await.unwrap();

        let got = drain(&mut a);
        assert_eq!(got.len(), 1);
        assert_eq!(
            got[0].message,
            Message::CoordinatorDisconnectedAgent {
                agent_id: "b".to_string(),
                agent_name: "Beta".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_clears() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        drain(&mut a);

        hub.shutdown("maintenance");
        let got = drain(&mut a);
        assert_eq!(
            got[0].message,
            Message::CoordinatorShutdown {
                reason: "maintenance".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 0);
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_rejected() {
        let hub = LocalHub::default();
        let mut a = hub.open_mailbox("a");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        hub.shutdown("maintenance");
        drain(&mut a);

        hub.submit(connect("a", "Alpha")).await.unwrap();
        let _late = hub.open_mailbox("late");
        hub.submit(connect("late", "Late")).await.unwrap();

        let got = drain(&mut a);
        assert_eq!(got.len(), 1);
        assert_eq!(
            got[0].message,
            Message::CoordinatorRejectedConnection {
                reason: "Coordinator has shut down.".to_string()
            }
        );
        assert_eq!(hub.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_mailbox_errors() {
        let hub = LocalHub::default();
        assert!(hub.submit(connect("ghost", "Ghost")).await.is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_block() {
        let hub = LocalHub::new(HubConfig {
            mailbox_capacity: 1,
            ..HubConfig::default()
        });
        let _rx = hub.open_mailbox("a");
        hub.submit(connect("a", "Alpha")).await.unwrap();
        for _ in 0..3 {
            hub.submit(Envelope::from_agent(
                "a",
                Message::AgentResponse {
                    response: "x".to_string(),
                },
            ))
            .await
            .unwrap();
        }
    }
}
