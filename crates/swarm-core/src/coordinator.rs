//! The contract every coordinator honors toward connecting agents

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// A coordinating hub as seen from an agent.
///
/// Implementations must:
/// - answer every `AGENT_CONNECT` with exactly one `COORDINATOR_ACCEPTED_CONNECTION`
///   or `COORDINATOR_REJECTED_CONNECTION` addressed to the requesting sender id;
/// - deliver every broadcast-shaped event to all currently connected agents;
/// - emit exactly one `COORDINATOR_DISCONNECTED_AGENT` when a connected agent leaves.
///
/// Name-collision policy and cross-agent broadcast ordering are the
/// implementation's own configuration.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Open the mailbox through which the coordinator addresses `client_id`
    fn open_mailbox(&self, client_id: &str) -> mpsc::Receiver<Envelope>;

    /// Hand an agent envelope to the coordinator. Envelopes submitted by one
    /// agent are processed in submission order.
    async fn submit(&self, envelope: Envelope) -> Result<()>;

    /// The agent behind `client_id` is going away
    async fn disconnect(&self, client_id: &str) -> Result<()>;
}
