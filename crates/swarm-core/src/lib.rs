//! swarm-core - shared vocabulary of the agent swarm
//!
//! This crate provides:
//! - The message envelope and the closed set of message kinds exchanged with a coordinator
//! - The coordinator contract agents rely on
//! - The per-agent connection state machine and conversation log
//! - An async runner that drives a connection, including periodic sensor broadcasts

pub mod activity;
pub mod connection;
pub mod coordinator;
pub mod envelope;
pub mod runner;

pub use activity::Activity;
pub use connection::{
    AgentConnection, AgentEvent, AgentKind, AuditEntry, ConnectionState, ConversationEntry,
    Direction,
};
pub use coordinator::Coordinator;
pub use envelope::{COORDINATOR_TARGET, Envelope, MESSAGE_KINDS, Message, Source};
pub use runner::{AgentCommand, AgentHandle, RunnerConfig, spawn_agent, spawn_connection};
