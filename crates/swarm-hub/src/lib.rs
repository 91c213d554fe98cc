//! Coordinator implementations for the swarm
//!
//! `LocalHub` accepts agent connections, enforces unique names and fans out
//! broadcast-shaped messages to every connected agent.

pub mod hub;

pub use hub::{HubConfig, LocalHub, NamePolicy};
