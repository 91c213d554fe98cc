//! swarm-gateway - WebSocket access to the shared inference worker

pub mod server;

pub use server::{GatewayServer, GatewayState};
