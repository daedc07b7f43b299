//! Session protocol
//!
//! JSON text frames exchanged with the remote service once the WebSocket is
//! up. The server drives authentication (`AUTH` → our reply → `AUTH_SUCCESS`),
//! the client drives the heartbeat (`PING` → `PONG`). Every reply echoes the
//! `id` of the message that caused it.

pub mod engine;
pub mod messages;

pub use engine::{EngineConfig, EngineState, ProtocolEngine, Reaction, Termination};
pub use messages::{Action, AuthResult, ClientProfile, InboundMessage, OutboundMessage};
