//! Shared error and result types for tether

use thiserror::Error;

/// Crate-level error
#[derive(Error, Debug)]
pub enum TetherError {
    /// No network reachability
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The server refused the WebSocket upgrade
    #[error("Handshake rejected with status {status} (cap exceeded: {cap_exceeded})")]
    HandshakeRejected { status: u16, cap_exceeded: bool },

    /// Wire protocol violation or encoding failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Identity or token record could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TetherError>;
