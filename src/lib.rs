//! Tether - long-lived WebSocket sessions per user and proxy
//!
//! Keeps one authenticated, heartbeating connection open to a remote service
//! for every (user, proxy) pair, and brings it back whenever it drops.
//!
//! ## Components
//!
//! - **Identity**: stable device id per (user, proxy), cached session token per user
//! - **Connectivity**: HTTP reachability probe with retry and a live-session watchdog
//! - **Transport**: WebSocket dialer over direct, SOCKS5 or HTTP CONNECT tunnels
//! - **Protocol**: AUTH / PING / PONG / AUTH_SUCCESS handling and the heartbeat
//! - **Session**: per-identity supervisor with failure classification and backoff
//! - **Controller**: admission limit, fan-out and panic containment

pub mod config;
pub mod connectivity;
pub mod controller;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Args;
pub use controller::{ControllerConfig, SessionController};
pub use types::{Result, TetherError};
