//! Protocol engine
//!
//! Runs one live connection: answers server requests, persists session
//! tokens, and owns the heartbeat task for as long as the socket is open.
//!
//! ## Ordering
//!
//! Inbound frames are handled one at a time in arrival order. A reply is
//! fully sent before the next frame is read.
//!
//! ## Termination
//!
//! The engine never returns an error. Every way a connection can end maps to
//! a [`Termination`] the supervisor uses to pick its next delay.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{Action, AuthResult, ClientProfile, InboundMessage, OutboundMessage};
use crate::connectivity::Watchdog;
use crate::identity::{Identity, IdentityStore};
use crate::session::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::types::{Result, TetherError};

/// Upper bound on sending the close frame when a connection ends
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type SharedSink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest wait for the next inbound frame before giving up on the connection
    pub idle_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No connection handed over yet
    Handshaking,
    Active,
    Closed,
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    NormalClose,
    AbnormalClose(String),
    /// No inbound frame within the idle timeout
    Timeout,
    /// The upgrade was refused with this HTTP status.
    ///
    /// `run` never returns this: a refused upgrade means no connection was
    /// handed over. The supervisor reports it when a dial is rejected.
    ServerRejected(u16),
    /// Shut down from outside
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NormalClose => write!(f, "connection closed normally"),
            Self::AbnormalClose(reason) => write!(f, "connection closed abnormally: {}", reason),
            Self::Timeout => write!(f, "timed out waiting for the server"),
            Self::ServerRejected(status) => write!(f, "server rejected the handshake ({})", status),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of handling one inbound message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reaction {
    pub reply: Option<OutboundMessage>,
    /// Token learned from `AUTH_SUCCESS`, to be persisted
    pub token: Option<String>,
}

/// Protocol state for one identity, reused across its connections
pub struct ProtocolEngine {
    identity: Identity,
    profile: ClientProfile,
    token: Option<String>,
    store: IdentityStore,
    state: EngineState,
}

impl ProtocolEngine {
    pub fn new(
        identity: Identity,
        profile: ClientProfile,
        token: Option<String>,
        store: IdentityStore,
    ) -> Self {
        Self {
            identity,
            profile,
            token,
            store,
            state: EngineState::Handshaking,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Session token currently held in memory
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Decide how to answer one inbound message
    pub fn handle(&mut self, msg: &InboundMessage) -> Reaction {
        match msg.action {
            Action::Auth => Reaction {
                reply: Some(self.auth_response(&msg.id)),
                token: None,
            },
            Action::Ping | Action::Pong => Reaction {
                reply: Some(OutboundMessage::pong(&msg.id)),
                token: None,
            },
            Action::AuthSuccess => match msg.token() {
                Some(token) => {
                    info!("Authenticated, session token received");
                    self.token = Some(token.to_string());
                    Reaction {
                        reply: None,
                        token: Some(token.to_string()),
                    }
                }
                None => {
                    warn!("AUTH_SUCCESS {} carried no token", msg.id);
                    Reaction::default()
                }
            },
            Action::Unknown => {
                info!("Ignoring message {} with unrecognised action", msg.id);
                Reaction::default()
            }
        }
    }

    /// Reply to an `AUTH` request with id `id`
    pub fn auth_response(&self, id: &str) -> OutboundMessage {
        let timestamp = chrono::Utc::now().timestamp();
        let result = match &self.token {
            Some(token) => AuthResult::with_token(
                &self.profile,
                &self.identity.user_id,
                &self.identity.device_id,
                token,
                timestamp,
            ),
            None => AuthResult::with_browser_id(
                &self.profile,
                &self.identity.user_id,
                &self.identity.device_id,
                timestamp,
            ),
        };
        OutboundMessage::auth(id, result)
    }

    /// Drive `ws` until it ends.
    ///
    /// The heartbeat runs alongside the receive loop and is stopped before
    /// this returns; the socket is closed on every path.
    pub async fn run<S>(
        &mut self,
        ws: WebSocketStream<S>,
        config: &EngineConfig,
        watchdog: Option<&Watchdog>,
        cancel: &CancellationToken,
    ) -> Termination
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.state = EngineState::Active;

        let (sink, mut stream) = ws.split();
        let sink: SharedSink<S> = Arc::new(Mutex::new(sink));
        let heartbeat = Heartbeat::spawn(
            Arc::clone(&sink),
            config.heartbeat.clone(),
            cancel.child_token(),
        );

        let termination = tokio::select! {
            t = self.receive_loop(&mut stream, &sink, config.idle_timeout) => t,
            _ = wait_for_connectivity_loss(watchdog) => {
                warn!("Connectivity lost, closing connection");
                Termination::AbnormalClose("connectivity lost".to_string())
            }
            _ = cancel.cancelled() => Termination::Cancelled,
        };

        let pings = heartbeat.pings_sent();
        heartbeat.stop().await;
        close_sink(&sink).await;
        self.state = EngineState::Closed;

        debug!("Connection finished after {} heartbeat(s): {}", pings, termination);
        termination
    }

    async fn receive_loop<S>(
        &mut self,
        stream: &mut SplitStream<WebSocketStream<S>>,
        sink: &SharedSink<S>,
        idle_timeout: Duration,
    ) -> Termination
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Err(_) => return Termination::Timeout,
                Ok(None) => {
                    return Termination::AbnormalClose("stream ended without close frame".into())
                }
                Ok(Some(Err(e))) => return classify_stream_error(e),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => {
                    if let Err(e) = self.on_text(&text, sink).await {
                        return Termination::AbnormalClose(e.to_string());
                    }
                }
                // tungstenite queues the pong itself and flushes it on the next read
                Message::Ping(_) => debug!("Transport ping received"),
                Message::Close(frame) => {
                    return match frame {
                        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            Termination::AbnormalClose(format!(
                                "closed by server with {}: {}",
                                u16::from(frame.code),
                                frame.reason
                            ))
                        }
                        _ => Termination::NormalClose,
                    };
                }
                Message::Binary(data) => {
                    debug!("Ignoring binary frame ({} bytes)", data.len());
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn on_text<S>(&mut self, text: &str, sink: &SharedSink<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let msg: InboundMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                return Ok(());
            }
        };
        debug!("Received {}", text);

        let reaction = self.handle(&msg);

        if let Some(token) = &reaction.token {
            if let Err(e) = self.store.save_token(&self.identity.user_id, token).await {
                warn!("Failed to persist session token: {}", e);
            }
        }

        if let Some(reply) = reaction.reply {
            let text = serde_json::to_string(&reply)?;
            debug!("Sending {}", text);
            sink.lock()
                .await
                .send(Message::Text(text))
                .await
                .map_err(|e| TetherError::Protocol(format!("send failed: {}", e)))?;
        }

        Ok(())
    }
}

async fn wait_for_connectivity_loss(watchdog: Option<&Watchdog>) {
    match watchdog {
        Some(watchdog) => watchdog.wait_for_loss().await,
        None => std::future::pending().await,
    }
}

async fn close_sink<S>(sink: &SharedSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = sink.lock().await;
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close after termination failed: {}", e),
        Err(_) => debug!("Close after termination timed out"),
    }
}

fn classify_stream_error(e: WsError) -> Termination {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Termination::NormalClose,
        other => Termination::AbnormalClose(other.to_string()),
    }
}
