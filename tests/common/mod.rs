//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use tether::connectivity::Connectivity;
use tether::identity::{IdentityStore, MemoryStore};
use tether::transport::{BoxedStream, ConnectError, Dialer, ProxySpec, WsStream};

pub type ServerSide = WebSocketStream<DuplexStream>;

/// Connected client/server WebSocket pair over an in-memory pipe
pub async fn ws_pair() -> (WsStream, ServerSide) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client =
        WebSocketStream::from_raw_socket(Box::new(client_io) as BoxedStream, Role::Client, None)
            .await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, server)
}

/// Next text frame from the server side, parsed as JSON. Other frames are skipped.
pub async fn next_json(server: &mut ServerSide) -> Option<Value> {
    while let Some(frame) = server.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

pub fn memory_store() -> IdentityStore {
    IdentityStore::new(Arc::new(MemoryStore::new()))
}

/// What the next dial does
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Reject(u16, String),
    Fail(String),
    Panic,
}

/// Dialer that plays back a script, then repeats `fallback`
pub struct ScriptedDialer {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    dials: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedDialer {
    pub fn new(
        script: Vec<Outcome>,
        fallback: Outcome,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            dials: Mutex::new(Vec::new()),
            servers: tx,
        });
        (dialer, rx)
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, _proxy: Option<&ProxySpec>) -> Result<WsStream, ConnectError> {
        self.dials.lock().unwrap().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            Outcome::Accept => {
                let (client, server) = ws_pair().await;
                let _ = self.servers.send(server);
                Ok(client)
            }
            Outcome::Reject(status, body) => Err(ConnectError::Rejected { status, body }),
            Outcome::Fail(msg) => Err(ConnectError::Transport(msg)),
            Outcome::Panic => panic!("scripted dialer panic"),
        }
    }
}

/// Connectivity that plays back a script of probe results, then reports online
pub struct ScriptedConnectivity {
    script: Mutex<VecDeque<bool>>,
    probes: AtomicUsize,
}

impl ScriptedConnectivity {
    pub fn new(script: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn online() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectivity for ScriptedConnectivity {
    async fn probe(&self, _proxy: Option<&ProxySpec>) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(true)
    }
}
