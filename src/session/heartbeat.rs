//! Heartbeat task
//!
//! Sends a client-initiated `PING` on a fixed interval for the lifetime of one
//! connection. Replies are not awaited here; the protocol engine answers them.
//! The task is owned by the connection scope: [`Heartbeat::stop`] cancels and
//! joins it, and dropping the handle aborts it.

use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::sleep_or_cancel;
use crate::protocol::OutboundMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between PINGs (20s, 60s and 120s are all deployed values)
    pub interval: Duration,
    /// Wait before the first PING after the connection opens
    pub initial_delay: Duration,
    /// `version` field carried by every PING
    pub version: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(1),
            version: "1.0.0".to_string(),
        }
    }
}

/// Handle to a running heartbeat task
pub struct Heartbeat {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
}

impl Heartbeat {
    /// Start sending PINGs into `sink` until `cancel` fires or a send fails
    pub fn spawn<K>(sink: Arc<Mutex<K>>, config: HeartbeatConfig, cancel: CancellationToken) -> Self
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: Display,
    {
        let sent = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(heartbeat_loop(
            sink,
            config,
            cancel.clone(),
            Arc::clone(&sent),
        ));

        Self {
            cancel,
            handle: Some(handle),
            sent,
        }
    }

    /// Number of PINGs sent so far
    pub fn pings_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Cancel the task and wait for it to finish. No PING is sent after this
    /// returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Heartbeat task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn heartbeat_loop<K>(
    sink: Arc<Mutex<K>>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
    sent: Arc<AtomicU64>,
) where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: Display,
{
    if !sleep_or_cancel(&cancel, config.initial_delay).await {
        return;
    }

    loop {
        let ping = OutboundMessage::ping(&config.version);
        let text = match serde_json::to_string(&ping) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode PING: {}", e);
                return;
            }
        };

        {
            let mut sink = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = sink.lock() => guard,
            };
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Heartbeat stopped, send failed: {}", e);
                return;
            }
        }

        sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent PING {}", ping.id);

        if !sleep_or_cancel(&cancel, config.interval).await {
            return;
        }
    }
}
