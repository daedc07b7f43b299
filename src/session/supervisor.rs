//! Session supervisor
//!
//! Owns one identity for the life of the process. Each cycle:
//!
//! 1. Probe connectivity; while offline, retry on a short fixed interval
//! 2. Sleep a small random jitter so identities do not connect in lockstep
//! 3. Take an admission permit and dial
//! 4. Run the protocol engine until the connection ends
//! 5. Pick the next delay from how the attempt ended
//!
//! A cap-exceeded rejection switches to a long doubling backoff that survives
//! repeated rejections and resets on the next successful connection or a
//! different kind of failure.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::sleep_or_cancel;
use crate::connectivity::{Connectivity, Watchdog};
use crate::identity::{IdentityKey, IdentityStore};
use crate::protocol::{ClientProfile, EngineConfig, ProtocolEngine, Termination};
use crate::transport::{ConnectError, Dialer, ProxySpec};
use crate::types::{Result, TetherError};

/// Default body marker of a cap-exceeded rejection
pub const DEFAULT_CAP_MARKER: &str = "Device creation limit exceeded";

/// Timing and classification settings shared by all supervisors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Delay after a connection ends or fails for an ordinary reason
    pub reconnect_delay: Duration,
    /// Delay between probes while offline
    pub offline_retry_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub cap_backoff_base: Duration,
    pub cap_backoff_max: Duration,
    /// Substring of the rejection body that marks a cap-exceeded refusal
    pub cap_marker: String,
    /// Re-probe interval while a connection is live; `None` disables it
    pub recheck_interval: Option<Duration>,
    pub engine: EngineConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            offline_retry_delay: Duration::from_secs(5),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(1000),
            cap_backoff_base: Duration::from_secs(60),
            cap_backoff_max: Duration::from_secs(3600),
            cap_marker: DEFAULT_CAP_MARKER.to_string(),
            recheck_interval: Some(Duration::from_secs(60)),
            engine: EngineConfig::default(),
        }
    }
}

/// Collaborators a supervisor needs, shared across identities
#[derive(Clone)]
pub struct SessionDeps {
    pub store: IdentityStore,
    pub dialer: Arc<dyn Dialer>,
    pub connectivity: Arc<dyn Connectivity>,
    /// Bounds simultaneously open connections
    pub admission: Arc<Semaphore>,
    pub profile: ClientProfile,
    /// Number of currently open connections
    pub active: Arc<AtomicUsize>,
}

/// True when `err` is a rejection whose body carries `marker` (case-insensitive)
pub fn is_cap_exceeded(err: &ConnectError, marker: &str) -> bool {
    match err {
        ConnectError::Rejected { body, .. } => {
            !marker.is_empty() && body.to_lowercase().contains(&marker.to_lowercase())
        }
        _ => false,
    }
}

/// Map a failed dial onto the crate error taxonomy
fn classify(err: &ConnectError, marker: &str) -> TetherError {
    match err {
        ConnectError::Rejected { status, .. } => TetherError::HandshakeRejected {
            status: *status,
            cap_exceeded: is_cap_exceeded(err, marker),
        },
        ConnectError::Proxy(msg) | ConnectError::Transport(msg) => {
            TetherError::Connectivity(msg.clone())
        }
    }
}

enum Step {
    /// Start the next cycle immediately
    Continue,
    /// Wait the standard reconnect delay first
    Reconnect,
    Shutdown,
}

/// Connection lifecycle of one identity
pub struct Supervisor {
    key: IdentityKey,
    proxy: Option<ProxySpec>,
    engine: ProtocolEngine,
    deps: SessionDeps,
    config: Arc<SupervisorConfig>,
    cap_backoff: Backoff,
}

impl Supervisor {
    /// Resolve the identity and cached token.
    ///
    /// Fails when the proxy URI is invalid or the store cannot be read or
    /// written; the identity is not started in that case.
    pub async fn start(
        key: IdentityKey,
        deps: SessionDeps,
        config: Arc<SupervisorConfig>,
    ) -> Result<Self> {
        let proxy = key
            .proxy
            .as_deref()
            .map(ProxySpec::parse)
            .transpose()
            .map_err(|e| TetherError::Config(format!("{}: {}", key, e)))?;

        let identity = deps.store.resolve(&key).await?;
        let token = deps.store.load_token(&key.user_id).await?;

        info!(
            "Session ready for device {} ({})",
            identity.device_id,
            if token.is_some() { "cached token" } else { "no token" }
        );

        let engine = ProtocolEngine::new(identity, deps.profile.clone(), token, deps.store.clone());
        let cap_backoff = Backoff::new(config.cap_backoff_base, config.cap_backoff_max);

        Ok(Self {
            key,
            proxy,
            engine,
            deps,
            config,
            cap_backoff,
        })
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn device_id(&self) -> &str {
        &self.engine.identity().device_id
    }

    /// Loop until `cancel` fires. The socket and heartbeat of the current
    /// connection are closed before this returns.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let step = self.cycle(&cancel).await;
            let delay = match step {
                Step::Shutdown => break,
                Step::Continue => continue,
                Step::Reconnect => self.config.reconnect_delay,
            };
            if !sleep_or_cancel(&cancel, delay).await {
                break;
            }
        }
        info!("Session for {} stopped", self.key);
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Step {
        if !self.probe(cancel).await {
            return if cancel.is_cancelled() {
                Step::Shutdown
            } else {
                warn!("No connectivity, retrying in {:?}", self.config.offline_retry_delay);
                if sleep_or_cancel(cancel, self.config.offline_retry_delay).await {
                    Step::Continue
                } else {
                    Step::Shutdown
                }
            };
        }

        if !sleep_or_cancel(cancel, self.jitter()).await {
            return Step::Shutdown;
        }

        let permit = match self.admit(cancel).await {
            Some(permit) => permit,
            None => return Step::Shutdown,
        };

        let dialed = tokio::select! {
            result = self.deps.dialer.dial(self.proxy.as_ref()) => result,
            _ = cancel.cancelled() => return Step::Shutdown,
        };

        match dialed {
            Ok(ws) => {
                self.cap_backoff.reset();
                let termination = {
                    let _active = ActiveGuard::enter(&self.deps.active);
                    info!(
                        "Connected ({} sessions connected)",
                        self.deps.active.load(Ordering::Relaxed)
                    );
                    let watchdog = self.config.recheck_interval.map(|interval| {
                        Watchdog::new(
                            Arc::clone(&self.deps.connectivity),
                            self.proxy.clone(),
                            interval,
                        )
                    });
                    self.engine
                        .run(ws, &self.config.engine, watchdog.as_ref(), cancel)
                        .await
                };
                drop(permit);

                match termination {
                    Termination::Cancelled => Step::Shutdown,
                    Termination::NormalClose => {
                        info!("Connection ended: {}", termination);
                        Step::Reconnect
                    }
                    other => {
                        warn!("Connection ended: {}", other);
                        Step::Reconnect
                    }
                }
            }
            Err(e) if is_cap_exceeded(&e, &self.config.cap_marker) => {
                drop(permit);
                error!("{}", classify(&e, &self.config.cap_marker));
                self.cap_backoff_loop(cancel).await
            }
            Err(e) => {
                drop(permit);
                self.cap_backoff.reset();
                match e.status() {
                    Some(status) => warn!("Connection failed: {}", Termination::ServerRejected(status)),
                    None => warn!("Connection failed: {}", classify(&e, &self.config.cap_marker)),
                }
                Step::Reconnect
            }
        }
    }

    /// Sleep the long backoff until connectivity is confirmed again
    async fn cap_backoff_loop(&mut self, cancel: &CancellationToken) -> Step {
        loop {
            let delay = self.cap_backoff.next_delay();
            warn!("Device limit reached, backing off for {:?}", delay);
            if !sleep_or_cancel(cancel, delay).await {
                return Step::Shutdown;
            }
            if self.probe(cancel).await {
                return Step::Continue;
            }
            if cancel.is_cancelled() {
                return Step::Shutdown;
            }
        }
    }

    async fn probe(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            online = self.deps.connectivity.probe(self.proxy.as_ref()) => online,
            _ = cancel.cancelled() => false,
        }
    }

    async fn admit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        let admission = Arc::clone(&self.deps.admission);
        tokio::select! {
            permit = admission.acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => {
                    error!("Admission semaphore closed");
                    None
                }
            },
            _ = cancel.cancelled() => None,
        }
    }

    fn jitter(&self) -> Duration {
        let min = self.config.jitter_min.as_millis() as u64;
        let max = self.config.jitter_max.as_millis() as u64;
        let (low, high) = if min <= max { (min, max) } else { (max, min) };
        let millis = rand::thread_rng().gen_range(low..=high);
        debug!("Jitter {}ms", millis);
        Duration::from_millis(millis)
    }
}

/// Counts one open connection for as long as it lives
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
