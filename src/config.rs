//! Configuration for tether
//!
//! CLI arguments and environment variable handling using clap. Everything
//! below `main` receives the typed structs built here, never `Args` itself.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::connectivity::ProbeConfig;
use crate::controller::ControllerConfig;
use crate::identity::IdentityKey;
use crate::logging::LogFormat;
use crate::protocol::messages::{
    DEFAULT_CLIENT_VERSION, DEFAULT_DEVICE_TYPE, DEFAULT_EXTENSION_ID, DEFAULT_USER_AGENT,
};
use crate::protocol::{ClientProfile, EngineConfig};
use crate::session::supervisor::DEFAULT_CAP_MARKER;
use crate::session::{HeartbeatConfig, SupervisorConfig};
use crate::transport::{ProxySpec, TlsPolicy};
use crate::types::{Result, TetherError};

/// Tether - keeps device sessions alive against a remote WebSocket service
#[derive(Parser, Debug, Clone)]
#[command(name = "tether")]
#[command(about = "Long-lived WebSocket sessions per user and proxy")]
pub struct Args {
    /// User ids to run sessions for (comma separated)
    #[arg(long, env = "USER_IDS", value_delimiter = ',', required = true)]
    pub user_ids: Vec<String>,

    /// File with one proxy URI per line; without it every user connects directly
    #[arg(long, env = "PROXY_FILE")]
    pub proxy_file: Option<PathBuf>,

    /// WebSocket endpoint (ws:// or wss://)
    #[arg(long, env = "ENDPOINT")]
    pub endpoint: String,

    /// Verify the server certificate against the web PKI roots
    #[arg(long, env = "TLS_VERIFY", default_value = "false")]
    pub tls_verify: bool,

    /// TLS server name to present instead of the endpoint host
    #[arg(long, env = "TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,

    /// Directory holding device ids and session tokens
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// User-Agent sent on the upgrade request and in AUTH replies
    #[arg(long, env = "USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Client version reported in AUTH replies
    #[arg(long, env = "CLIENT_VERSION", default_value = DEFAULT_CLIENT_VERSION)]
    pub client_version: String,

    #[arg(long, env = "EXTENSION_ID", default_value = DEFAULT_EXTENSION_ID)]
    pub extension_id: String,

    #[arg(long, env = "DEVICE_TYPE", default_value = DEFAULT_DEVICE_TYPE)]
    pub device_type: String,

    /// Version carried by heartbeat PINGs
    #[arg(long, env = "PING_VERSION", default_value = "1.0.0")]
    pub ping_version: String,

    /// Seconds between heartbeat PINGs
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "60")]
    pub ping_interval_secs: u64,

    /// Delay before the first PING of a connection, in milliseconds
    #[arg(long, env = "PING_INITIAL_DELAY_MS", default_value = "1000")]
    pub ping_initial_delay_ms: u64,

    /// Close a connection that has been silent this long
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "300")]
    pub idle_timeout_secs: u64,

    /// Re-probe connectivity this often while connected (0 disables)
    #[arg(long, env = "RECHECK_INTERVAL_SECS", default_value = "60")]
    pub recheck_interval_secs: u64,

    /// WebSocket connect timeout, including proxy and TLS handshakes
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "30")]
    pub connect_timeout_secs: u64,

    /// URL fetched by the connectivity probe
    #[arg(long, env = "PROBE_URL", default_value = "https://www.google.com")]
    pub probe_url: String,

    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value = "5")]
    pub probe_timeout_secs: u64,

    #[arg(long, env = "PROBE_ATTEMPTS", default_value = "5")]
    pub probe_attempts: u32,

    /// Delay after the first failed probe attempt; doubles afterwards
    #[arg(long, env = "PROBE_INITIAL_DELAY_SECS", default_value = "5")]
    pub probe_initial_delay_secs: u64,

    /// Send the probe through the session's proxy
    #[arg(long, env = "PROBE_VIA_PROXY", default_value = "false")]
    pub probe_via_proxy: bool,

    /// Delay before reconnecting after a connection ends
    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Delay between probes while offline
    #[arg(long, env = "OFFLINE_RETRY_DELAY_SECS", default_value = "5")]
    pub offline_retry_delay_secs: u64,

    #[arg(long, env = "JITTER_MIN_MS", default_value = "100")]
    pub jitter_min_ms: u64,

    #[arg(long, env = "JITTER_MAX_MS", default_value = "1000")]
    pub jitter_max_ms: u64,

    /// First delay after a cap-exceeded rejection
    #[arg(long, env = "CAP_BACKOFF_BASE_SECS", default_value = "60")]
    pub cap_backoff_base_secs: u64,

    #[arg(long, env = "CAP_BACKOFF_MAX_SECS", default_value = "3600")]
    pub cap_backoff_max_secs: u64,

    /// Rejection body text that marks a cap-exceeded refusal
    #[arg(long, env = "CAP_MARKER", default_value = DEFAULT_CAP_MARKER)]
    pub cap_marker: String,

    /// Maximum simultaneously open connections (unlimited when unset)
    #[arg(long, env = "MAX_ACTIVE")]
    pub max_active: Option<usize>,

    /// Seconds between status lines (0 disables)
    #[arg(long, env = "STATUS_INTERVAL_SECS", default_value = "60")]
    pub status_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.user_ids.iter().all(|u| u.trim().is_empty()) {
            return Err("USER_IDS must name at least one user".to_string());
        }

        let endpoint = self.endpoint_url()?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(format!(
                "ENDPOINT must use ws:// or wss://, got '{}'",
                endpoint.scheme()
            ));
        }

        if self.ping_interval_secs == 0 {
            return Err("PING_INTERVAL_SECS must be greater than zero".to_string());
        }

        if self.probe_attempts == 0 {
            return Err("PROBE_ATTEMPTS must be at least 1".to_string());
        }

        if self.jitter_min_ms > self.jitter_max_ms {
            return Err("JITTER_MIN_MS must be less than or equal to JITTER_MAX_MS".to_string());
        }

        if self.cap_backoff_base_secs > self.cap_backoff_max_secs {
            return Err(
                "CAP_BACKOFF_BASE_SECS must be less than or equal to CAP_BACKOFF_MAX_SECS"
                    .to_string(),
            );
        }

        if self.max_active == Some(0) {
            return Err("MAX_ACTIVE must be at least 1 when set".to_string());
        }

        Ok(())
    }

    pub fn endpoint_url(&self) -> std::result::Result<Url, String> {
        Url::parse(&self.endpoint).map_err(|e| format!("Invalid ENDPOINT '{}': {}", self.endpoint, e))
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        TlsPolicy {
            verify: self.tls_verify,
            pinned_hostname: self.tls_server_name.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn profile(&self) -> ClientProfile {
        ClientProfile {
            user_agent: self.user_agent.clone(),
            device_type: self.device_type.clone(),
            version: self.client_version.clone(),
            extension_id: self.extension_id.clone(),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.ping_interval_secs),
            initial_delay: Duration::from_millis(self.ping_initial_delay_ms),
            version: self.ping_version.clone(),
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            url: self.probe_url.clone(),
            timeout: Duration::from_secs(self.probe_timeout_secs),
            attempts: self.probe_attempts,
            initial_delay: Duration::from_secs(self.probe_initial_delay_secs),
            via_proxy: self.probe_via_proxy,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            offline_retry_delay: Duration::from_secs(self.offline_retry_delay_secs),
            jitter_min: Duration::from_millis(self.jitter_min_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
            cap_backoff_base: Duration::from_secs(self.cap_backoff_base_secs),
            cap_backoff_max: Duration::from_secs(self.cap_backoff_max_secs),
            cap_marker: self.cap_marker.clone(),
            recheck_interval: non_zero_secs(self.recheck_interval_secs),
            engine: EngineConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                heartbeat: self.heartbeat_config(),
            },
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_active: self.max_active,
            status_interval: non_zero_secs(self.status_interval_secs),
            restart_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    /// Every (user, proxy) pair to run, in file order per user
    pub fn identities(&self) -> Result<Vec<IdentityKey>> {
        let proxies = match &self.proxy_file {
            Some(path) => {
                let proxies = load_proxies(path)?;
                if proxies.is_empty() {
                    return Err(TetherError::Config(format!(
                        "No proxies listed in {}",
                        path.display()
                    )));
                }
                proxies
            }
            None => Vec::new(),
        };

        let users = self
            .user_ids
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty());

        let mut identities = Vec::new();
        for user in users {
            if proxies.is_empty() {
                identities.push(IdentityKey::direct(user));
            } else {
                for proxy in &proxies {
                    identities.push(IdentityKey::new(user, Some(proxy.clone())));
                }
            }
        }
        Ok(identities)
    }
}

/// Read proxy URIs, one per line. Blank lines and `#` comments are skipped and
/// every remaining line must parse as a proxy.
pub fn load_proxies(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TetherError::Config(format!("Cannot read {}: {}", path.display(), e)))?;

    let mut proxies = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        ProxySpec::parse(line).map_err(|e| {
            TetherError::Config(format!("{}:{}: {}", path.display(), n + 1, e))
        })?;
        proxies.push(line.to_string());
    }
    Ok(proxies)
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
