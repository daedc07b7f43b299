//! Connectivity probe
//!
//! Answers one question before every connection attempt: is the network
//! usable right now? A probe is a plain HTTP GET against a well-known URL,
//! retried with a doubling delay. Any HTTP response counts as reachable; only
//! transport failures and timeouts count against it.
//!
//! [`Watchdog`] repeats the probe while a session is live so a dead network is
//! noticed even when the socket itself stays quiet.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::transport::ProxySpec;
use crate::types::{Result, TetherError};

/// Reachability check, optionally through a proxy
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// True once any attempt gets an HTTP response
    async fn probe(&self, proxy: Option<&ProxySpec>) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub url: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one
    pub initial_delay: Duration,
    /// Send the probe through the session's proxy instead of directly
    pub via_proxy: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "https://www.google.com".to_string(),
            timeout: Duration::from_secs(5),
            attempts: 5,
            initial_delay: Duration::from_secs(5),
            via_proxy: false,
        }
    }
}

/// HTTP-based [`Connectivity`] with one cached client per proxy
pub struct ConnectivityMonitor {
    config: ProbeConfig,
    direct: reqwest::Client,
    proxied: DashMap<String, reqwest::Client>,
}

impl ConnectivityMonitor {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let direct = build_client(&config, None)?;
        Ok(Self {
            config,
            direct,
            proxied: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn client_for(&self, proxy: Option<&ProxySpec>) -> Result<reqwest::Client> {
        let proxy = match proxy {
            Some(proxy) if self.config.via_proxy => proxy,
            _ => return Ok(self.direct.clone()),
        };

        let key = proxy.uri();
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(&self.config, Some(proxy))?;
        self.proxied.insert(key, client.clone());
        Ok(client)
    }

    async fn attempt(&self, client: &reqwest::Client) -> std::result::Result<u16, reqwest::Error> {
        let response = client.get(&self.config.url).send().await?;
        Ok(response.status().as_u16())
    }
}

fn build_client(config: &ProbeConfig, proxy: Option<&ProxySpec>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);

    builder = match proxy {
        Some(proxy) => {
            let proxy = reqwest::Proxy::all(proxy.uri())
                .map_err(|e| TetherError::Config(format!("Invalid probe proxy {}: {}", proxy, e)))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| TetherError::Internal(format!("Failed to build probe client: {}", e)))
}

#[async_trait]
impl Connectivity for ConnectivityMonitor {
    async fn probe(&self, proxy: Option<&ProxySpec>) -> bool {
        let client = match self.client_for(proxy) {
            Ok(client) => client,
            Err(e) => {
                warn!("Connectivity probe unavailable: {}", e);
                return false;
            }
        };

        let mut delay = self.config.initial_delay;
        for attempt in 1..=self.config.attempts {
            match self.attempt(&client).await {
                Ok(status) => {
                    debug!("Connectivity probe got HTTP {} on attempt {}", status, attempt);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Connectivity probe attempt {}/{} failed: {}",
                        attempt, self.config.attempts, e
                    );
                }
            }

            if attempt < self.config.attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        false
    }
}

/// Periodic re-probe for a live session
pub struct Watchdog {
    monitor: Arc<dyn Connectivity>,
    proxy: Option<ProxySpec>,
    interval: Duration,
}

impl Watchdog {
    pub fn new(monitor: Arc<dyn Connectivity>, proxy: Option<ProxySpec>, interval: Duration) -> Self {
        Self {
            monitor,
            proxy,
            interval,
        }
    }

    /// Resolves the first time a probe fails. Never resolves while the
    /// network stays up.
    pub async fn wait_for_loss(&self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if !self.monitor.probe(self.proxy.as_ref()).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        results: Vec<bool>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connectivity for Scripted {
        async fn probe(&self, _proxy: Option<&ProxySpec>) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.get(n).copied().unwrap_or(true)
        }
    }

    #[test]
    fn test_default_probe_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.url, "https://www.google.com");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert!(!config.via_proxy);
    }

    #[test]
    fn test_direct_client_used_without_via_proxy() {
        let monitor = ConnectivityMonitor::new(ProbeConfig::default()).unwrap();
        let proxy = ProxySpec::parse("socks5://10.0.0.1:1080").unwrap();
        monitor.client_for(Some(&proxy)).unwrap();
        assert!(monitor.proxied.is_empty());
    }

    #[test]
    fn test_proxied_clients_are_cached() {
        let monitor = ConnectivityMonitor::new(ProbeConfig {
            via_proxy: true,
            ..ProbeConfig::default()
        })
        .unwrap();
        let proxy = ProxySpec::parse("http://user:pw@10.0.0.1:3128").unwrap();

        monitor.client_for(Some(&proxy)).unwrap();
        monitor.client_for(Some(&proxy)).unwrap();
        assert_eq!(monitor.proxied.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_on_first_failed_probe() {
        let monitor = Arc::new(Scripted {
            results: vec![true, true, false],
            calls: AtomicUsize::new(0),
        });
        let watchdog = Watchdog::new(monitor.clone(), None, Duration::from_secs(30));

        let start = tokio::time::Instant::now();
        watchdog.wait_for_loss().await;

        assert_eq!(monitor.calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(90));
        assert!(start.elapsed() < Duration::from_secs(91));
    }
}
