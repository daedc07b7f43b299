//! Proxy tunneling
//!
//! Proxies are selected by URI scheme:
//! - `socks5://`, `socks5h://`, `socks://` tunnel through SOCKS5
//! - `http://` tunnels through HTTP CONNECT
//! - `https://` tunnels through HTTP CONNECT sent over TLS to the proxy
//!
//! Credentials embedded in the URI (`user:pass@`) are used for the proxy
//! handshake. TLS to an `https://` proxy follows the endpoint's verify
//! setting but always names the proxy host.

use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use rustls::ClientConfig;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

use super::tls::{self, TlsPolicy};
use super::{BoxedStream, ConnectError};

/// Tunnel protocol spoken by a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    HttpConnect,
    /// HTTP CONNECT over a TLS connection to the proxy
    HttpsConnect,
}

impl ProxyKind {
    fn scheme(self) -> &'static str {
        match self {
            Self::Socks5 => "socks5",
            Self::HttpConnect => "http",
            Self::HttpsConnect => "https",
        }
    }
}

/// A parsed proxy URI
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(uri.trim())
            .map_err(|e| ConnectError::Proxy(format!("Invalid proxy URI: {}", e)))?;

        let kind = match url.scheme() {
            "socks5" | "socks5h" | "socks" => ProxyKind::Socks5,
            "http" => ProxyKind::HttpConnect,
            "https" => ProxyKind::HttpsConnect,
            other => {
                return Err(ConnectError::Proxy(format!(
                    "Unsupported proxy scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ConnectError::Proxy("Proxy URI has no host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = match (url.port(), kind) {
            (Some(port), _) => port,
            (None, ProxyKind::Socks5) => 1080,
            (None, _) => url.port_or_known_default().unwrap_or(8080),
        };

        let username = Some(decode(url.username())).filter(|u| !u.is_empty());
        let password = url.password().map(decode);

        Ok(Self {
            kind,
            host,
            port,
            username,
            password,
        })
    }

    /// Full URI including credentials, for HTTP clients that take a proxy URL.
    /// SOCKS5 proxies resolve the target name remotely.
    pub fn uri(&self) -> String {
        let scheme = match self.kind {
            ProxyKind::Socks5 => "socks5h",
            kind => kind.scheme(),
        };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                scheme,
                urlencoding::encode(user),
                urlencoding::encode(pass),
                host,
                self.port
            ),
            (Some(user), None) => {
                format!("{}://{}@{}:{}", scheme, urlencoding::encode(user), host, self.port)
            }
            _ => format!("{}://{}:{}", scheme, host, self.port),
        }
    }

    /// URI with the password masked, for logs
    pub fn redacted(&self) -> String {
        let scheme = self.kind.scheme();
        match (&self.username, &self.password) {
            (Some(user), Some(_)) => format!("{}://{}:***@{}:{}", scheme, user, self.host, self.port),
            (Some(user), None) => format!("{}://{}@{}:{}", scheme, user, self.host, self.port),
            _ => format!("{}://{}:{}", scheme, self.host, self.port),
        }
    }
}

impl FromStr for ProxySpec {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Open a TCP stream to `host:port` through `proxy`.
///
/// `tls` and `tls_config` are only used to reach an `https://` proxy.
pub async fn open_tunnel(
    proxy: &ProxySpec,
    host: &str,
    port: u16,
    tls: &TlsPolicy,
    tls_config: &Arc<ClientConfig>,
) -> Result<BoxedStream, ConnectError> {
    debug!("Opening tunnel to {}:{} via {}", host, port, proxy);

    match proxy.kind {
        ProxyKind::Socks5 => {
            let proxy_addr = (proxy.host.as_str(), proxy.port);
            let result = match &proxy.username {
                Some(user) => {
                    let pass = proxy.password.as_deref().unwrap_or("");
                    Socks5Stream::connect_with_password(proxy_addr, (host, port), user, pass).await
                }
                None => Socks5Stream::connect(proxy_addr, (host, port)).await,
            };
            let stream =
                result.map_err(|e| ConnectError::Proxy(format!("SOCKS5 via {}: {}", proxy, e)))?;
            Ok(Box::new(stream.into_inner()))
        }
        ProxyKind::HttpConnect | ProxyKind::HttpsConnect => {
            let tcp = TcpStream::connect((proxy.host.as_str(), proxy.port))
                .await
                .map_err(|e| ConnectError::Proxy(format!("TCP connect to {} failed: {}", proxy, e)))?;

            let mut stream: BoxedStream = if proxy.kind == ProxyKind::HttpsConnect {
                let policy = TlsPolicy {
                    verify: tls.verify,
                    pinned_hostname: None,
                };
                let secured = tls::handshake(&policy, tls_config, &proxy.host, Box::new(tcp))
                    .await
                    .map_err(|e| ConnectError::Proxy(format!("TLS to {}: {}", proxy, e)))?;
                Box::new(secured)
            } else {
                Box::new(tcp)
            };

            let result = match &proxy.username {
                Some(user) => {
                    let pass = proxy.password.as_deref().unwrap_or("");
                    http_connect_tokio_with_basic_auth(&mut stream, host, port, user, pass).await
                }
                None => http_connect_tokio(&mut stream, host, port).await,
            };
            result.map_err(|e| ConnectError::Proxy(format!("HTTP CONNECT via {}: {}", proxy, e)))?;
            Ok(stream)
        }
    }
}
