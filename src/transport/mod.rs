//! Transport connector
//!
//! Opens one WebSocket connection to the remote service, optionally tunneled
//! through a SOCKS5 or HTTP(S) CONNECT proxy, with TLS handled according to a
//! [`TlsPolicy`]. Handshake rejections come back typed as
//! [`ConnectError::Rejected`] so callers can apply their own classification.

pub mod proxy;
pub mod tls;

use async_trait::async_trait;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, Request},
        Error as WsError,
    },
    WebSocketStream,
};
use tracing::debug;
use url::Url;

pub use proxy::{ProxyKind, ProxySpec};
pub use tls::TlsPolicy;

/// Byte stream a WebSocket can run over (plain TCP, proxied TCP, TLS)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A live WebSocket connection
pub type WsStream = WebSocketStream<BoxedStream>;

/// Why a connection attempt failed
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// The server answered the upgrade request with a non-101 status
    #[error("Handshake rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The proxy refused or failed to open the tunnel
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Socket, TLS or WebSocket protocol failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectError {
    /// HTTP status of a rejected handshake
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Something that can open a WebSocket session, directly or through a proxy
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, proxy: Option<&ProxySpec>) -> Result<WsStream, ConnectError>;
}

/// Dialer for one fixed endpoint
pub struct WsConnector {
    endpoint: Url,
    tls: TlsPolicy,
    tls_config: Arc<ClientConfig>,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(
        endpoint: Url,
        tls: TlsPolicy,
        headers: Vec<(String, String)>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let tls_config = tls.client_config()?;
        Ok(Self {
            endpoint,
            tls,
            tls_config,
            headers,
            connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Dialer for WsConnector {
    async fn dial(&self, proxy: Option<&ProxySpec>) -> Result<WsStream, ConnectError> {
        let attempt = connect_with_config(
            &self.endpoint,
            &self.tls,
            &self.tls_config,
            proxy,
            &self.headers,
        );

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Transport(format!(
                "connect to {} timed out after {:?}",
                self.endpoint, self.connect_timeout
            ))),
        }
    }
}

/// Open a WebSocket connection to `endpoint`.
///
/// With a proxy the TCP stream is tunneled first; TLS (for `wss://`) and the
/// WebSocket upgrade then run over the tunnel.
pub async fn connect(
    endpoint: &Url,
    tls: &TlsPolicy,
    proxy: Option<&ProxySpec>,
    headers: &[(String, String)],
) -> Result<WsStream, ConnectError> {
    let tls_config = tls.client_config()?;
    connect_with_config(endpoint, tls, &tls_config, proxy, headers).await
}

async fn connect_with_config(
    endpoint: &Url,
    tls: &TlsPolicy,
    tls_config: &Arc<ClientConfig>,
    proxy: Option<&ProxySpec>,
    headers: &[(String, String)],
) -> Result<WsStream, ConnectError> {
    let host = host_name(endpoint)?;
    let port = endpoint
        .port_or_known_default()
        .ok_or_else(|| ConnectError::Transport(format!("No port for {}", endpoint)))?;

    let tcp: BoxedStream = match proxy {
        Some(proxy) => proxy::open_tunnel(proxy, &host, port, tls, tls_config).await?,
        None => {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| {
                    ConnectError::Transport(format!("TCP connect to {}:{} failed: {}", host, port, e))
                })?;
            Box::new(stream)
        }
    };

    let stream: BoxedStream = match endpoint.scheme() {
        "wss" => Box::new(tls::handshake(tls, tls_config, &host, tcp).await?),
        "ws" => tcp,
        other => {
            return Err(ConnectError::Transport(format!(
                "Unsupported endpoint scheme '{}'",
                other
            )))
        }
    };

    let request = build_request(endpoint, headers)?;
    let (ws, response) = client_async_with_config(request, stream, None)
        .await
        .map_err(classify_handshake_error)?;

    debug!(
        "WebSocket connected to {} (status {}, via {})",
        endpoint,
        response.status(),
        proxy.map(|p| p.redacted()).unwrap_or_else(|| "direct".to_string())
    );

    Ok(ws)
}

fn host_name(endpoint: &Url) -> Result<String, ConnectError> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| ConnectError::Transport(format!("No host in {}", endpoint)))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn build_request(endpoint: &Url, headers: &[(String, String)]) -> Result<Request<()>, ConnectError> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::Transport(format!("Invalid request: {}", e)))?;

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectError::Transport(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConnectError::Transport(format!("Invalid header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}

fn classify_handshake_error(e: WsError) -> ConnectError {
    match e {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            ConnectError::Rejected { status, body }
        }
        other => ConnectError::Transport(format!("WebSocket handshake failed: {}", other)),
    }
}
