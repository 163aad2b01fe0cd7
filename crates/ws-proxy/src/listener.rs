use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use http::StatusCode;
use session_journal::JournalSink;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};

use crate::error::ProxyError;
use crate::meta::ConnectionMeta;
use crate::registry::{Admission, Registry};
use crate::session::SessionSettings;
use crate::stats::ProxyStats;
use crate::upstream::{Dialer, TungsteniteDialer};

/// Configuration for the reconnecting WebSocket proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Upstream target, grace period and retry policy for every session.
    pub session: SessionSettings,
}

/// The WebSocket reverse proxy server.
///
/// Accepts client WebSocket connections, refuses reconnects for sessions
/// that no longer exist, and hands every other socket to the [`Registry`],
/// which either starts a session or reattaches the socket to a live one.
pub struct Proxy {
    config: ProxyConfig,
    registry: Registry,
}

impl Proxy {
    /// Create a proxy that dials upstreams with tokio-tungstenite.
    pub fn new(config: ProxyConfig, journal: JournalSink) -> Self {
        Self::with_dialer(config, journal, Arc::new(TungsteniteDialer))
    }

    pub fn with_dialer(config: ProxyConfig, journal: JournalSink, dialer: Arc<dyn Dialer>) -> Self {
        let registry = Registry::new(
            config.session.clone(),
            dialer,
            journal,
            Arc::new(ProxyStats::default()),
        );
        Self { config, registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(self.registry.stats())
    }

    /// Bind to `listen_addr` and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener. Each connection is
    /// handled in its own Tokio task; a failing connection never stops the
    /// loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr().map_err(ProxyError::Accept)?;
        tracing::info!(
            addr = %local_addr,
            upstream = %self.config.session.upstream_url,
            "ws-proxy listening"
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(err = %ProxyError::Accept(err), "accept failed");
                    continue;
                }
            };
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, registry).await {
                    tracing::warn!(%remote_addr, %err, "connection not admitted");
                }
            });
        }
    }
}

/// Upgrade one TCP connection and route it to a session.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    registry: Registry,
) -> Result<(), ProxyError> {
    let captured: Arc<Mutex<Option<ConnectionMeta>>> = Arc::new(Mutex::new(None));
    let captured_cb = Arc::clone(&captured);
    let registry_cb = registry.clone();

    let callback =
        move |req: &HsRequest, mut response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let meta = ConnectionMeta::from_request(req, Some(remote_addr));

            if let Some(reconnect_id) = meta.reconnect_id() {
                if !registry_cb.contains(reconnect_id) {
                    registry_cb.reject_reconnect(reconnect_id);
                    let mut err_response =
                        ErrorResponse::new(Some("Session no longer exists".to_string()));
                    *err_response.status_mut() = StatusCode::GONE;
                    return Err(err_response);
                }
            }

            if let Some(protocol) = meta.offered_protocol() {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }

            *captured_cb.lock().unwrap_or_else(PoisonError::into_inner) = Some(meta);
            Ok(response)
        };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let meta = captured
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_else(|| ConnectionMeta {
            path: "/".to_string(),
            remote_addr: Some(remote_addr),
            ..ConnectionMeta::default()
        });

    match registry.on_connect(ws, meta)? {
        Admission::Opened(session_id) => {
            tracing::info!(%session_id, %remote_addr, "client connected");
        }
        Admission::Resumed(session_id) => {
            tracing::info!(%session_id, %remote_addr, "client reconnected");
        }
    }
    Ok(())
}
