use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the proxy front door and its transport glue.
///
/// Nothing in here ever reaches the proxied payload stream; these are for the
/// accept loop, the dialer and the caller that configures the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to dial upstream {url}: {source}")]
    Dial {
        url: url::Url,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("invalid upstream url: {0}")]
    InvalidUpstream(#[from] url::ParseError),

    #[error("no live session for reconnect id '{0}'")]
    UnknownReconnectId(String),

    #[error("session '{0}' has already shut down")]
    SessionGone(String),
}

/// Why a `RECONNECT` control message could not be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelocationError {
    #[error("message does not start with the RECONNECT prefix")]
    NotRelocation,
    #[error("malformed relocation payload: {0}")]
    Malformed(String),
    #[error("relocation payload carries no session identifier")]
    MissingSessionId,
}
