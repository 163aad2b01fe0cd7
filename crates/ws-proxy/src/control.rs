//! In-band control vocabulary.
//!
//! Control messages travel as ordinary text frames over the established
//! WebSocket. Everything that does not match one of the sentinels below is
//! application payload and is never inspected further.

use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RelocationError;

/// Prefix of an upstream relocation request: `RECONNECT <json>`.
pub const RECONNECT_PREFIX: &str = "RECONNECT";

/// Asks the proxy to start queueing traffic from the other side.
pub const PROXY_RESTART: &str = "PROXY_RESTART";

/// Acknowledges [`PROXY_RESTART`]; buffering has started.
pub const PROXY_LOCKED: &str = "PROXY_LOCKED";

/// Close reason that marks an upstream close as retryable.
pub const SERVICE_RESTART: &str = "Service Restart";

/// Abnormal closure: the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// A close frame was received without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// A message from the upstream, sorted into its control class.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamSignal {
    /// The upstream wants this session continued under a new identifier.
    Relocate(Relocation),
    /// The upstream asks the proxy to hold client traffic.
    Pause,
    Payload(Message),
}

/// A message from the client, sorted into its control class.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSignal {
    /// The client asks the proxy to hold upstream traffic.
    Pause,
    Payload(Message),
}

/// A parsed `RECONNECT` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// The full control message, replayed verbatim on the next dial.
    pub raw: String,
    /// The identifier the session should be reachable under.
    pub session_id: String,
}

#[derive(Deserialize)]
struct RelocationPayload {
    #[serde(
        rename = "sessionId",
        alias = "session_id",
        alias = "connectionId",
        default
    )]
    session_id: Option<String>,
}

pub fn classify_upstream(msg: Message) -> Result<UpstreamSignal, RelocationError> {
    let Message::Text(text) = &msg else {
        return Ok(UpstreamSignal::Payload(msg));
    };

    if is_relocation(text.as_str()) {
        return parse_relocation(text.as_str()).map(UpstreamSignal::Relocate);
    }
    if text.as_str() == PROXY_RESTART {
        return Ok(UpstreamSignal::Pause);
    }
    Ok(UpstreamSignal::Payload(msg))
}

pub fn classify_client(msg: Message) -> ClientSignal {
    match &msg {
        Message::Text(text) if text.as_str() == PROXY_RESTART => ClientSignal::Pause,
        _ => ClientSignal::Payload(msg),
    }
}

fn is_relocation(text: &str) -> bool {
    text.get(..RECONNECT_PREFIX.len()) == Some(RECONNECT_PREFIX)
}

/// Parse `RECONNECT <json>` and pull out the session identifier.
pub fn parse_relocation(text: &str) -> Result<Relocation, RelocationError> {
    if !is_relocation(text) {
        return Err(RelocationError::NotRelocation);
    }

    let body = text[RECONNECT_PREFIX.len()..].trim();
    let payload: RelocationPayload =
        serde_json::from_str(body).map_err(|e| RelocationError::Malformed(e.to_string()))?;

    match payload.session_id {
        Some(id) if !id.is_empty() => Ok(Relocation {
            raw: text.to_string(),
            session_id: id,
        }),
        _ => Err(RelocationError::MissingSessionId),
    }
}

/// How a `close(code, reason)` request is carried out on a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseDirective {
    /// Drop the TCP connection without a close handshake.
    Terminate,
    /// Close handshake without a status code.
    Plain,
    /// Close handshake carrying the given code and reason.
    Handshake(CloseFrame),
}

impl CloseDirective {
    pub fn from_parts(code: Option<u16>, reason: &str) -> Self {
        let Some(code) = code else {
            return Self::Plain;
        };
        if code == CLOSE_ABNORMAL {
            return Self::Terminate;
        }

        // 1005 and the other reserved codes must never appear on the wire.
        let code = CloseCode::from(code);
        if !code.is_allowed() {
            return Self::Plain;
        }

        Self::Handshake(CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        })
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
