//! Request metadata captured during the client handshake.

use std::net::SocketAddr;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

/// Identifier a client supplies (or the proxy assigns) on a first connection.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Identifier a client presents to reattach to an existing session.
pub const RECONNECT_ID_HEADER: &str = "x-reconnect-id";

/// Flag set on upstream dials that resume a relocated session.
pub const RESUMED_DIAL_HEADER: &str = "x-reconnect";

/// Headers the transport regenerates for every handshake; they are never
/// copied onto the upstream dial.
pub const DISALLOWED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "upgrade",
];

/// What the proxy keeps from a client's upgrade request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    /// Request path and query, e.g. `/session?user=7`.
    pub path: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionMeta {
    pub fn from_request<B>(req: &http::Request<B>, remote_addr: Option<SocketAddr>) -> Self {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            path,
            headers: req.headers().clone(),
            remote_addr,
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        header_str(&self.headers, CONNECTION_ID_HEADER)
    }

    pub fn reconnect_id(&self) -> Option<&str> {
        header_str(&self.headers, RECONNECT_ID_HEADER)
    }

    /// The first subprotocol the client offered. The handshake response
    /// selects it so clients that require a protocol accept the upgrade.
    pub fn offered_protocol(&self) -> Option<&str> {
        header_str(&self.headers, "sec-websocket-protocol")?
            .split(',')
            .map(str::trim)
            .find(|p| !p.is_empty())
    }

    /// Record a proxy-assigned session identifier so the upstream sees the
    /// same id the registry uses.
    pub fn assign_connection_id(&mut self, id: &str) {
        if let Ok(value) = HeaderValue::from_str(id) {
            self.headers
                .insert(HeaderName::from_static(CONNECTION_ID_HEADER), value);
        }
    }

    /// The client's headers minus the ones the transport regenerates.
    pub fn upstream_headers(&self) -> HeaderMap {
        sanitize_headers(&self.headers)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = headers.clone();
    for name in DISALLOWED_HEADERS {
        sanitized.remove(*name);
    }
    sanitized
}

/// Resolve the client's request path against the upstream base URL.
pub fn upstream_target(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    base.join(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, headers: &[(&str, &str)]) -> http::Request<()> {
        let mut builder = http::Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn extracts_identifiers() {
        let req = request(
            "/chat",
            &[(CONNECTION_ID_HEADER, "A"), (RECONNECT_ID_HEADER, "B")],
        );
        let meta = ConnectionMeta::from_request(&req, None);
        assert_eq!(meta.connection_id(), Some("A"));
        assert_eq!(meta.reconnect_id(), Some("B"));
        assert_eq!(meta.path, "/chat");
    }

    #[test]
    fn keeps_query_string() {
        let meta = ConnectionMeta::from_request(&request("/chat?room=4", &[]), None);
        assert_eq!(meta.path, "/chat?room=4");
        assert_eq!(meta.reconnect_id(), None);
    }

    #[test]
    fn first_offered_protocol_is_selected() {
        let req = request(
            "/",
            &[("sec-websocket-protocol", " graphql-ws , graphql-transport-ws")],
        );
        let meta = ConnectionMeta::from_request(&req, None);
        assert_eq!(meta.offered_protocol(), Some("graphql-ws"));

        let meta = ConnectionMeta::from_request(&request("/", &[]), None);
        assert_eq!(meta.offered_protocol(), None);
    }

    #[test]
    fn sanitize_strips_handshake_headers_only() {
        let req = request(
            "/",
            &[
                ("host", "proxy.local"),
                ("connection", "Upgrade"),
                ("upgrade", "websocket"),
                ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
                ("sec-websocket-version", "13"),
                ("authorization", "Bearer t"),
                (CONNECTION_ID_HEADER, "A"),
            ],
        );
        let headers = ConnectionMeta::from_request(&req, None).upstream_headers();
        for name in DISALLOWED_HEADERS {
            assert!(headers.get(*name).is_none(), "{name} should be stripped");
        }
        assert_eq!(headers.get("authorization").unwrap(), "Bearer t");
        assert_eq!(headers.get(CONNECTION_ID_HEADER).unwrap(), "A");
    }

    #[test]
    fn assigned_id_is_visible_to_upstream() {
        let mut meta = ConnectionMeta::from_request(&request("/", &[]), None);
        meta.assign_connection_id("generated");
        assert_eq!(meta.connection_id(), Some("generated"));
        assert_eq!(
            meta.upstream_headers().get(CONNECTION_ID_HEADER).unwrap(),
            "generated"
        );
    }

    #[test]
    fn target_joins_path_onto_base() {
        let base = Url::parse("ws://127.0.0.1:9000").unwrap();
        let target = upstream_target(&base, "/chat?room=4").unwrap();
        assert_eq!(target.as_str(), "ws://127.0.0.1:9000/chat?room=4");
    }

    #[test]
    fn absolute_path_replaces_base_path() {
        let base = Url::parse("wss://backend.internal/api/").unwrap();
        let target = upstream_target(&base, "/socket").unwrap();
        assert_eq!(target.as_str(), "wss://backend.internal/socket");
    }
}
