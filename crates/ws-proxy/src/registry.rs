//! Identifier directory and front door for new client sockets.
//!
//! A session can be reachable under several identifiers at once: the one the
//! client connected with plus any the upstream relocated it to. The registry
//! keeps `identifier -> SessionKey` aliases next to the `SessionKey ->
//! SessionHandle` table so a relocated session is never duplicated and its
//! cleanup drops every alias in one step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use session_journal::{JournalEntry, JournalSink, SessionEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;
use crate::meta::ConnectionMeta;
use crate::session::{self, SessionHandle, SessionKey, SessionSettings};
use crate::stats::ProxyStats;
use crate::upstream::Dialer;

/// How a client socket was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new session was created under this identifier.
    Opened(String),
    /// The socket was handed to the live session with this identifier.
    Resumed(String),
}

impl Admission {
    pub fn session_id(&self) -> &str {
        match self {
            Admission::Opened(id) | Admission::Resumed(id) => id,
        }
    }
}

/// Shared, cloneable session directory.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

struct Shared {
    settings: SessionSettings,
    dialer: Arc<dyn Dialer>,
    journal: JournalSink,
    stats: Arc<ProxyStats>,
    directory: Mutex<Directory>,
}

#[derive(Default)]
struct Directory {
    sessions: HashMap<SessionKey, SessionHandle>,
    aliases: HashMap<String, SessionKey>,
}

impl Registry {
    pub fn new(
        settings: SessionSettings,
        dialer: Arc<dyn Dialer>,
        journal: JournalSink,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                dialer,
                journal,
                stats,
                directory: Mutex::new(Directory::default()),
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::clone(&self.shared.dialer)
    }

    pub fn journal(&self) -> &JournalSink {
        &self.shared.journal
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.shared.stats
    }

    /// Route an upgraded client socket.
    ///
    /// With `x-reconnect-id` the socket joins the matching live session or is
    /// rejected. Without it a new session is started under `x-connection-id`,
    /// or under a fresh UUID that is also forwarded upstream.
    pub fn on_connect<S>(
        &self,
        ws: WebSocketStream<S>,
        mut meta: ConnectionMeta,
    ) -> Result<Admission, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(reconnect_id) = meta.reconnect_id().map(str::to_owned) {
            let Some(handle) = self.lookup(&reconnect_id) else {
                self.reject_reconnect(&reconnect_id);
                return Err(ProxyError::UnknownReconnectId(reconnect_id));
            };
            if let Err(err) = handle.attach(ws, meta) {
                self.reject_reconnect(&reconnect_id);
                return Err(err);
            }
            tracing::debug!(session_id = %reconnect_id, key = %handle.key(), "client socket resuming");
            return Ok(Admission::Resumed(reconnect_id));
        }

        let session_id = match meta.connection_id() {
            Some(id) => id.to_owned(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                meta.assign_connection_id(&id);
                id
            }
        };

        let handle = session::spawn(session_id.clone(), self.clone());
        self.insert(&session_id, handle.clone());
        handle.attach(ws, meta)?;
        Ok(Admission::Opened(session_id))
    }

    /// Count and journal a reconnect attempt that found no session.
    pub fn reject_reconnect(&self, reconnect_id: &str) {
        self.shared.stats.reconnect_rejected();
        tracing::warn!(session_id = %reconnect_id, "rejecting reconnect for unknown session");
        self.shared.journal.record(JournalEntry::new(
            SessionEvent::ReconnectRejected,
            reconnect_id,
            serde_json::Value::Null,
        ));
    }

    pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
        let directory = self.directory();
        let key = directory.aliases.get(id)?;
        directory.sessions.get(key).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.directory().aliases.contains_key(id)
    }

    /// Number of live sessions, not identifiers.
    pub fn len(&self) -> usize {
        self.directory().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new session under its first identifier.
    pub(crate) fn insert(&self, id: &str, handle: SessionHandle) {
        let key = handle.key();
        let mut directory = self.directory();
        directory.sessions.insert(key, handle);
        Self::point(&mut directory, id, key);
    }

    /// Make a live session reachable under one more identifier.
    pub(crate) fn register_alias(&self, key: SessionKey, id: &str) {
        let mut directory = self.directory();
        if !directory.sessions.contains_key(&key) {
            tracing::debug!(session_id = %id, %key, "not aliasing a released session");
            return;
        }
        Self::point(&mut directory, id, key);
    }

    /// Drop a session and all of its identifiers. Returns the identifiers
    /// that were removed.
    pub(crate) fn release(&self, key: SessionKey) -> Vec<String> {
        let mut directory = self.directory();
        directory.sessions.remove(&key);

        let mut released = Vec::new();
        directory.aliases.retain(|id, k| {
            if *k == key {
                released.push(id.clone());
                false
            } else {
                true
            }
        });
        released.sort();
        released
    }

    fn point(directory: &mut Directory, id: &str, key: SessionKey) {
        if let Some(previous) = directory.aliases.insert(id.to_owned(), key) {
            if previous != key {
                tracing::warn!(
                    session_id = %id,
                    previous = %previous,
                    replacement = %key,
                    "identifier moved to another session"
                );
            }
        }
    }

    fn directory(&self) -> MutexGuard<'_, Directory> {
        self.shared
            .directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let directory = self.directory();
        f.debug_struct("Registry")
            .field("sessions", &directory.sessions.len())
            .field("aliases", &directory.aliases.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::HeaderValue;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use url::Url;

    use super::*;
    use crate::meta::{CONNECTION_ID_HEADER, RECONNECT_ID_HEADER};
    use crate::upstream::{RecordingDialer, RetryPolicy};

    fn registry() -> (Registry, Arc<RecordingDialer>) {
        let dialer = Arc::new(RecordingDialer::default());
        let registry = Registry::new(
            SessionSettings {
                upstream_url: Url::parse("ws://127.0.0.1:9000").unwrap(),
                grace_period: Duration::from_millis(5000),
                retry: RetryPolicy::default(),
            },
            dialer.clone(),
            JournalSink::disabled(),
            Arc::new(ProxyStats::default()),
        );
        (registry, dialer)
    }

    fn detached_handle() -> (SessionHandle, mpsc::UnboundedReceiver<crate::session::SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(SessionKey::new(), tx), rx)
    }

    async fn server_socket() -> WebSocketStream<tokio::io::DuplexStream> {
        let (server, _client) = tokio::io::duplex(1024);
        WebSocketStream::from_raw_socket(server, Role::Server, None).await
    }

    fn meta(headers: &[(&'static str, &str)]) -> ConnectionMeta {
        let mut meta = ConnectionMeta {
            path: "/".to_string(),
            ..ConnectionMeta::default()
        };
        for (name, value) in headers {
            meta.headers
                .insert(*name, HeaderValue::from_str(value).unwrap());
        }
        meta
    }

    #[test]
    fn alias_resolves_to_same_session() {
        let (registry, _) = registry();
        let (handle, _rx) = detached_handle();
        let key = handle.key();

        registry.insert("A", handle);
        registry.register_alias(key, "X");

        assert_eq!(registry.lookup("A").unwrap().key(), key);
        assert_eq!(registry.lookup("X").unwrap().key(), key);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("B").is_none());
    }

    #[test]
    fn release_drops_every_alias_once() {
        let (registry, _) = registry();
        let (handle, _rx) = detached_handle();
        let key = handle.key();
        registry.insert("A", handle);
        registry.register_alias(key, "X");

        assert_eq!(registry.release(key), vec!["A", "X"]);
        assert!(registry.is_empty());
        assert!(!registry.contains("A"));
        assert!(!registry.contains("X"));
        assert!(registry.release(key).is_empty());
    }

    #[test]
    fn release_keeps_identifier_taken_over_by_other_session() {
        let (registry, _) = registry();
        let (first, _rx1) = detached_handle();
        let (second, _rx2) = detached_handle();
        let first_key = first.key();
        let second_key = second.key();

        registry.insert("A", first);
        registry.insert("B", second);
        registry.register_alias(second_key, "A");

        registry.release(first_key);
        assert_eq!(registry.lookup("A").unwrap().key(), second_key);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn released_session_cannot_be_aliased() {
        let (registry, _) = registry();
        let (handle, _rx) = detached_handle();
        let key = handle.key();
        registry.insert("A", handle);
        registry.release(key);

        registry.register_alias(key, "X");
        assert!(!registry.contains("X"));
    }

    #[tokio::test]
    async fn first_connection_opens_session_under_its_id() {
        let (registry, dialer) = registry();
        let admission = registry
            .on_connect(server_socket().await, meta(&[(CONNECTION_ID_HEADER, "A")]))
            .unwrap();

        assert_eq!(admission, Admission::Opened("A".to_string()));
        assert!(registry.contains("A"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dialer.dials(), 1);
        let (request, _) = dialer.last();
        assert_eq!(request.headers.get(CONNECTION_ID_HEADER).unwrap(), "A");
    }

    #[tokio::test]
    async fn missing_connection_id_is_assigned_and_forwarded() {
        let (registry, dialer) = registry();
        let admission = registry
            .on_connect(server_socket().await, meta(&[]))
            .unwrap();

        let id = admission.session_id().to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert!(registry.contains(&id));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (request, _) = dialer.last();
        assert_eq!(request.headers.get(CONNECTION_ID_HEADER).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn reconnect_joins_existing_session() {
        let (registry, _) = registry();
        registry
            .on_connect(server_socket().await, meta(&[(CONNECTION_ID_HEADER, "A")]))
            .unwrap();
        let key = registry.lookup("A").unwrap().key();

        let admission = registry
            .on_connect(server_socket().await, meta(&[(RECONNECT_ID_HEADER, "A")]))
            .unwrap();

        assert_eq!(admission, Admission::Resumed("A".to_string()));
        assert_eq!(registry.lookup("A").unwrap().key(), key);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_reconnect_id_is_rejected() {
        let (registry, _) = registry();
        let err = registry
            .on_connect(server_socket().await, meta(&[(RECONNECT_ID_HEADER, "ghost")]))
            .unwrap_err();

        assert!(matches!(err, ProxyError::UnknownReconnectId(id) if id == "ghost"));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().snapshot().reconnects_rejected, 1);
    }
}
