//! The session bridge.
//!
//! A session pairs one [`ClientEdge`] with one [`UpstreamEdge`] and outlives
//! the physical sockets behind them. All of its state lives in a
//! [`SessionCore`] owned by a single task; sockets, dial attempts and the
//! proxy front door talk to it through the [`SessionInput`] inbox, and the
//! only timers (client grace period, upstream retry delay) are deadlines the
//! task sleeps on. Nothing inside a session needs a lock.
//!
//! # Flow control
//!
//! Each direction is either forwarding or queueing:
//!
//! ```text
//! client --(incoming_locked? queue on ClientEdge : send)--> upstream
//! client <--(outgoing_locked? queue on UpstreamEdge : send)-- upstream
//! ```
//!
//! A lock is only cleared by a completed drain of its queue, so a message
//! forwarded live can never overtake one that was queued before it.

use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use session_journal::{JournalEntry, SessionEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::client::ClientEdge;
use crate::control::{ClientSignal, Relocation, UpstreamSignal, CLOSE_ABNORMAL, PROXY_LOCKED};
use crate::error::ProxyError;
use crate::meta::{upstream_target, ConnectionMeta};
use crate::registry::Registry;
use crate::socket::{spawn_pumps, Side, SocketEvent, SocketHandle};
use crate::upstream::{RetryPolicy, RetryStep, UpstreamClose, UpstreamEdge};

/// Close code sent to a client whose upstream target cannot be built.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Per-session tunables shared by every session of a proxy.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base URL the client's request path is joined onto.
    pub upstream_url: Url,
    /// How long a session waits for a dropped client to come back.
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

/// Identity of one session, independent of the ids it is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(uuid::Uuid);

impl SessionKey {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything a session task reacts to.
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// A client socket was accepted for this session (first or resume).
    Attach {
        socket: SocketHandle,
        meta: ConnectionMeta,
    },
    /// Something happened on one of the session's sockets.
    Socket {
        side: Side,
        generation: u64,
        event: SocketEvent,
    },
    /// An upstream dial finished.
    Dialed {
        generation: u64,
        outcome: Result<SocketHandle, String>,
    },
}

/// Cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: SessionKey,
    inbox: mpsc::UnboundedSender<SessionInput>,
    client_generations: Arc<AtomicU64>,
}

impl SessionHandle {
    pub(crate) fn new(key: SessionKey, inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            key,
            inbox,
            client_generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Hand a freshly accepted client socket to the session.
    pub fn attach<S>(&self, ws: WebSocketStream<S>, meta: ConnectionMeta) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let generation = self.client_generations.fetch_add(1, Ordering::Relaxed) + 1;
        let attached = spawn_pumps(ws, Side::Client, generation, &self.inbox, |socket| {
            SessionInput::Attach { socket, meta }
        });
        if attached {
            Ok(())
        } else {
            Err(ProxyError::SessionGone(self.key.to_string()))
        }
    }
}

/// Start a session task registered with `registry`. The session does
/// nothing until its first client socket is attached.
pub(crate) fn spawn(session_id: String, registry: Registry) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(SessionKey::new(), tx.clone());
    let core = SessionCore::new(handle.key(), session_id, registry, tx);
    tokio::spawn(run(core, rx));
    handle
}

async fn run(mut core: SessionCore, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
    while !core.is_finished() {
        let grace = core.grace_deadline();
        let retry = core.retry_at();

        tokio::select! {
            input = inbox.recv() => match input {
                Some(input) => core.handle(input, Instant::now()),
                None => break,
            },
            _ = sleep_until_opt(grace) => core.on_grace_expired(),
            _ = sleep_until_opt(retry) => core.on_retry_due(),
        }
    }
    tracing::debug!(session_id = %core.session_id, key = %core.key, "session task stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// The per-session state machine. Every handler is synchronous; the task in
/// [`run`] feeds it inputs and timer expiries.
pub(crate) struct SessionCore {
    key: SessionKey,
    session_id: String,
    client: ClientEdge,
    upstream: Option<UpstreamEdge>,
    /// Client messages queue instead of going upstream. Starts locked until
    /// the first upstream connection is open.
    incoming_locked: bool,
    /// Upstream messages queue instead of going to the client.
    outgoing_locked: bool,
    grace_deadline: Option<Instant>,
    finished: bool,
    registry: Registry,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl SessionCore {
    pub(crate) fn new(
        key: SessionKey,
        session_id: String,
        registry: Registry,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            key,
            session_id,
            client: ClientEdge::new(),
            upstream: None,
            incoming_locked: true,
            outgoing_locked: false,
            grace_deadline: None,
            finished: false,
            registry,
            inbox,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    pub(crate) fn retry_at(&self) -> Option<Instant> {
        self.upstream.as_ref().and_then(UpstreamEdge::retry_at)
    }

    pub(crate) fn handle(&mut self, input: SessionInput, now: Instant) {
        if self.finished {
            return;
        }

        match input {
            SessionInput::Attach { socket, meta } => self.add_connection(socket, meta),
            SessionInput::Socket {
                side: Side::Client,
                generation,
                event,
            } => {
                if self.client.is_current(generation) {
                    self.on_client_event(event, now);
                } else {
                    tracing::debug!(
                        session_id = %self.session_id,
                        generation,
                        "ignoring event from replaced client socket"
                    );
                }
            }
            SessionInput::Socket {
                side: Side::Upstream,
                generation,
                event,
            } => {
                if self.upstream.as_ref().is_some_and(|u| u.is_current(generation)) {
                    self.on_upstream_event(event, now);
                } else {
                    tracing::debug!(
                        session_id = %self.session_id,
                        generation,
                        "ignoring event from stale upstream socket"
                    );
                }
            }
            SessionInput::Dialed {
                generation,
                outcome,
            } => {
                if !self.upstream.as_ref().is_some_and(|u| u.is_pending_dial(generation)) {
                    tracing::debug!(
                        session_id = %self.session_id,
                        generation,
                        "discarding result of abandoned dial"
                    );
                    return;
                }
                match outcome {
                    Ok(socket) => self.on_upstream_open(socket),
                    Err(reason) => self.on_dial_failed(reason, now),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client side
    // -----------------------------------------------------------------------

    /// First socket: build both edges and dial upstream. Later sockets: swap
    /// the client socket in place, cancel the grace timer and catch the
    /// client up on what the upstream sent meanwhile.
    fn add_connection(&mut self, socket: SocketHandle, meta: ConnectionMeta) {
        if self.upstream.is_none() {
            self.open(socket, meta);
            return;
        }

        if self.client.is_torn_down() {
            socket.close(None, "");
            return;
        }

        let replaced = self.client.is_attached();
        self.client.set_socket(socket);
        self.grace_deadline = None;

        let stats = self.registry.stats();
        if replaced {
            stats.client_closed();
        }
        stats.client_resumed();

        tracing::info!(
            session_id = %self.session_id,
            remote_addr = ?meta.remote_addr,
            queued = self.upstream.as_ref().map_or(0, UpstreamEdge::queued),
            replaced,
            "client resumed session"
        );
        self.journal(SessionEvent::ClientResumed, serde_json::json!({ "replaced": replaced }));

        self.drain_outgoing();
    }

    fn open(&mut self, socket: SocketHandle, meta: ConnectionMeta) {
        let settings = self.registry.settings();
        let target = match upstream_target(&settings.upstream_url, &meta.path) {
            Ok(target) => target,
            Err(source) => {
                let err = ProxyError::InvalidUpstream(source);
                tracing::error!(
                    session_id = %self.session_id,
                    path = %meta.path,
                    %err,
                    "cannot build upstream target"
                );
                self.client.set_socket(socket);
                self.client.close(Some(CLOSE_INTERNAL_ERROR), "invalid upstream target");
                self.finish("invalid_target");
                return;
            }
        };

        let mut upstream = UpstreamEdge::new(
            target,
            meta.upstream_headers(),
            settings.retry,
            self.registry.dialer(),
            self.inbox.clone(),
        );

        tracing::info!(
            session_id = %self.session_id,
            remote_addr = ?meta.remote_addr,
            target = %upstream.target(),
            "session opened"
        );
        self.journal(
            SessionEvent::SessionOpened,
            serde_json::json!({
                "path": meta.path,
                "remote_addr": meta.remote_addr.map(|a| a.to_string()),
                "target": upstream.target().as_str(),
            }),
        );
        self.registry.stats().client_opened();

        self.client.set_socket(socket);
        upstream.dial();
        self.upstream = Some(upstream);
    }

    fn on_client_event(&mut self, event: SocketEvent, now: Instant) {
        match event {
            SocketEvent::Frame(msg) => match self.client.classify(msg) {
                ClientSignal::Pause => {
                    tracing::info!(session_id = %self.session_id, "client paused upstream traffic");
                    self.outgoing_locked = true;
                    if self.client.send(Message::text(PROXY_LOCKED)).is_err() {
                        tracing::debug!(
                            session_id = %self.session_id,
                            "pause acknowledgement not delivered to client"
                        );
                    }
                }
                ClientSignal::Payload(msg) => self.forward_to_upstream(msg),
            },
            // tungstenite answers client pings itself.
            SocketEvent::Ping => {}
            SocketEvent::Error(err) => {
                self.registry.stats().socket_error();
                tracing::error!(session_id = %self.session_id, %err, "client socket error");
            }
            SocketEvent::Closed { code, reason } => self.on_client_closed(code, reason, now),
        }
    }

    fn forward_to_upstream(&mut self, msg: Message) {
        let Some(upstream) = self.upstream.as_mut() else {
            self.client.enqueue(msg);
            return;
        };

        if self.incoming_locked {
            tracing::debug!(
                session_id = %self.session_id,
                queued = self.client.queued() + 1,
                "queueing client message"
            );
            self.client.enqueue(msg);
            return;
        }

        if let Err(msg) = upstream.send(msg) {
            self.client.enqueue(msg);
        }
    }

    fn on_client_closed(&mut self, code: u16, reason: String, now: Instant) {
        if !self.client.on_closed() {
            tracing::debug!(session_id = %self.session_id, "client close after teardown");
            return;
        }
        self.registry.stats().client_closed();

        let grace = self.registry.settings().grace_period;
        self.outgoing_locked = true;
        self.grace_deadline = Some(now + grace);

        tracing::info!(
            session_id = %self.session_id,
            code,
            %reason,
            grace_ms = grace.as_millis() as u64,
            "client disconnected, holding upstream traffic"
        );
        self.journal(
            SessionEvent::ClientDetached,
            serde_json::json!({ "code": code, "reason": reason }),
        );
    }

    pub(crate) fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        tracing::info!(session_id = %self.session_id, "grace period expired, closing upstream");
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.close(None, "");
        }
        self.finish("grace_expired");
    }

    // -----------------------------------------------------------------------
    // Upstream side
    // -----------------------------------------------------------------------

    fn on_upstream_open(&mut self, socket: SocketHandle) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        let generation = socket.generation();
        if upstream.on_open(socket) {
            tracing::info!(session_id = %self.session_id, generation, "upstream reconnected");
            self.journal(SessionEvent::UpstreamReconnected, serde_json::Value::Null);
        } else {
            tracing::debug!(session_id = %self.session_id, generation, "upstream open");
        }
        self.drain_incoming();
    }

    fn on_dial_failed(&mut self, reason: String, now: Instant) {
        tracing::warn!(session_id = %self.session_id, %reason, "upstream dial failed");
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        match upstream.on_dial_failed(now) {
            Some(step) => self.step_retry(step),
            None => self.on_upstream_gone(CLOSE_ABNORMAL, reason),
        }
    }

    fn on_upstream_event(&mut self, event: SocketEvent, now: Instant) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };

        match event {
            SocketEvent::Frame(msg) => match upstream.on_frame(msg) {
                Ok(UpstreamSignal::Relocate(relocation)) => self.on_relocation(relocation),
                Ok(UpstreamSignal::Pause) => {
                    tracing::info!(session_id = %self.session_id, "upstream paused client traffic");
                    self.incoming_locked = true;
                    if upstream.send(Message::text(PROXY_LOCKED)).is_err() {
                        tracing::debug!(
                            session_id = %self.session_id,
                            "pause acknowledgement not delivered upstream"
                        );
                    }
                }
                Ok(UpstreamSignal::Payload(msg)) => self.forward_to_client(msg),
                Err(err) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        %err,
                        "dropping unusable relocation message"
                    );
                }
            },
            SocketEvent::Ping => self.client.ping(),
            SocketEvent::Error(err) => {
                self.registry.stats().socket_error();
                tracing::error!(session_id = %self.session_id, %err, "upstream socket error");
            }
            SocketEvent::Closed { code, reason } => match upstream.on_closed(code, &reason) {
                UpstreamClose::Ignored => {}
                UpstreamClose::Restart => {
                    let step = upstream.schedule_retry(now);
                    self.incoming_locked = true;
                    self.registry.stats().upstream_restarted();
                    tracing::info!(
                        session_id = %self.session_id,
                        code,
                        "upstream restarting, holding client traffic"
                    );
                    self.journal(
                        SessionEvent::UpstreamRestarting,
                        serde_json::json!({ "code": code }),
                    );
                    self.step_retry(step);
                }
                UpstreamClose::Closed { code, reason } => self.on_upstream_gone(code, reason),
            },
        }
    }

    fn forward_to_client(&mut self, msg: Message) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };

        if self.outgoing_locked {
            tracing::debug!(
                session_id = %self.session_id,
                queued = upstream.queued() + 1,
                "queueing upstream message"
            );
            upstream.enqueue(msg);
            return;
        }

        if let Err(msg) = self.client.send(msg) {
            upstream.enqueue(msg);
        }
    }

    fn step_retry(&mut self, step: RetryStep) {
        match step {
            RetryStep::Scheduled { retries_left, .. } => {
                tracing::info!(session_id = %self.session_id, retries_left, "upstream retry scheduled");
            }
            RetryStep::Exhausted { code, reason } => {
                tracing::warn!(session_id = %self.session_id, "upstream retry budget exhausted");
                self.on_upstream_gone(code, reason);
            }
        }
    }

    pub(crate) fn on_retry_due(&mut self) {
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.on_retry_due();
        }
    }

    /// The upstream is gone for good: close the client with the same code and
    /// end the session. There is no grace period on this side.
    fn on_upstream_gone(&mut self, code: u16, reason: String) {
        tracing::info!(
            session_id = %self.session_id,
            code,
            %reason,
            "upstream closed, ending session"
        );
        if self.client.is_attached() {
            self.registry.stats().client_closed();
        }
        self.client.close(Some(code), &reason);
        if let Some(upstream) = self.upstream.as_mut() {
            upstream.close(Some(code), &reason);
        }
        self.finish("upstream_closed");
    }

    /// Re-key the session under the relocated identifier, then release both
    /// taps so nothing buffered during the handshake stays behind.
    fn on_relocation(&mut self, relocation: Relocation) {
        self.registry.stats().relocated();
        tracing::info!(
            session_id = %self.session_id,
            relocated_to = %relocation.session_id,
            "upstream relocated session"
        );
        self.registry.register_alias(self.key, &relocation.session_id);

        let previous = std::mem::replace(&mut self.session_id, relocation.session_id);
        self.journal(
            SessionEvent::SessionRelocated,
            serde_json::json!({ "previous": previous }),
        );

        self.drain_incoming();
        self.drain_outgoing();
    }

    // -----------------------------------------------------------------------
    // Drains
    // -----------------------------------------------------------------------

    /// Flush queued client messages upstream. Skipped while the upstream has
    /// no socket; the lock then stays set.
    fn drain_incoming(&mut self) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        if !upstream.is_open() {
            return;
        }

        let mut pending = self.client.drain().into_iter();
        while let Some(msg) = pending.next() {
            if let Err(msg) = upstream.send(msg) {
                self.client.enqueue(msg);
                pending.for_each(|msg| self.client.enqueue(msg));
                return;
            }
        }
        self.incoming_drain_completed();
    }

    /// Flush queued upstream messages to the client. Skipped while no client
    /// is attached; the lock then stays set.
    fn drain_outgoing(&mut self) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        if !self.client.is_attached() {
            return;
        }

        let mut pending = upstream.drain().into_iter();
        while let Some(msg) = pending.next() {
            if let Err(msg) = self.client.send(msg) {
                upstream.enqueue(msg);
                pending.for_each(|msg| upstream.enqueue(msg));
                return;
            }
        }
        self.outgoing_drain_completed();
    }

    fn incoming_drain_completed(&mut self) {
        if self.incoming_locked {
            self.incoming_locked = false;
            tracing::info!(session_id = %self.session_id, "client queue drained, forwarding resumed");
        }
    }

    fn outgoing_drain_completed(&mut self) {
        if self.outgoing_locked {
            self.outgoing_locked = false;
            tracing::info!(session_id = %self.session_id, "upstream queue drained, forwarding resumed");
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn finish(&mut self, cause: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.grace_deadline = None;

        let released = self.registry.release(self.key);
        self.registry.stats().session_closed();
        tracing::info!(
            session_id = %self.session_id,
            cause,
            released = released.len(),
            "session closed"
        );
        self.journal(
            SessionEvent::SessionClosed,
            serde_json::json!({ "cause": cause, "ids": released }),
        );
    }

    fn journal(&self, event: SessionEvent, details: serde_json::Value) {
        self.registry
            .journal()
            .record(JournalEntry::new(event, self.session_id.clone(), details));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CloseDirective, PROXY_RESTART, SERVICE_RESTART};
    use crate::socket::Outbound;
    use crate::stats::ProxyStats;
    use crate::upstream::RecordingDialer;
    use session_journal::JournalSink;

    const GRACE: Duration = Duration::from_millis(5000);
    const RETRY_DELAY: Duration = Duration::from_millis(100);

    struct Harness {
        core: SessionCore,
        registry: Registry,
        dialer: Arc<RecordingDialer>,
        next_client_generation: u64,
        _inbox: mpsc::UnboundedReceiver<SessionInput>,
    }

    fn harness(retry_limit: u32) -> Harness {
        harness_for(Url::parse("ws://127.0.0.1:9000").unwrap(), retry_limit)
    }

    fn harness_for(upstream_url: Url, retry_limit: u32) -> Harness {
        let dialer = Arc::new(RecordingDialer::default());
        let registry = Registry::new(
            SessionSettings {
                upstream_url,
                grace_period: GRACE,
                retry: RetryPolicy {
                    limit: retry_limit,
                    delay: RETRY_DELAY,
                },
            },
            dialer.clone(),
            JournalSink::disabled(),
            Arc::new(ProxyStats::default()),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(SessionKey::new(), tx.clone());
        registry.insert("A", handle.clone());
        let core = SessionCore::new(handle.key(), "A".to_string(), registry.clone(), tx);

        Harness {
            core,
            registry,
            dialer,
            next_client_generation: 0,
            _inbox: rx,
        }
    }

    impl Harness {
        fn attach_client(&mut self) -> mpsc::UnboundedReceiver<Outbound> {
            self.next_client_generation += 1;
            let (socket, rx) = SocketHandle::detached(self.next_client_generation);
            self.core.handle(
                SessionInput::Attach {
                    socket,
                    meta: ConnectionMeta {
                        path: "/chat".to_string(),
                        ..ConnectionMeta::default()
                    },
                },
                Instant::now(),
            );
            rx
        }

        fn open_upstream(&mut self) -> mpsc::UnboundedReceiver<Outbound> {
            let (_, generation) = self.dialer.last();
            let (socket, rx) = SocketHandle::detached(generation);
            self.core.handle(
                SessionInput::Dialed {
                    generation,
                    outcome: Ok(socket),
                },
                Instant::now(),
            );
            rx
        }

        fn from_client(&mut self, event: SocketEvent, now: Instant) {
            let generation = self.next_client_generation;
            self.core.handle(
                SessionInput::Socket {
                    side: Side::Client,
                    generation,
                    event,
                },
                now,
            );
        }

        fn from_upstream(&mut self, event: SocketEvent, now: Instant) {
            let (_, generation) = self.dialer.last();
            self.core.handle(
                SessionInput::Socket {
                    side: Side::Upstream,
                    generation,
                    event,
                },
                now,
            );
        }

        fn client_says(&mut self, text: &str) {
            self.from_client(SocketEvent::Frame(Message::text(text)), Instant::now());
        }

        fn upstream_says(&mut self, text: &str) {
            self.from_upstream(SocketEvent::Frame(Message::text(text)), Instant::now());
        }

        /// A session with client and upstream both connected.
        fn connected(retry_limit: u32) -> (Self, Rx, Rx) {
            let mut h = harness(retry_limit);
            let client = h.attach_client();
            let upstream = h.open_upstream();
            (h, client, upstream)
        }
    }

    type Rx = mpsc::UnboundedReceiver<Outbound>;

    fn frames(rx: &mut Rx) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn text(s: &str) -> Outbound {
        Outbound::Frame(Message::text(s))
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    #[test]
    fn unjoinable_upstream_target_closes_client_and_ends_session() {
        let mut h = harness_for(Url::parse("data:text/plain,x").unwrap(), 3);
        let mut client = h.attach_client();

        assert_eq!(h.dialer.dials(), 0);
        match frames(&mut client).as_slice() {
            [Outbound::Close(CloseDirective::Handshake(frame))] => {
                assert_eq!(u16::from(frame.code), CLOSE_INTERNAL_ERROR);
                assert_eq!(frame.reason.as_str(), "invalid upstream target");
            }
            other => panic!("expected an internal-error close, got {other:?}"),
        }
        assert!(h.core.finished);
        assert!(h.registry.is_empty());
    }

    #[test]
    fn first_connection_dials_upstream_at_joined_path() {
        let mut h = harness(3);
        let _client = h.attach_client();

        assert_eq!(h.dialer.dials(), 1);
        let (request, _) = h.dialer.last();
        assert_eq!(request.url.as_str(), "ws://127.0.0.1:9000/chat");
        assert!(h.core.incoming_locked);
    }

    #[test]
    fn upstream_messages_reach_client_on_fast_path() {
        let (mut h, mut client, _upstream) = Harness::connected(3);
        h.upstream_says("Hello");

        assert_eq!(frames(&mut client), vec![text("Hello")]);
        assert!(!h.core.incoming_locked);
        assert!(!h.core.outgoing_locked);
    }

    #[test]
    fn client_messages_before_upstream_open_are_delivered_in_order() {
        let mut h = harness(3);
        let _client = h.attach_client();
        h.client_says("m1");
        h.client_says("m2");
        assert_eq!(h.core.client.queued(), 2);

        let mut upstream = h.open_upstream();
        assert_eq!(frames(&mut upstream), vec![text("m1"), text("m2")]);
        assert!(!h.core.incoming_locked);

        h.client_says("m3");
        assert_eq!(frames(&mut upstream), vec![text("m3")]);
    }

    #[test]
    fn upstream_ping_is_relayed_to_client() {
        let (mut h, mut client, _upstream) = Harness::connected(3);
        h.from_upstream(SocketEvent::Ping, Instant::now());
        assert_eq!(frames(&mut client), vec![Outbound::Ping]);
    }

    // -----------------------------------------------------------------------
    // Client grace period
    // -----------------------------------------------------------------------

    #[test]
    fn client_drop_queues_upstream_traffic_until_resume() {
        let (mut h, _client, _upstream) = Harness::connected(3);
        let t0 = Instant::now();
        h.from_client(
            SocketEvent::Closed {
                code: 1001,
                reason: String::new(),
            },
            t0,
        );

        assert!(h.core.outgoing_locked);
        assert_eq!(h.core.grace_deadline(), Some(t0 + GRACE));

        h.upstream_says("Msg1");
        h.upstream_says("Msg2");
        assert_eq!(h.core.upstream.as_ref().unwrap().queued(), 2);

        let mut resumed = h.attach_client();
        assert_eq!(h.core.grace_deadline(), None);
        assert_eq!(frames(&mut resumed), vec![text("Msg1"), text("Msg2")]);
        assert!(!h.core.outgoing_locked);
        assert!(!h.core.is_finished());
    }

    #[test]
    fn grace_expiry_closes_upstream_and_unregisters() {
        let (mut h, _client, mut upstream) = Harness::connected(3);
        h.from_client(
            SocketEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
            Instant::now(),
        );
        h.core.on_grace_expired();

        assert!(h.core.is_finished());
        assert_eq!(
            frames(&mut upstream),
            vec![Outbound::Close(CloseDirective::Plain)]
        );
        assert!(h.registry.lookup("A").is_none());
    }

    #[test]
    fn close_from_replaced_client_socket_is_ignored() {
        let (mut h, _old, _upstream) = Harness::connected(3);
        let _new = h.attach_client();

        h.core.handle(
            SessionInput::Socket {
                side: Side::Client,
                generation: 1,
                event: SocketEvent::Closed {
                    code: 1006,
                    reason: String::new(),
                },
            },
            Instant::now(),
        );

        assert_eq!(h.core.grace_deadline(), None);
        assert!(!h.core.outgoing_locked);
    }

    // -----------------------------------------------------------------------
    // Upstream restart and retry
    // -----------------------------------------------------------------------

    #[test]
    fn service_restart_queues_client_traffic_and_replays_after_redial() {
        let (mut h, _client, _upstream) = Harness::connected(3);
        let now = Instant::now();
        h.from_upstream(
            SocketEvent::Closed {
                code: 1012,
                reason: SERVICE_RESTART.to_string(),
            },
            now,
        );

        assert!(h.core.incoming_locked);
        assert_eq!(h.core.retry_at(), Some(now + RETRY_DELAY));

        h.client_says("c1");
        h.client_says("c2");

        h.core.on_retry_due();
        assert_eq!(h.dialer.dials(), 2);

        let mut upstream = h.open_upstream();
        assert_eq!(frames(&mut upstream), vec![text("c1"), text("c2")]);
        assert!(!h.core.incoming_locked);
        assert_eq!(h.core.upstream.as_ref().unwrap().retries_remaining(), 3);
    }

    #[test]
    fn exhausted_retries_close_client_with_restart_code() {
        let (mut h, mut client, _upstream) = Harness::connected(2);
        let now = Instant::now();
        h.from_upstream(
            SocketEvent::Closed {
                code: 1012,
                reason: SERVICE_RESTART.to_string(),
            },
            now,
        );

        for _ in 0..2 {
            h.core.on_retry_due();
            let (_, generation) = h.dialer.last();
            h.core.handle(
                SessionInput::Dialed {
                    generation,
                    outcome: Err("connection refused".to_string()),
                },
                now,
            );
        }

        assert_eq!(h.dialer.dials(), 3);
        assert!(h.core.is_finished());
        match frames(&mut client).pop() {
            Some(Outbound::Close(CloseDirective::Handshake(frame))) => {
                assert_eq!(u16::from(frame.code), 1012);
                assert_eq!(frame.reason.as_str(), SERVICE_RESTART);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn permanent_upstream_close_ends_session_without_grace() {
        let (mut h, mut client, _upstream) = Harness::connected(3);
        h.from_upstream(
            SocketEvent::Closed {
                code: 1000,
                reason: "done".to_string(),
            },
            Instant::now(),
        );

        assert!(h.core.is_finished());
        assert_eq!(h.core.grace_deadline(), None);
        assert!(h.registry.lookup("A").is_none());
        assert!(matches!(
            frames(&mut client).as_slice(),
            [Outbound::Close(CloseDirective::Handshake(_))]
        ));
    }

    #[test]
    fn failed_first_dial_ends_session() {
        let mut h = harness(3);
        let mut client = h.attach_client();
        h.core.handle(
            SessionInput::Dialed {
                generation: 1,
                outcome: Err("connection refused".to_string()),
            },
            Instant::now(),
        );

        assert!(h.core.is_finished());
        assert_eq!(
            frames(&mut client),
            vec![Outbound::Close(CloseDirective::Terminate)]
        );
    }

    #[test]
    fn client_close_after_teardown_does_not_arm_grace() {
        let (mut h, _client, _upstream) = Harness::connected(3);
        h.core.client.close(Some(1000), "bye");
        h.from_client(
            SocketEvent::Closed {
                code: 1000,
                reason: "bye".to_string(),
            },
            Instant::now(),
        );
        assert_eq!(h.core.grace_deadline(), None);
        assert!(!h.core.outgoing_locked);
    }

    // -----------------------------------------------------------------------
    // Control messages
    // -----------------------------------------------------------------------

    #[test]
    fn upstream_pause_locks_client_side_and_acks() {
        let (mut h, _client, mut upstream) = Harness::connected(3);
        h.upstream_says(PROXY_RESTART);

        assert!(h.core.incoming_locked);
        assert_eq!(frames(&mut upstream), vec![text(PROXY_LOCKED)]);

        h.client_says("held");
        assert!(frames(&mut upstream).is_empty());
        assert_eq!(h.core.client.queued(), 1);
    }

    #[test]
    fn client_pause_locks_upstream_side_and_acks() {
        let (mut h, mut client, _upstream) = Harness::connected(3);
        h.client_says(PROXY_RESTART);

        assert!(h.core.outgoing_locked);
        assert_eq!(frames(&mut client), vec![text(PROXY_LOCKED)]);

        h.upstream_says("held");
        assert!(frames(&mut client).is_empty());
        assert_eq!(h.core.upstream.as_ref().unwrap().queued(), 1);
    }

    #[test]
    fn client_pause_holds_lock_when_ack_cannot_be_sent() {
        let (mut h, client, _upstream) = Harness::connected(3);
        drop(client);
        h.client_says(PROXY_RESTART);

        assert!(h.core.outgoing_locked);
        h.upstream_says("held");
        assert_eq!(h.core.upstream.as_ref().unwrap().queued(), 1);
    }

    #[test]
    fn upstream_pause_holds_lock_when_ack_cannot_be_sent() {
        let (mut h, _client, upstream) = Harness::connected(3);
        drop(upstream);
        h.upstream_says(PROXY_RESTART);

        assert!(h.core.incoming_locked);
        h.client_says("held");
        assert_eq!(h.core.client.queued(), 1);
    }

    #[test]
    fn drain_completion_unlocks_once() {
        let (mut h, _client, _upstream) = Harness::connected(3);
        h.core.incoming_locked = true;
        h.core.incoming_drain_completed();
        assert!(!h.core.incoming_locked);
        h.core.incoming_drain_completed();
        assert!(!h.core.incoming_locked);
    }

    // -----------------------------------------------------------------------
    // Relocation
    // -----------------------------------------------------------------------

    #[test]
    fn relocation_rekeys_and_releases_taps() {
        let (mut h, mut client, mut upstream) = Harness::connected(3);
        h.upstream_says(PROXY_RESTART);
        h.client_says("buffered");
        frames(&mut upstream);

        h.upstream_says(r#"RECONNECT {"sessionId":"X"}"#);

        let key = h.core.key;
        assert_eq!(h.registry.lookup("X").map(|s| s.key()), Some(key));
        assert_eq!(h.registry.lookup("A").map(|s| s.key()), Some(key));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.core.session_id, "X");

        assert_eq!(frames(&mut upstream), vec![text("buffered")]);
        assert!(!h.core.incoming_locked);
        assert!(frames(&mut client).is_empty());
    }

    #[test]
    fn relocated_session_releases_every_alias() {
        let (mut h, _client, _upstream) = Harness::connected(3);
        h.upstream_says(r#"RECONNECT {"sessionId":"X"}"#);
        h.from_upstream(
            SocketEvent::Closed {
                code: 1000,
                reason: String::new(),
            },
            Instant::now(),
        );

        assert!(h.registry.lookup("A").is_none());
        assert!(h.registry.lookup("X").is_none());
        assert!(h.registry.is_empty());
    }

    #[test]
    fn malformed_relocation_is_dropped() {
        let (mut h, mut client, _upstream) = Harness::connected(3);
        h.upstream_says("RECONNECT {broken");

        assert!(frames(&mut client).is_empty());
        assert_eq!(h.core.session_id, "A");
        assert!(h.registry.lookup("A").is_some());
        assert_eq!(h.core.upstream.as_ref().unwrap().relocation(), None);
    }
}
