use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::control::{classify_upstream, UpstreamSignal, CLOSE_ABNORMAL, SERVICE_RESTART};
use crate::error::{ProxyError, RelocationError};
use crate::meta::RESUMED_DIAL_HEADER;
use crate::queue::MessageQueue;
use crate::session::SessionInput;
use crate::socket::{spawn_pumps, Side, SocketHandle};

/// Fixed-delay, fixed-budget retry for upstream restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Dial attempts allowed per restart before the session is given up.
    pub limit: u32,
    /// Pause before each attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 10,
            delay: Duration::from_millis(10),
        }
    }
}

/// Everything needed to open one upstream connection.
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl DialRequest {
    /// Whether this dial resumes a relocated session.
    pub fn is_resumed(&self) -> bool {
        self.headers.contains_key(RESUMED_DIAL_HEADER)
    }

    pub fn into_client_request(
        self,
    ) -> Result<http::Request<()>, tokio_tungstenite::tungstenite::Error> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in self.headers.iter() {
            request.headers_mut().append(name.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Where a dialer reports the outcome of one dial.
pub struct DialReply {
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl DialReply {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand the freshly opened socket to the session.
    pub fn connected<S>(self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let generation = self.generation;
        // If the session already ended, the socket is dropped right away.
        spawn_pumps(ws, Side::Upstream, generation, &self.inbox, |socket| {
            SessionInput::Dialed {
                generation,
                outcome: Ok(socket),
            }
        });
    }

    pub fn failed(self, reason: impl fmt::Display) {
        let _ = self.inbox.send(SessionInput::Dialed {
            generation: self.generation,
            outcome: Err(reason.to_string()),
        });
    }
}

impl fmt::Debug for DialReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialReply")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Opens upstream connections.
///
/// `dial` must not block: implementations start the connection in the
/// background and answer through the [`DialReply`].
pub trait Dialer: Send + Sync {
    fn dial(&self, request: DialRequest, reply: DialReply);
}

/// Dials plain `ws://` upstreams with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteDialer;

impl Dialer for TungsteniteDialer {
    fn dial(&self, request: DialRequest, reply: DialReply) {
        tokio::spawn(async move {
            let url = request.url.clone();
            let outcome = async {
                let request = request.into_client_request()?;
                let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
                Ok::<_, tokio_tungstenite::tungstenite::Error>(ws)
            }
            .await;

            match outcome {
                Ok(ws) => reply.connected(ws),
                Err(source) => {
                    let err = ProxyError::Dial { url, source };
                    tracing::debug!(%err, "upstream dial failed");
                    reply.failed(err);
                }
            }
        });
    }
}

/// What an upstream close means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamClose {
    /// A retry cycle is already running; the close is expected.
    Ignored,
    /// Retryable close: the session should hold client traffic.
    Restart,
    /// Terminal.
    Closed { code: u16, reason: String },
}

/// Next step of the backoff loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStep {
    Scheduled { at: Instant, retries_left: u32 },
    Exhausted { code: u16, reason: String },
}

/// The upstream side of a session.
///
/// Redials the same target on every retry; the socket handle is replaced on
/// each successful dial while the edge itself stays put.
pub struct UpstreamEdge {
    target: Url,
    headers: HeaderMap,
    socket: Option<SocketHandle>,
    queue: MessageQueue<Message>,
    policy: RetryPolicy,
    retrying: bool,
    retries_remaining: u32,
    retry_at: Option<Instant>,
    relocation: Option<String>,
    generation: u64,
    pending_dial: Option<u64>,
    last_close: (u16, String),
    dialer: Arc<dyn Dialer>,
    inbox: mpsc::UnboundedSender<SessionInput>,
}

impl UpstreamEdge {
    /// `headers` must already be sanitized.
    pub(crate) fn new(
        target: Url,
        headers: HeaderMap,
        policy: RetryPolicy,
        dialer: Arc<dyn Dialer>,
        inbox: mpsc::UnboundedSender<SessionInput>,
    ) -> Self {
        Self {
            target,
            headers,
            socket: None,
            queue: MessageQueue::new(),
            policy,
            retrying: false,
            retries_remaining: policy.limit,
            retry_at: None,
            relocation: None,
            generation: 0,
            pending_dial: None,
            last_close: (CLOSE_ABNORMAL, String::new()),
            dialer,
            inbox,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_retrying(&self) -> bool {
        self.retrying
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn relocation(&self) -> Option<&str> {
        self.relocation.as_deref()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.generation() == generation)
    }

    pub fn is_pending_dial(&self, generation: u64) -> bool {
        self.pending_dial == Some(generation)
    }

    /// Open a fresh connection to the target. A pending relocation marks the
    /// dial as resumed.
    pub fn dial(&mut self) {
        self.generation += 1;
        self.pending_dial = Some(self.generation);

        let mut headers = self.headers.clone();
        if self.relocation.is_some() {
            headers.insert(
                HeaderName::from_static(RESUMED_DIAL_HEADER),
                HeaderValue::from_static("true"),
            );
        }

        tracing::info!(
            target = %self.target,
            generation = self.generation,
            resumed = self.relocation.is_some(),
            "dialing upstream"
        );

        self.dialer.dial(
            DialRequest {
                url: self.target.clone(),
                headers,
            },
            DialReply {
                generation: self.generation,
                inbox: self.inbox.clone(),
            },
        );
    }

    /// A dial succeeded. Replays the pending relocation, then resets the
    /// retry state. Returns whether this ended a retry cycle.
    pub fn on_open(&mut self, socket: SocketHandle) -> bool {
        self.pending_dial = None;
        if let Some(relocation) = &self.relocation {
            tracing::info!(generation = socket.generation(), "replaying relocation");
            let _ = socket.send(Message::text(relocation.as_str()));
        }
        self.socket = Some(socket);

        let recovered = self.retrying;
        self.retrying = false;
        self.retries_remaining = self.policy.limit;
        self.retry_at = None;
        recovered
    }

    /// A dial failed before the handshake completed.
    pub fn on_dial_failed(&mut self, now: Instant) -> Option<RetryStep> {
        self.pending_dial = None;
        if self.retrying {
            Some(self.schedule_retry(now))
        } else {
            None
        }
    }

    pub fn on_closed(&mut self, code: u16, reason: &str) -> UpstreamClose {
        self.socket = None;
        if self.retrying {
            return UpstreamClose::Ignored;
        }
        if reason == SERVICE_RESTART {
            self.retrying = true;
            self.last_close = (code, reason.to_string());
            return UpstreamClose::Restart;
        }
        UpstreamClose::Closed {
            code,
            reason: reason.to_string(),
        }
    }

    /// One step of the backoff loop: spend an attempt and arm the delay, or
    /// give up when the budget is gone.
    pub fn schedule_retry(&mut self, now: Instant) -> RetryStep {
        if self.retries_remaining == 0 {
            self.retrying = false;
            self.retry_at = None;
            let (code, reason) = self.last_close.clone();
            return RetryStep::Exhausted { code, reason };
        }

        self.retries_remaining -= 1;
        let at = now + self.policy.delay;
        self.retry_at = Some(at);
        RetryStep::Scheduled {
            at,
            retries_left: self.retries_remaining,
        }
    }

    /// The retry delay elapsed.
    pub fn on_retry_due(&mut self) {
        self.retry_at = None;
        if self.retrying {
            self.dial();
        }
    }

    /// Sort an upstream frame into its control class. A relocation is
    /// remembered for replay on the next successful dial.
    pub fn on_frame(&mut self, msg: Message) -> Result<UpstreamSignal, RelocationError> {
        let signal = classify_upstream(msg)?;
        if let UpstreamSignal::Relocate(relocation) = &signal {
            self.relocation = Some(relocation.raw.clone());
        }
        Ok(signal)
    }

    pub fn send(&self, msg: Message) -> Result<(), Message> {
        match &self.socket {
            Some(socket) => socket.send(msg),
            None => Err(msg),
        }
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.queue.enqueue(msg);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain().collect()
    }

    /// Shut the upstream down. 1006 terminates, 1005 or no code closes
    /// without status, anything else is sent as a close frame. Also stops a
    /// running retry cycle.
    pub fn close(&mut self, code: Option<u16>, reason: &str) {
        self.retrying = false;
        self.retry_at = None;
        self.pending_dial = None;
        if let Some(socket) = self.socket.take() {
            socket.close(code, reason);
        }
    }
}

impl fmt::Debug for UpstreamEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamEdge")
            .field("target", &self.target.as_str())
            .field("open", &self.socket.is_some())
            .field("queued", &self.queue.len())
            .field("retrying", &self.retrying)
            .field("retries_remaining", &self.retries_remaining)
            .field("relocation", &self.relocation)
            .finish_non_exhaustive()
    }
}

/// Dialer double that records requests and never connects.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDialer {
    calls: std::sync::Mutex<Vec<(DialRequest, u64)>>,
}

#[cfg(test)]
impl RecordingDialer {
    pub(crate) fn dials(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> (DialRequest, u64) {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

#[cfg(test)]
impl Dialer for RecordingDialer {
    fn dial(&self, request: DialRequest, reply: DialReply) {
        self.calls
            .lock()
            .unwrap()
            .push((request, reply.generation()));
    }
}
