//! Reader/writer pumps around one physical WebSocket.
//!
//! Each socket is split in two tasks. The reader turns incoming frames into
//! [`SocketEvent`]s and posts them to the owning session's inbox, tagged with
//! the socket's generation so events from a replaced socket can be told
//! apart. The writer drains an [`Outbound`] command channel. The session only
//! ever holds a [`SocketHandle`], so swapping the physical socket never
//! changes the identity of the edge that owns it.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::control::{CloseDirective, CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use crate::session::SessionInput;

/// Which edge of a session a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

/// Something the reader observed on a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A text or binary payload frame.
    Frame(Message),
    Ping,
    Error(String),
    /// The socket is gone. Emitted exactly once per socket unless the proxy
    /// terminated it first.
    Closed { code: u16, reason: String },
}

/// Commands for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Message),
    Ping,
    Close(CloseDirective),
}

/// Stable handle to one physical socket's pumps.
///
/// Dropping the handle stops the reader and lets the writer finish whatever
/// it was already asked to send.
#[derive(Debug)]
pub struct SocketHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    reader: Option<AbortHandle>,
}

impl SocketHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a payload frame for the writer. Hands the message back once the
    /// writer has stopped.
    pub fn send(&self, msg: Message) -> Result<(), Message> {
        match self.tx.send(Outbound::Frame(msg)) {
            Err(mpsc::error::SendError(Outbound::Frame(msg))) => Err(msg),
            _ => Ok(()),
        }
    }

    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        let directive = CloseDirective::from_parts(code, reason);
        if directive == CloseDirective::Terminate {
            self.terminate();
            return;
        }
        let _ = self.tx.send(Outbound::Close(directive));
    }

    /// Drop the connection without a close handshake.
    pub fn terminate(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        let _ = self.tx.send(Outbound::Close(CloseDirective::Terminate));
    }

    /// A handle with no pumps behind it; whatever the session writes shows
    /// up on the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(generation: u64) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                generation,
                tx,
                reader: None,
            },
            rx,
        )
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

/// Split `ws` into reader and writer tasks bound to a session inbox.
///
/// The handle is posted to the inbox through `announce` before the reader
/// reads anything, so the session always knows a generation before it sees
/// that generation's events. Returns `false` if the session is gone, in
/// which case the socket is dropped.
pub(crate) fn spawn_pumps<S>(
    ws: WebSocketStream<S>,
    side: Side,
    generation: u64,
    inbox: &mpsc::UnboundedSender<SessionInput>,
    announce: impl FnOnce(SocketHandle) -> SessionInput,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (start_tx, start_rx) = oneshot::channel::<()>();
    let events = inbox.clone();

    let reader = tokio::spawn(async move {
        if start_rx.await.is_err() {
            return;
        }

        let post = |event: SocketEvent| {
            events
                .send(SessionInput::Socket {
                    side,
                    generation,
                    event,
                })
                .is_ok()
        };

        let mut close_frame: Option<(u16, String)> = None;

        while let Some(item) = stream.next().await {
            let delivered = match item {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => post(SocketEvent::Frame(msg)),
                Ok(Message::Ping(_)) => post(SocketEvent::Ping),
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => true,
                Ok(Message::Close(frame)) => {
                    close_frame = Some(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    });
                    true
                }
                Err(err) => {
                    tracing::debug!(?side, generation, %err, "socket read failed");
                    post(SocketEvent::Error(err.to_string()));
                    break;
                }
            };
            if !delivered {
                // The session is gone; nobody is listening any more.
                return;
            }
        }

        let (code, reason) = close_frame.unwrap_or((CLOSE_ABNORMAL, String::new()));
        post(SocketEvent::Closed { code, reason });
    });

    let reader_abort = reader.abort_handle();

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let result = match cmd {
                Outbound::Frame(msg) => sink.send(msg).await,
                Outbound::Ping => sink.send(Message::Ping(Default::default())).await,
                Outbound::Close(CloseDirective::Terminate) => break,
                Outbound::Close(CloseDirective::Plain) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Outbound::Close(CloseDirective::Handshake(frame)) => {
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if let Err(err) = result {
                tracing::debug!(?side, generation, %err, "socket write failed");
                break;
            }
        }
    });

    let handle = SocketHandle {
        generation,
        tx,
        reader: Some(reader_abort),
    };
    if inbox.send(announce(handle)).is_err() {
        return false;
    }
    let _ = start_tx.send(());
    true
}
