use tokio_tungstenite::tungstenite::Message;

use crate::control::{classify_client, ClientSignal};
use crate::queue::MessageQueue;
use crate::socket::SocketHandle;

/// The downstream side of a session.
///
/// Owns whichever physical client socket is currently attached plus the
/// queue of client messages held while the upstream cannot take them. The
/// socket is replaced in place when a client resumes.
#[derive(Debug, Default)]
pub struct ClientEdge {
    socket: Option<SocketHandle>,
    queue: MessageQueue<Message>,
    torn_down: bool,
}

impl ClientEdge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new physical socket. A socket that was still attached is
    /// dropped, which terminates it.
    pub fn set_socket(&mut self, socket: SocketHandle) {
        if let Some(previous) = self.socket.replace(socket) {
            tracing::debug!(
                generation = previous.generation(),
                "replacing client socket that was still attached"
            );
        }
    }

    pub fn is_attached(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Whether an event with this generation comes from the current socket.
    pub fn is_current(&self, generation: u64) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.generation() == generation)
    }

    /// Write to the attached socket. No lock check happens here; the session
    /// decides whether a message may be sent. The message comes back if
    /// there is no live socket to take it.
    pub fn send(&self, msg: Message) -> Result<(), Message> {
        match &self.socket {
            Some(socket) => socket.send(msg),
            None => Err(msg),
        }
    }

    pub fn ping(&self) {
        if let Some(socket) = &self.socket {
            socket.ping();
        }
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.queue.enqueue(msg);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain().collect()
    }

    /// Sort an incoming client frame into pause request or payload.
    pub fn classify(&self, msg: Message) -> ClientSignal {
        classify_client(msg)
    }

    /// The current socket reported it closed. Returns `false` when the close
    /// was caused by the proxy itself and must not be treated as a client
    /// disconnect.
    pub fn on_closed(&mut self) -> bool {
        self.socket = None;
        !self.torn_down
    }

    /// Proxy-initiated close. Suppresses the client-closed signal for the
    /// close event that follows.
    pub fn close(&mut self, code: Option<u16>, reason: &str) {
        self.torn_down = true;
        if let Some(socket) = &self.socket {
            socket.close(code, reason);
        }
    }
}
