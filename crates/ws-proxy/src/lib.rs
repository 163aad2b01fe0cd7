//! Reconnecting WebSocket reverse proxy.
//!
//! This crate implements a transparent WebSocket proxy that keeps a logical
//! session alive while the physical connections on either side come and go.
//! Payload frames are never interpreted; the proxy only decides, per
//! direction, whether a frame is forwarded right away or queued until the
//! other side is back.
//!
//! # Architecture
//!
//! ```text
//!                 +----------------- Session -----------------+
//! Client <--WS--> | ClientEdge  <--[locks + queues]-->  UpstreamEdge | <--WS--> Upstream
//!                 +-------------------------------------------+
//!                                      |
//!                                  [Registry]
//!                          identifier -> session aliases
//! ```
//!
//! The [`Registry`] routes every accepted socket: a request carrying
//! `x-reconnect-id` is reattached to its live session, anything else starts a
//! new session keyed by `x-connection-id`. Each session runs as one Tokio
//! task that owns both edges, so the two lock flags and both queues are only
//! ever touched from one place.
//!
//! The upstream side understands a small in-band vocabulary: a close with
//! reason `Service Restart` starts a fixed-delay retry loop, `PROXY_RESTART`
//! pauses client traffic, and `RECONNECT {json}` relocates the session to a
//! new identifier.

pub mod client;
pub mod control;
pub mod error;
pub mod listener;
pub mod meta;
pub(crate) mod queue;
pub mod registry;
pub mod session;
pub mod socket;
pub mod stats;
pub mod upstream;

// Re-export the primary public types at the crate root for convenience.
pub use error::{ProxyError, RelocationError};
pub use listener::{Proxy, ProxyConfig};
pub use registry::{Admission, Registry};
pub use session::{SessionHandle, SessionKey, SessionSettings};
pub use stats::{ProxyStats, StatsSnapshot};
pub use upstream::{DialReply, DialRequest, Dialer, RetryPolicy, TungsteniteDialer};
