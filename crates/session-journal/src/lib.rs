//! Append-only JSON-lines journal of session lifecycle events.
//!
//! The proxy records every transition that matters to an operator (a session
//! opening, a client dropping and resuming, the upstream restarting or
//! relocating the session) as one newline-terminated JSON object. The result
//! is a [JSON Lines](https://jsonlines.org/) stream that can be tailed or
//! replayed to reconstruct what happened to a given session id.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use session_journal::{JournalEntry, JournalSink, SessionEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = JournalSink::start("/var/log/tether/sessions.jsonl").await?;
//!
//! sink.record(JournalEntry::new(
//!     SessionEvent::SessionOpened,
//!     "A",
//!     serde_json::json!({"path": "/"}),
//! ));
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{JournalEntry, SessionEvent};
pub use sink::{JournalHandle, JournalSink};
pub use writer::{JournalError, JournalWriter};
