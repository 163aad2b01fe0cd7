use serde::{Deserialize, Serialize};

/// One line of the session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: SessionEvent,
    /// Logical session identifier at the time of the event. After a
    /// relocation this is the new identifier.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl JournalEntry {
    /// Stamp a new entry with a fresh UUID v4 and the current UTC time.
    pub fn new(
        event: SessionEvent,
        session_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event,
            session_id: session_id.into(),
            details,
        }
    }
}

/// Lifecycle transitions recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    SessionOpened,
    ClientDetached,
    ClientResumed,
    ReconnectRejected,
    UpstreamRestarting,
    UpstreamReconnected,
    SessionRelocated,
    SessionClosed,
}
