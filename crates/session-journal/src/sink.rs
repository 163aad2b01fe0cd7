use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::entry::JournalEntry;
use crate::writer::{JournalError, JournalWriter};

/// Entries buffered between producers and the writer task.
const CHANNEL_CAPACITY: usize = 4096;

/// Idle time after which pending writes are flushed.
const FLUSH_AFTER_IDLE: Duration = Duration::from_secs(1);

/// Cloneable handle for submitting entries to the journal writer task.
///
/// Recording never blocks: session state machines call [`record`](Self::record)
/// from synchronous event handlers. A sink built with
/// [`disabled`](Self::disabled) discards everything.
#[derive(Clone, Debug)]
pub struct JournalSink {
    tx: Option<mpsc::Sender<JournalEntry>>,
}

impl JournalSink {
    /// Open the journal file and spawn the background writer.
    ///
    /// The writer flushes after a second without new entries, once more
    /// when the last sink clone is dropped, and on [`JournalHandle::shutdown`].
    pub async fn start(path: impl AsRef<Path>) -> Result<(Self, JournalHandle), JournalError> {
        let writer = JournalWriter::open(path).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(drain_into(writer, rx, stop_rx));
        Ok((
            Self { tx: Some(tx) },
            JournalHandle {
                stop: stop_tx,
                task,
            },
        ))
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an entry for writing. Drops it with a warning if the writer is
    /// saturated or gone.
    pub fn record(&self, entry: JournalEntry) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(
                    event = ?entry.event,
                    session_id = %entry.session_id,
                    "session journal backlog full, entry dropped"
                );
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::warn!(
                    event = ?entry.event,
                    session_id = %entry.session_id,
                    "session journal writer stopped, entry dropped"
                );
            }
        }
    }
}

/// Owner's handle on the background writer.
#[derive(Debug)]
pub struct JournalHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl JournalHandle {
    /// Write out everything already recorded, flush, and stop the writer even
    /// while sink clones are still alive. Later records are dropped with a
    /// warning.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            tracing::error!(%err, "session journal writer task failed");
        }
    }
}

async fn drain_into(
    mut writer: JournalWriter,
    mut rx: mpsc::Receiver<JournalEntry>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut dirty = false;
    let mut stoppable = true;

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(entry) => match writer.append(&entry).await {
                    Ok(()) => dirty = true,
                    Err(err) => tracing::error!(%err, "failed to append journal entry"),
                },
                None => break,
            },
            requested = &mut stop, if stoppable => match requested {
                Ok(()) => {
                    rx.close();
                    while let Some(entry) = rx.recv().await {
                        match writer.append(&entry).await {
                            Ok(()) => dirty = true,
                            Err(err) => tracing::error!(%err, "failed to append journal entry"),
                        }
                    }
                    break;
                }
                // Handle dropped without asking; run until the sinks go away.
                Err(_) => stoppable = false,
            },
            _ = tokio::time::sleep(FLUSH_AFTER_IDLE), if dirty => {
                match writer.flush().await {
                    Ok(()) => dirty = false,
                    Err(err) => tracing::error!(%err, "journal flush failed"),
                }
            }
        }
    }

    if dirty {
        if let Err(err) = writer.flush().await {
            tracing::error!(%err, "final journal flush failed");
        }
    }
    tracing::debug!(entries = writer.written(), "session journal writer stopped");
}
