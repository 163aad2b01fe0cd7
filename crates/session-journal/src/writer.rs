use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::entry::JournalEntry;

/// Errors raised by journal file I/O.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to create journal directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open journal file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize journal entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to append to journal: {0}")]
    Write(std::io::Error),

    #[error("failed to flush journal: {0}")]
    Flush(std::io::Error),
}

/// Appends [`JournalEntry`] values to a file, one JSON object per line.
pub struct JournalWriter {
    file: tokio::fs::File,
    written: u64,
}

impl JournalWriter {
    /// Open `path` for appending, creating it and any missing parent
    /// directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| JournalError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self { file, written: 0 })
    }

    pub async fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(JournalError::Write)?;
        self.written += 1;

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), JournalError> {
        self.file.flush().await.map_err(JournalError::Flush)
    }

    /// Number of entries appended through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }
}
