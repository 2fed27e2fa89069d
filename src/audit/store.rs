//! Append-only audit stores.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use super::{AuditError, AuditEvent};

/// Durable, append-only event sink.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a batch in order. Either all events are written or the call
    /// fails and may be retried with the same batch.
    async fn append(&self, events: &[AuditEvent]) -> Result<(), AuditError>;

    /// Hash of the last stored event, if any.
    async fn last_hash(&self) -> Result<Option<String>, AuditError>;

    /// Every stored event, oldest first.
    async fn load(&self) -> Result<Vec<AuditEvent>, AuditError>;
}

/// One JSON event per line.
#[derive(Debug)]
pub struct JsonlAuditStore {
    path: PathBuf,
    // Serialises appends from concurrent callers.
    write_lock: AsyncMutex<()>,
}

impl JsonlAuditStore {
    /// Open (or create) the log at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] when the directory or file cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            write_lock: AsyncMutex::new(()),
        })
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every event in the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file cannot be read and
    /// [`AuditError::Encoding`] naming the first malformed line.
    pub async fn read_all(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
        let contents = tokio::fs::read_to_string(path).await?;
        parse_lines(&contents)
    }
}

fn parse_lines(contents: &str) -> Result<Vec<AuditEvent>, AuditError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| AuditError::Encoding {
                line: i.saturating_add(1),
                source,
            })
        })
        .collect()
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn append(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)
                .map_err(|source| AuditError::Encoding { line: 0, source })?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn last_hash(&self) -> Result<Option<String>, AuditError> {
        let events = self.load().await?;
        Ok(events.last().map(|e| e.hash.clone()))
    }

    async fn load(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Self::read_all(&self.path).await
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
    failures: AtomicUsize,
}

impl MemoryAuditStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the next `n` appends fail.
    pub fn fail_next_appends(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, events: &[AuditEvent]) -> Result<(), AuditError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuditError::Unavailable("injected failure".to_owned()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    async fn last_hash(&self) -> Result<Option<String>, AuditError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|e| e.hash.clone()))
    }

    async fn load(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.events())
    }
}
