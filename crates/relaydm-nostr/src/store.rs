//! Persistence backends for the message queue
//!
//! A store holds the whole queue as one snapshot. Saving replaces the
//! snapshot atomically: either the new state is fully written or the previous
//! one remains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use relaydm_core::{Event, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Format version written into file snapshots
const STORE_VERSION: u32 = 1;

// ----------------------------------------------------------------------------
// Stored Message
// ----------------------------------------------------------------------------

/// A queue entry as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    /// Signed event for outgoing messages, kept for replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    /// Enqueue order, used for FIFO replay
    pub sequence: u64,
    /// Number of publish attempts
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StoredMessage {
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Persistence for queue snapshots.
///
/// Every queue transition saves the whole queue, so replaying `n` queued
/// messages writes `n` snapshots of up to `n` entries each. That quadratic
/// cost is accepted for a single-document store holding one user's messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn load(&self) -> Result<Vec<StoredMessage>>;
    async fn save(&self, messages: &[StoredMessage]) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Memory Store
// ----------------------------------------------------------------------------

/// In-memory store; writes can be made to fail for testing
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
    fail_writes: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current persisted snapshot
    pub async fn snapshot(&self) -> Vec<StoredMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn load(&self) -> Result<Vec<StoredMessage>> {
        Ok(self.messages.lock().await.clone())
    }

    async fn save(&self, messages: &[StoredMessage]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::persistence("memory store writes disabled"));
        }
        *self.messages.lock().await = messages.to_vec();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// File Store
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    messages: Vec<StoredMessage>,
}

/// Single JSON document on disk, replaced through a temp file
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    path: PathBuf,
}

impl FileMessageStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn load(&self) -> Result<Vec<StoredMessage>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No message store at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let document: StoreDocument = serde_json::from_str(&contents).map_err(|e| {
            EngineError::persistence(format!("corrupt store {}: {}", self.path.display(), e))
        })?;
        if document.version != STORE_VERSION {
            return Err(EngineError::persistence(format!(
                "unsupported store version {}",
                document.version
            )));
        }
        Ok(document.messages)
    }

    async fn save(&self, messages: &[StoredMessage]) -> Result<()> {
        let document = StoreDocument {
            version: STORE_VERSION,
            messages: messages.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| EngineError::persistence(e.to_string()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| EngineError::persistence(format!("store writer failed: {e}")))?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| EngineError::persistence(e.to_string()))?;
    Ok(())
}
