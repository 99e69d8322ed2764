//! Conversation log persistence as a JSON array of chat messages on disk.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ChuzziError, Result};
use crate::types::ChatMessage;

/// Durable storage for the finished conversation log.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load the stored log, oldest first. A missing log is empty.
    async fn load_log(&self) -> Result<Vec<ChatMessage>>;

    /// Replace the stored log with `entries`.
    async fn save_log(&self, entries: &[ChatMessage]) -> Result<()>;

    /// Remove the stored log.
    async fn clear(&self) -> Result<()>;
}

/// File-based conversation store.
///
/// The whole log is rewritten on every save, through a temp file and a rename.
pub struct JsonConversationStore {
    path: PathBuf,
}

impl JsonConversationStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default store location: `~/.chuzzi/history.json`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("history.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn load_log(&self) -> Result<Vec<ChatMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<ChatMessage> = serde_json::from_str(&data)
            .map_err(|e| ChuzziError::Persistence(format!("corrupt history file: {e}")))?;
        debug!(path = %self.path.display(), entries = entries.len(), "Loaded conversation log");
        Ok(entries)
    }

    async fn save_log(&self, entries: &[ChatMessage]) -> Result<()> {
        self.ensure_parent().await?;
        let data = serde_json::to_string_pretty(entries)?;
        // Atomic write: write to temp then rename
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = entries.len(), "Saved conversation log");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        debug!(path = %self.path.display(), "Cleared conversation log");
        Ok(())
    }
}
