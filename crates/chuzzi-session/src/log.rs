//! In-memory conversation log with best-effort persistence.
//!
//! The first persistence failure is returned to the caller; after that the
//! log drops its store and carries on memory-only.

use std::sync::Arc;

use tracing::{debug, warn};

use chuzzi_core::conversation_store::ConversationStore;
use chuzzi_core::error::{ChuzziError, Result};
use chuzzi_core::types::ChatMessage;

pub struct ConversationLog {
    entries: Vec<ChatMessage>,
    store: Option<Arc<dyn ConversationStore>>,
}

impl ConversationLog {
    pub fn new(store: Option<Arc<dyn ConversationStore>>) -> Self {
        Self {
            entries: Vec::new(),
            store,
        }
    }

    /// Log that is never persisted.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Replace the in-memory entries with the stored log.
    pub async fn load(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let result = store.load_log().await;
        match result {
            Ok(entries) => {
                debug!(entries = entries.len(), "Conversation log restored");
                self.entries = entries;
                Ok(())
            }
            Err(e) => Err(self.degrade(e)),
        }
    }

    /// Append finished messages, in order, and persist.
    pub async fn append(&mut self, messages: Vec<ChatMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.entries.extend(messages);
        self.persist().await
    }

    /// Drop every entry, in memory and in the store.
    pub async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        let Some(store) = &self.store else {
            return Ok(());
        };
        let result = store.clear().await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.degrade(e)),
        }
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether entries still reach the store.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    async fn persist(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let result = store.save_log(&self.entries).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.degrade(e)),
        }
    }

    fn degrade(&mut self, err: ChuzziError) -> ChuzziError {
        warn!(error = %err, "Conversation log persistence failed, continuing in memory");
        self.store = None;
        ChuzziError::Persistence(format!("history will not be saved: {err}"))
    }
}
