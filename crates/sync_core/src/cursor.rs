use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ConversationId, Timestamp},
    event::RelayEvent,
    store::SyncStore,
};
use tracing::debug;

/// Per-conversation watermark of the newest successfully ingested event.
#[derive(Clone)]
pub struct SyncCursors {
    store: Arc<dyn SyncStore>,
}

impl SyncCursors {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &ConversationId) -> Result<Option<Timestamp>> {
        self.store.get_cursor(id).await
    }

    pub async fn set(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        self.store.set_cursor(id, at).await
    }

    /// Moves the cursor to `at` unless it already sits at or beyond it.
    pub async fn advance(&self, id: &ConversationId, at: Timestamp) -> Result<Timestamp> {
        if let Some(current) = self.store.get_cursor(id).await? {
            if current >= at {
                return Ok(current);
            }
        }
        self.store.set_cursor(id, at).await?;
        debug!(conversation_id = %id, cursor = %at, "advanced sync cursor");
        Ok(at)
    }

    pub async fn delete(&self, id: &ConversationId) -> Result<()> {
        self.store.delete_cursor(id).await
    }
}

/// The watermark a successfully ingested batch moves the cursor to.
pub fn batch_high_water(batch: &[RelayEvent]) -> Option<Timestamp> {
    batch.iter().map(|event| event.created_at).max()
}

#[cfg(test)]
#[path = "tests/cursor_tests.rs"]
mod tests;
