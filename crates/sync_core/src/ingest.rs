use anyhow::{Context, Result};
use futures::StreamExt;
use shared::{
    domain::{Conversation, StoredMessage},
    event::{RelayEvent, UnsignedEvent},
};
use tracing::{debug, info};

use crate::{
    context::SyncContext,
    notifications::SyncNotification,
    protocol::GroupUpdate,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub messages: usize,
    pub proposals: usize,
    pub commits: usize,
    pub skipped: usize,
}

/// Hands one batch to the group protocol and persists the application messages it yields.
pub async fn ingest_batch(
    ctx: &SyncContext,
    conversation: &Conversation,
    events: Vec<RelayEvent>,
) -> Result<IngestReport> {
    let count = events.len();
    let mut report = IngestReport::default();
    let mut updates = ctx.protocol.ingest(conversation, events);

    while let Some(update) = updates.next().await {
        match update.with_context(|| format!("ingestion failed for {}", conversation.id))? {
            GroupUpdate::ApplicationMessage(rumor) => {
                let message = stored_message(conversation, &rumor);
                if ctx.store.put_message(&message).await? {
                    ctx.store.record_last_message(&message).await?;
                    ctx.notifier.emit(SyncNotification::MessageReceived {
                        conversation_id: conversation.id.clone(),
                        message_id: message.id.clone(),
                    });
                }
                report.messages += 1;
            }
            GroupUpdate::Proposal => report.proposals += 1,
            GroupUpdate::Commit => report.commits += 1,
            GroupUpdate::Skipped { event_id, reason } => {
                debug!(conversation_id = %conversation.id, %event_id, %reason, "skipped event");
                report.skipped += 1;
            }
        }
    }

    info!(
        conversation_id = %conversation.id,
        events = count,
        messages = report.messages,
        commits = report.commits,
        skipped = report.skipped,
        "ingested batch"
    );
    Ok(report)
}

pub fn stored_message(conversation: &Conversation, rumor: &UnsignedEvent) -> StoredMessage {
    let id = match &rumor.id {
        Some(id) => id.0.clone(),
        None => format!("{}-{}-{}", conversation.id, rumor.created_at, rumor.pubkey),
    };
    StoredMessage {
        id,
        conversation_id: conversation.id.clone(),
        sender: rumor.pubkey.clone(),
        content: rumor.content.clone(),
        created_at: rumor.created_at,
        kind: rumor.kind.as_u16(),
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
