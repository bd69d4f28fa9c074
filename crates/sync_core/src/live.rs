use std::{mem, sync::Arc, time::Duration};

use shared::{
    domain::{Conversation, ConversationId, EventId},
    event::RelayEvent,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    backfill::{group_filter, run_backfill},
    context::SyncContext,
    cursor::{batch_high_water, SyncCursors},
    dedup::DedupTracker,
    ingest::ingest_batch,
    notifications::{SubscriptionState, SyncNotification},
    transport::SubscriptionSignal,
};

/// Events waiting for the quiet period to elapse. Every push re-arms the deadline.
#[derive(Debug)]
pub struct PendingBatch {
    quiet: Duration,
    events: Vec<RelayEvent>,
    deadline: Option<Instant>,
}

impl PendingBatch {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            events: Vec::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, event: RelayEvent) {
        self.events.push(event);
        self.deadline = Some(Instant::now() + self.quiet);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drains the buffer and disarms the timer.
    pub fn take(&mut self) -> Vec<RelayEvent> {
        self.deadline = None;
        mem::take(&mut self.events)
    }
}

/// Backfill plus standing subscription for one conversation, run as its own task.
///
/// Dropping the channel aborts the task, which closes the subscription and discards
/// anything still buffered.
pub struct LiveChannel {
    conversation_id: ConversationId,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
}

impl LiveChannel {
    pub fn spawn(
        ctx: SyncContext,
        dedup: Arc<DedupTracker>,
        cursors: SyncCursors,
        conversation: Conversation,
    ) -> Self {
        let (state_tx, state) = watch::channel(SubscriptionState::Unsubscribed);
        let conversation_id = conversation.id.clone();
        let task = tokio::spawn(run_channel(ctx, dedup, cursors, conversation, state_tx));
        Self {
            conversation_id,
            state,
            task,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(self) {}
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn set_state(
    ctx: &SyncContext,
    conversation_id: &ConversationId,
    state: &watch::Sender<SubscriptionState>,
    next: SubscriptionState,
) {
    state.send_replace(next);
    ctx.notifier.emit(SyncNotification::SubscriptionStateChanged {
        conversation_id: conversation_id.clone(),
        state: next,
    });
}

async fn run_channel(
    ctx: SyncContext,
    dedup: Arc<DedupTracker>,
    cursors: SyncCursors,
    conversation: Conversation,
    state: watch::Sender<SubscriptionState>,
) {
    set_state(&ctx, &conversation.id, &state, SubscriptionState::Backfilling);

    // Subscribe before fetching history so nothing published during backfill is missed.
    let relays = conversation.relays_or(&ctx.settings.relays).to_vec();
    let subscription = match ctx
        .transport
        .subscribe(&relays, &[group_filter(&conversation)])
        .await
    {
        Ok(subscription) => Some(subscription),
        Err(err) => {
            warn!(conversation_id = %conversation.id, error = %err, "live subscription failed");
            None
        }
    };

    run_backfill(&ctx, &dedup, &cursors, &conversation).await;

    let Some(mut subscription) = subscription else {
        set_state(&ctx, &conversation.id, &state, SubscriptionState::Unsubscribed);
        return;
    };
    set_state(&ctx, &conversation.id, &state, SubscriptionState::Live);
    info!(conversation_id = %conversation.id, relays = relays.len(), "live subscription open");

    let mut pending = PendingBatch::new(ctx.settings.debounce());
    loop {
        let deadline = pending.deadline();
        tokio::select! {
            signal = subscription.next() => match signal {
                Some(SubscriptionSignal::Event(event)) => {
                    if dedup.check_and_mark(&event.id).await {
                        pending.push(event);
                    } else {
                        trace!(conversation_id = %conversation.id, event_id = %event.id, "duplicate dropped");
                    }
                }
                Some(SubscriptionSignal::Error(message)) => {
                    warn!(conversation_id = %conversation.id, %message, "relay subscription error");
                }
                Some(SubscriptionSignal::Complete) | None => {
                    let batch = pending.take();
                    if !batch.is_empty() {
                        apply_batch(&ctx, &dedup, &cursors, &conversation, batch).await;
                    }
                    warn!(conversation_id = %conversation.id, "live subscription ended");
                    break;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let batch = pending.take();
                apply_batch(&ctx, &dedup, &cursors, &conversation, batch).await;
            }
        }
    }
    set_state(&ctx, &conversation.id, &state, SubscriptionState::Unsubscribed);
}

/// Ingests `batch` and advances the cursor on success. Returns whether ingestion succeeded.
pub(crate) async fn apply_batch(
    ctx: &SyncContext,
    dedup: &DedupTracker,
    cursors: &SyncCursors,
    conversation: &Conversation,
    batch: Vec<RelayEvent>,
) -> bool {
    let high_water = batch_high_water(&batch);
    let ids: Vec<EventId> = batch.iter().map(|event| event.id.clone()).collect();

    match ingest_batch(ctx, conversation, batch).await {
        Ok(_) => {
            if let Some(at) = high_water {
                if let Err(err) = cursors.advance(&conversation.id, at).await {
                    error!(conversation_id = %conversation.id, error = %err, "failed to store sync cursor");
                }
            }
            true
        }
        Err(err) => {
            error!(
                conversation_id = %conversation.id,
                events = ids.len(),
                error = ?err,
                "batch ingestion failed"
            );
            if ctx.settings.forget_failed_batches {
                dedup.forget(&ids).await;
                debug!(conversation_id = %conversation.id, "failed batch ids released for retry");
            }
            false
        }
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
