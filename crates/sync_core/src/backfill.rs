use shared::{
    domain::{Conversation, Timestamp},
    event::{EventKind, Filter},
};
use tracing::{debug, info, warn};

use crate::{context::SyncContext, cursor::SyncCursors, dedup::DedupTracker, live::apply_batch};

/// Lower bound for a backfill query, or `None` when backfill should be skipped.
///
/// The stored cursor wins over the look-back window when it is newer. A window of
/// `0` disables the bound, so without a cursor nothing is fetched.
pub fn backfill_since(cursor: Option<Timestamp>, now: Timestamp, max_age_secs: u64) -> Option<Timestamp> {
    let floor = (max_age_secs > 0).then(|| now.saturating_sub_secs(max_age_secs));
    let since = match (cursor, floor) {
        (Some(cursor), Some(floor)) => cursor.max(floor),
        (Some(cursor), None) => cursor,
        (None, Some(floor)) => floor,
        (None, None) => return None,
    };
    (since.as_secs() > 0).then_some(since)
}

pub fn group_filter(conversation: &Conversation) -> Filter {
    Filter::new()
        .kind(EventKind::GroupMessage)
        .group_tag(&conversation.group_tag)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillOutcome {
    pub since: Option<Timestamp>,
    pub fetched: usize,
    pub ingested: usize,
}

/// One historical fetch for `conversation`. Failures are logged and leave the cursor alone.
pub async fn run_backfill(
    ctx: &SyncContext,
    dedup: &DedupTracker,
    cursors: &SyncCursors,
    conversation: &Conversation,
) -> BackfillOutcome {
    let cursor = match cursors.get(&conversation.id).await {
        Ok(cursor) => cursor,
        Err(err) => {
            warn!(conversation_id = %conversation.id, error = %err, "failed to read sync cursor");
            None
        }
    };
    let Some(since) = backfill_since(cursor, Timestamp::now(), ctx.settings.backfill_max_age_secs) else {
        debug!(conversation_id = %conversation.id, "backfill skipped");
        return BackfillOutcome::default();
    };

    let mut outcome = BackfillOutcome {
        since: Some(since),
        ..BackfillOutcome::default()
    };
    let relays = conversation.relays_or(&ctx.settings.relays);
    let filter = group_filter(conversation).since(since);
    let events = match ctx.transport.request(relays, &[filter]).await {
        Ok(events) => events,
        Err(err) => {
            warn!(conversation_id = %conversation.id, error = %err, "backfill request failed");
            return outcome;
        }
    };
    outcome.fetched = events.len();

    let fresh = dedup.retain_fresh(events).await;
    if fresh.is_empty() {
        debug!(conversation_id = %conversation.id, fetched = outcome.fetched, "backfill found nothing new");
        return outcome;
    }
    let handed_off = fresh.len();
    if !apply_batch(ctx, dedup, cursors, conversation, fresh).await {
        return outcome;
    }
    outcome.ingested = handed_off;
    info!(
        conversation_id = %conversation.id,
        since = %since,
        fetched = outcome.fetched,
        ingested = outcome.ingested,
        "backfill complete"
    );
    outcome
}

#[cfg(test)]
#[path = "tests/backfill_tests.rs"]
mod tests;
