use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{Conversation, ConversationId, UnreadInvite},
    event::{EventKind, RelayEvent},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    context::SyncContext,
    dedup::DedupTracker,
    key_packages::CredentialRotation,
    notifications::SyncNotification,
};

/// Registers a live channel for a conversation joined through an invite.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    async fn register(&self, conversation: Conversation);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvitePassReport {
    pub opened: usize,
    pub open_failed: usize,
    pub joined: Vec<ConversationId>,
    pub join_failed: usize,
}

/// Moves invite envelopes through received, unread and seen.
///
/// Every stage is persisted, so a failure leaves the envelope where it was and the
/// next pass picks it up again.
pub struct InvitePipeline {
    ctx: SyncContext,
    rotation: Arc<CredentialRotation>,
    dedup: Arc<DedupTracker>,
    pass_lock: Mutex<()>,
}

impl InvitePipeline {
    pub fn new(ctx: SyncContext, rotation: Arc<CredentialRotation>, dedup: Arc<DedupTracker>) -> Self {
        Self {
            ctx,
            rotation,
            dedup,
            pass_lock: Mutex::new(()),
        }
    }

    /// Stores an envelope without opening it. Returns `false` for envelopes already known.
    pub async fn receive(&self, envelope: &RelayEvent) -> Result<bool> {
        if envelope.kind != EventKind::GiftWrap {
            debug!(event_id = %envelope.id, kind = envelope.kind.as_u16(), "ignoring non-envelope event");
            return Ok(false);
        }
        if self.ctx.store.is_seen(&envelope.id).await? {
            return Ok(false);
        }
        self.ctx.store.put_received(envelope).await
    }

    /// Opens every received envelope independently. Returns `(opened, failed)`.
    pub async fn decrypt_pass(&self) -> Result<(usize, usize)> {
        let received = self.ctx.store.list_received().await?;
        let (mut opened, mut failed) = (0, 0);
        for envelope in received {
            if self.ctx.store.is_seen(&envelope.id).await? {
                self.ctx.store.remove_received(&envelope.id).await?;
                continue;
            }
            let rumor = match self.ctx.signer.open_envelope(&envelope).await {
                Ok(rumor) => rumor,
                Err(err) => {
                    warn!(envelope_id = %envelope.id, error = %err, "failed to open invite envelope");
                    failed += 1;
                    continue;
                }
            };
            if rumor.kind != EventKind::Welcome {
                debug!(envelope_id = %envelope.id, kind = rumor.kind.as_u16(), "envelope is not an invite");
                self.ctx.store.remove_received(&envelope.id).await?;
                self.ctx.store.mark_seen(&envelope.id).await?;
                continue;
            }
            let invite = UnreadInvite {
                envelope_id: envelope.id.clone(),
                rumor,
            };
            self.ctx.store.put_unread(&invite).await?;
            self.ctx.store.remove_received(&envelope.id).await?;
            opened += 1;
        }
        Ok((opened, failed))
    }

    /// Attempts to join every unread invite. Failed joins stay unread.
    pub async fn join_pass(&self, registry: &dyn ChannelRegistry) -> Result<(Vec<ConversationId>, usize)> {
        let unread = self.ctx.store.list_unread().await?;
        let mut joined = Vec::new();
        let mut failed = 0;
        for invite in unread {
            match self.join(&invite, registry).await {
                Ok(conversation_id) => joined.push(conversation_id),
                Err(err) => {
                    warn!(envelope_id = %invite.envelope_id, error = ?err, "failed to join from invite");
                    failed += 1;
                }
            }
        }
        Ok((joined, failed))
    }

    async fn join(&self, invite: &UnreadInvite, registry: &dyn ChannelRegistry) -> Result<ConversationId> {
        let joined = self
            .ctx
            .protocol
            .join_from_invite(&invite.rumor)
            .await
            .context("group protocol rejected the invite")?;
        let mut conversation = joined.conversation;
        let me = self.ctx.signer.public_key();
        if !conversation.members.contains(&me) {
            conversation.members.push(me);
        }
        self.ctx
            .store
            .put_conversation(&conversation)
            .await
            .context("failed to store joined conversation")?;
        if let Some(key_package) = &joined.consumed_key_package {
            if !self.ctx.store.mark_key_package_consumed(key_package).await? {
                debug!(key_package = %key_package, "invite consumed an unknown key package");
            }
        }

        registry.register(conversation.clone()).await;
        self.self_update(&conversation).await;

        self.ctx.store.mark_seen(&invite.envelope_id).await?;
        self.ctx.store.remove_unread(&invite.envelope_id).await?;
        info!(conversation_id = %conversation.id, envelope_id = %invite.envelope_id, "joined conversation from invite");
        self.ctx.notifier.emit(SyncNotification::ConversationJoined {
            conversation_id: conversation.id.clone(),
        });

        match self
            .rotation
            .rotate_if_needed(self.ctx.settings.key_package_min_count)
            .await
        {
            Ok(outcome) => debug!(?outcome, "key package rotation after join"),
            Err(err) => warn!(error = %err, "key package rotation failed"),
        }
        Ok(conversation.id)
    }

    /// Rotates the leaf key away from the consumed key package. Failures are expected for
    /// members the group does not allow to commit, so they are only logged.
    async fn self_update(&self, conversation: &Conversation) {
        let result: Result<()> = async {
            let commit = self.ctx.protocol.commit(conversation, Vec::new()).await?;
            let signed = self.ctx.signer.sign(commit).await?;
            self.dedup.mark(&signed.id).await;
            self.ctx
                .publish_accepted(conversation.relays_or(&self.ctx.settings.relays), &signed)
                .await
        }
        .await;
        match result {
            Ok(()) => debug!(conversation_id = %conversation.id, "self-update committed after join"),
            Err(err) => debug!(conversation_id = %conversation.id, error = %err, "self-update after join failed"),
        }
    }

    /// Decrypt pass followed by join pass, one at a time. Observers hear about it once.
    pub async fn run_pass(&self, registry: &dyn ChannelRegistry) -> InvitePassReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = InvitePassReport::default();

        match self.decrypt_pass().await {
            Ok((opened, failed)) => {
                report.opened = opened;
                report.open_failed = failed;
            }
            Err(err) => warn!(error = %err, "invite decrypt pass failed"),
        }
        match self.join_pass(registry).await {
            Ok((joined, failed)) => {
                report.joined = joined;
                report.join_failed = failed;
            }
            Err(err) => warn!(error = %err, "invite join pass failed"),
        }

        if report.opened + report.open_failed + report.joined.len() + report.join_failed > 0 {
            info!(
                opened = report.opened,
                joined = report.joined.len(),
                failed = report.open_failed + report.join_failed,
                "invite pass complete"
            );
        }
        self.ctx.notifier.emit(SyncNotification::InvitesProcessed {
            joined: report.joined.len(),
            failed: report.open_failed + report.join_failed,
        });
        if !report.joined.is_empty() {
            self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        }
        report
    }
}

#[cfg(test)]
#[path = "tests/invites_tests.rs"]
mod tests;
