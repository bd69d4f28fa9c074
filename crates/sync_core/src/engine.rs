use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{Conversation, ConversationId, PublicKey, StoredMessage, Timestamp},
    event::{EventKind, Filter, UnsignedEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    context::SyncContext,
    cursor::SyncCursors,
    dedup::DedupTracker,
    error::SyncError,
    ingest::stored_message,
    invites::{ChannelRegistry, InvitePassReport, InvitePipeline},
    key_packages::CredentialRotation,
    live::LiveChannel,
    notifications::{SubscriptionState, SyncNotification},
    protocol::GroupProposal,
    transport::SubscriptionSignal,
};

#[derive(Default)]
struct EngineState {
    started: bool,
    channels: HashMap<ConversationId, LiveChannel>,
    invite_task: Option<JoinHandle<()>>,
}

/// Session-wide orchestrator: one live channel per conversation plus the invite pipeline.
pub struct SyncEngine {
    ctx: SyncContext,
    dedup: Arc<DedupTracker>,
    cursors: SyncCursors,
    rotation: Arc<CredentialRotation>,
    invites: InvitePipeline,
    state: Mutex<EngineState>,
    reconnecting: Mutex<()>,
    reconnect_pending: AtomicBool,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Arc<Self> {
        let dedup = Arc::new(DedupTracker::new(ctx.settings.dedup_capacity));
        let cursors = SyncCursors::new(Arc::clone(&ctx.store));
        let rotation = Arc::new(CredentialRotation::new(ctx.clone()));
        let invites = InvitePipeline::new(ctx.clone(), Arc::clone(&rotation), Arc::clone(&dedup));
        Arc::new(Self {
            ctx,
            dedup,
            cursors,
            rotation,
            invites,
            state: Mutex::new(EngineState::default()),
            reconnecting: Mutex::new(()),
            reconnect_pending: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn dedup(&self) -> &DedupTracker {
        &self.dedup
    }

    pub fn cursors(&self) -> &SyncCursors {
        &self.cursors
    }

    pub fn rotation(&self) -> &CredentialRotation {
        &self.rotation
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.ctx.notifier.subscribe()
    }

    /// Fills the key package pool, then brings every subscription up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.rotation
            .ensure_published(self.ctx.settings.key_package_min_count)
            .await
            .context("failed to publish key packages")?;
        self.state.lock().await.started = true;
        self.setup().await
    }

    /// Closes every live channel and the invite subscription and forgets dedup state.
    /// Cursors are untouched.
    pub async fn teardown(&self) {
        // The invite task registers channels, so it must be gone before they are collected.
        let invite_task = self.state.lock().await.invite_task.take();
        if let Some(task) = invite_task {
            task.abort();
            let _ = task.await;
        }
        let channels = std::mem::take(&mut self.state.lock().await.channels);
        let closed = channels.len();
        for (conversation_id, channel) in channels {
            channel.close();
            self.ctx.notifier.emit(SyncNotification::SubscriptionStateChanged {
                conversation_id,
                state: SubscriptionState::Unsubscribed,
            });
        }
        self.dedup.clear().await;
        info!(channels = closed, "sync teardown complete");
    }

    /// Subscribes every stored conversation, opens the invite subscription and runs one invite pass.
    pub async fn setup(self: &Arc<Self>) -> Result<()> {
        let conversations = self
            .ctx
            .store
            .list_conversations()
            .await
            .context("failed to list conversations")?;
        for conversation in conversations {
            self.subscribe_conversation(conversation).await;
        }
        self.start_invite_subscription().await;
        self.process_invites().await;
        info!(
            conversations = self.state.lock().await.channels.len(),
            "sync setup complete"
        );
        Ok(())
    }

    /// Teardown then setup. Returns `Ok(false)` when another reconnect was already running;
    /// that one then runs exactly one more cycle once its current one finishes.
    pub async fn reconnect(self: &Arc<Self>) -> Result<bool> {
        let Ok(_guard) = self.reconnecting.try_lock() else {
            self.reconnect_pending.store(true, Ordering::SeqCst);
            debug!("reconnect already in flight, queued another cycle");
            return Ok(false);
        };
        if !self.state.lock().await.started {
            return Err(SyncError::NotStarted.into());
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
        loop {
            self.teardown().await;
            self.setup().await?;
            self.ctx.notifier.emit(SyncNotification::Reconnected);
            info!("reconnected");
            if !self.reconnect_pending.swap(false, Ordering::SeqCst) {
                return Ok(true);
            }
            debug!("reconnect requested mid-cycle, cycling again");
        }
    }

    /// Starts backfill and a live subscription. Returns `false` if one is already running.
    pub async fn subscribe_conversation(&self, conversation: Conversation) -> bool {
        let mut state = self.state.lock().await;
        if state
            .channels
            .get(&conversation.id)
            .is_some_and(|channel| !channel.is_finished())
        {
            return false;
        }
        let conversation_id = conversation.id.clone();
        let channel = LiveChannel::spawn(
            self.ctx.clone(),
            Arc::clone(&self.dedup),
            self.cursors.clone(),
            conversation,
        );
        state.channels.insert(conversation_id, channel);
        true
    }

    pub async fn unsubscribe_conversation(&self, id: &ConversationId) -> bool {
        let channel = self.state.lock().await.channels.remove(id);
        match channel {
            Some(channel) => {
                channel.close();
                self.ctx.notifier.emit(SyncNotification::SubscriptionStateChanged {
                    conversation_id: id.clone(),
                    state: SubscriptionState::Unsubscribed,
                });
                true
            }
            None => false,
        }
    }

    pub async fn subscription_state(&self, id: &ConversationId) -> SubscriptionState {
        self.state
            .lock()
            .await
            .channels
            .get(id)
            .map(LiveChannel::state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub async fn active_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.state.lock().await.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn invite_subscription_active(&self) -> bool {
        self.state
            .lock()
            .await
            .invite_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// One decrypt pass followed by one join pass.
    pub async fn process_invites(&self) -> InvitePassReport {
        self.invites.run_pass(self).await
    }

    async fn start_invite_subscription(self: &Arc<Self>) {
        let me = self.ctx.signer.public_key();
        let filter = Filter::new().kind(EventKind::GiftWrap).recipient(&me);
        let mut subscription = match self
            .ctx
            .transport
            .subscribe(&self.ctx.settings.relays, &[filter])
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(error = %err, "invite subscription failed");
                return;
            }
        };

        let engine: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(signal) = subscription.next().await {
                let Some(engine) = engine.upgrade() else { break };
                match signal {
                    SubscriptionSignal::Event(envelope) => match engine.invites.receive(&envelope).await {
                        Ok(true) => {
                            engine.process_invites().await;
                        }
                        Ok(false) => debug!(envelope_id = %envelope.id, "invite envelope already known"),
                        Err(err) => warn!(envelope_id = %envelope.id, error = %err, "failed to store invite envelope"),
                    },
                    SubscriptionSignal::Error(message) => warn!(%message, "invite subscription error"),
                    SubscriptionSignal::Complete => break,
                }
            }
            debug!("invite subscription ended");
        });

        let mut state = self.state.lock().await;
        if let Some(previous) = state.invite_task.replace(task) {
            previous.abort();
        }
    }

    pub async fn create_conversation(
        &self,
        name: &str,
        description: Option<&str>,
        relays: &[String],
    ) -> Result<Conversation> {
        let relays = if relays.is_empty() {
            self.ctx.settings.relays.as_slice()
        } else {
            relays
        };
        let mut conversation = self
            .ctx
            .protocol
            .create_conversation(name, description, relays)
            .await
            .context("failed to create group")?;
        let me = self.ctx.signer.public_key();
        if !conversation.members.contains(&me) {
            conversation.members.push(me);
        }
        self.ctx.store.put_conversation(&conversation).await?;
        self.subscribe_conversation(conversation.clone()).await;
        self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        info!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    async fn require_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.ctx
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| SyncError::UnknownConversation(id.clone()).into())
    }

    pub async fn send_message(&self, id: &ConversationId, content: &str) -> Result<StoredMessage> {
        let conversation = self.require_conversation(id).await?;
        let rumor = UnsignedEvent::new(self.ctx.signer.public_key(), EventKind::ChatMessage, content).ensure_id();
        let encrypted = self
            .ctx
            .protocol
            .encrypt(&conversation, &rumor)
            .await
            .context("failed to encrypt message")?;
        let signed = self.ctx.signer.sign(encrypted).await?;
        self.dedup.mark(&signed.id).await;
        self.ctx
            .publish_accepted(conversation.relays_or(&self.ctx.settings.relays), &signed)
            .await?;

        let message = stored_message(&conversation, &rumor);
        if self.ctx.store.put_message(&message).await? {
            self.ctx.store.record_last_message(&message).await?;
        }
        self.ctx.notifier.emit(SyncNotification::MessageReceived {
            conversation_id: conversation.id.clone(),
            message_id: message.id.clone(),
        });
        Ok(message)
    }

    /// Adds `recipient` to the group and delivers the welcome to their inbox relays.
    pub async fn invite_member(&self, id: &ConversationId, recipient: &PublicKey) -> Result<()> {
        let conversation = self.require_conversation(id).await?;
        let filter = Filter::new()
            .kind(EventKind::KeyPackage)
            .author(recipient.clone())
            .limit(1);
        let key_package = self
            .ctx
            .transport
            .request(&self.ctx.settings.lookup_relays(), &[filter])
            .await
            .context("failed to fetch key package")?
            .into_iter()
            .max_by_key(|event| event.created_at)
            .ok_or_else(|| SyncError::MissingKeyPackage(recipient.clone()))?;

        let addition = self
            .ctx
            .protocol
            .add_member(&conversation, &key_package)
            .await
            .context("failed to add member")?;
        self.publish_commit(&conversation, addition.commit).await?;

        let inbox = self.resolve_inbox_relays(recipient).await;
        let envelope = self
            .ctx
            .signer
            .seal_envelope(recipient, addition.welcome)
            .await
            .context("failed to seal welcome")?;
        self.ctx.publish_accepted(&inbox, &envelope).await?;

        let mut updated = conversation;
        if !updated.members.contains(recipient) {
            updated.members.push(recipient.clone());
        }
        self.ctx.store.put_conversation(&updated).await?;
        self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        info!(conversation_id = %updated.id, recipient = %recipient, "member invited");
        Ok(())
    }

    /// Signs a commit, marks it seen so the live echo is not re-ingested, and publishes it.
    async fn publish_commit(&self, conversation: &Conversation, commit: UnsignedEvent) -> Result<()> {
        let commit = self.ctx.signer.sign(commit).await?;
        self.dedup.mark(&commit.id).await;
        self.ctx
            .publish_accepted(conversation.relays_or(&self.ctx.settings.relays), &commit)
            .await
    }

    /// Commits the removal of `member` and drops them from the local record.
    pub async fn remove_member(&self, id: &ConversationId, member: &PublicKey) -> Result<()> {
        let conversation = self.require_conversation(id).await?;
        if member == &self.ctx.signer.public_key() {
            return Err(SyncError::RemoveSelf(id.clone()).into());
        }
        let commit = self
            .ctx
            .protocol
            .commit(&conversation, vec![GroupProposal::RemoveMember(member.clone())])
            .await
            .context("failed to commit member removal")?;
        self.publish_commit(&conversation, commit).await?;

        let mut updated = conversation;
        updated.members.retain(|m| m != member);
        self.ctx.store.put_conversation(&updated).await?;
        self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        info!(conversation_id = %id, member = %member, "member removed");
        Ok(())
    }

    /// Commits new group metadata. `None` keeps the current value; an empty description clears it.
    pub async fn update_conversation(
        &self,
        id: &ConversationId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = self.require_conversation(id).await?;
        let name = name.unwrap_or(&conversation.name).to_string();
        let description = match description {
            Some("") => None,
            Some(description) => Some(description.to_string()),
            None => conversation.description.clone(),
        };
        let commit = self
            .ctx
            .protocol
            .commit(
                &conversation,
                vec![GroupProposal::UpdateMetadata {
                    name: name.clone(),
                    description: description.clone(),
                }],
            )
            .await
            .context("failed to commit metadata update")?;
        self.publish_commit(&conversation, commit).await?;

        let mut updated = conversation;
        updated.name = name;
        updated.description = description;
        self.ctx.store.put_conversation(&updated).await?;
        self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        info!(conversation_id = %id, "conversation metadata updated");
        Ok(updated)
    }

    /// Stops syncing and removes every local trace of the conversation.
    pub async fn leave_conversation(&self, id: &ConversationId) -> Result<()> {
        self.require_conversation(id).await?;
        self.unsubscribe_conversation(id).await;
        self.ctx
            .protocol
            .destroy(id)
            .await
            .context("failed to destroy group state")?;
        self.ctx.store.delete_conversation(id).await?;
        self.ctx.store.delete_read_state(id).await?;
        self.cursors.delete(id).await?;
        self.ctx.notifier.emit(SyncNotification::ConversationsChanged);
        info!(conversation_id = %id, "left conversation");
        Ok(())
    }

    pub async fn mark_read(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        self.require_conversation(id).await?;
        self.ctx.store.set_last_read(id, at).await
    }

    /// Messages from other members newer than the read watermark.
    pub async fn unread_count(&self, id: &ConversationId) -> Result<u64> {
        let last_read = self.ctx.store.get_last_read(id).await?;
        self.ctx
            .store
            .count_messages_since(id, last_read, &self.ctx.signer.public_key())
            .await
    }

    /// Inbox relays advertised by `identity`, or the default relays.
    pub async fn resolve_inbox_relays(&self, identity: &PublicKey) -> Vec<String> {
        match self
            .ctx
            .transport
            .resolve_inbox_relays(identity, &self.ctx.settings.lookup_relays())
            .await
        {
            Ok(relays) if !relays.is_empty() => relays,
            Ok(_) => self.ctx.settings.relays.clone(),
            Err(err) => {
                warn!(identity = %identity, error = %err, "inbox relay lookup failed");
                self.ctx.settings.relays.clone()
            }
        }
    }
}

#[async_trait]
impl ChannelRegistry for SyncEngine {
    async fn register(&self, conversation: Conversation) {
        let conversation_id = conversation.id.clone();
        if !self.subscribe_conversation(conversation).await {
            debug!(conversation_id = %conversation_id, "conversation already subscribed");
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
