//! Persistence seams consumed by the sync engine.
//!
//! Every operation is individually atomic per key and durable once it returns `Ok`.

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    domain::{
        Conversation, ConversationId, EventId, KeyPackageRecord, PublicKey, StoredMessage,
        Timestamp, UnreadInvite,
    },
    event::RelayEvent,
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;
    async fn put_conversation(&self, conversation: &Conversation) -> Result<()>;
    /// Removes the conversation record together with its messages.
    async fn delete_conversation(&self, id: &ConversationId) -> Result<()>;
    /// Returns `false` when a message with the same id was already stored.
    async fn put_message(&self, message: &StoredMessage) -> Result<bool>;
    /// Last write wins; callers only write in delivery order.
    async fn record_last_message(&self, message: &StoredMessage) -> Result<()>;
    async fn list_messages(
        &self,
        id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>>;
    async fn count_messages_since(
        &self,
        id: &ConversationId,
        since: Option<Timestamp>,
        excluding_sender: &PublicKey,
    ) -> Result<u64>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, id: &ConversationId) -> Result<Option<Timestamp>>;
    /// Never lowers a stored watermark.
    async fn set_cursor(&self, id: &ConversationId, at: Timestamp) -> Result<()>;
    async fn delete_cursor(&self, id: &ConversationId) -> Result<()>;
}

#[async_trait]
pub trait InviteStore: Send + Sync {
    /// Returns `false` if the envelope is already known in any state.
    async fn put_received(&self, envelope: &RelayEvent) -> Result<bool>;
    async fn list_received(&self) -> Result<Vec<RelayEvent>>;
    async fn remove_received(&self, envelope_id: &EventId) -> Result<()>;
    async fn put_unread(&self, invite: &UnreadInvite) -> Result<()>;
    async fn list_unread(&self) -> Result<Vec<UnreadInvite>>;
    async fn remove_unread(&self, envelope_id: &EventId) -> Result<()>;
    async fn mark_seen(&self, envelope_id: &EventId) -> Result<()>;
    async fn is_seen(&self, envelope_id: &EventId) -> Result<bool>;
}

#[async_trait]
pub trait KeyPackageStore: Send + Sync {
    async fn add_key_package(&self, record: &KeyPackageRecord) -> Result<()>;
    /// Held, unconsumed key packages whether or not their advertisement went out.
    async fn count_available_key_packages(&self) -> Result<usize>;
    async fn list_unpublished_key_packages(&self) -> Result<Vec<KeyPackageRecord>>;
    async fn list_key_packages(&self) -> Result<Vec<KeyPackageRecord>>;
    async fn mark_key_package_published(&self, id: &str) -> Result<()>;
    /// Marks the key package advertised by `event_id` as consumed. Returns `false` if unknown.
    async fn mark_key_package_consumed(&self, event_id: &EventId) -> Result<bool>;
}

#[async_trait]
pub trait ReadStateStore: Send + Sync {
    async fn get_last_read(&self, id: &ConversationId) -> Result<Option<Timestamp>>;
    async fn set_last_read(&self, id: &ConversationId, at: Timestamp) -> Result<()>;
    async fn delete_read_state(&self, id: &ConversationId) -> Result<()>;
}

/// Opaque group-protocol state for one local identity.
#[async_trait]
pub trait GroupStateStore: Send + Sync {
    async fn save_identity_keys(&self, identity: &PublicKey, identity_bytes: &[u8]) -> Result<()>;
    async fn load_identity_keys(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>>;
    /// Replaces the whole snapshot.
    async fn save_group_state(&self, identity: &PublicKey, state: &[u8]) -> Result<()>;
    async fn load_group_state(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>>;
}

pub trait SyncStore:
    ConversationStore + CursorStore + InviteStore + KeyPackageStore + ReadStateStore
{
}

impl<T> SyncStore for T where
    T: ConversationStore + CursorStore + InviteStore + KeyPackageStore + ReadStateStore
{
}
