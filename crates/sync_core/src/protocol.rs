use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{Conversation, ConversationId, EventId, PublicKey},
    event::{RelayEvent, UnsignedEvent},
};

/// One result of feeding ciphertext to the group state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupUpdate {
    /// Decrypted application rumor.
    ApplicationMessage(UnsignedEvent),
    Proposal,
    Commit,
    /// The event was not applicable or its payload could not be decoded.
    Skipped { event_id: EventId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedConversation {
    pub conversation: Conversation,
    /// Advertisement of the key package the welcome was addressed to, when the invite names it.
    pub consumed_key_package: Option<EventId>,
}

/// A freshly generated join credential and its unsigned advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCredential {
    pub id: String,
    pub advertisement: UnsignedEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddition {
    pub commit: UnsignedEvent,
    /// Unsigned welcome rumor for the new member, sealed by the caller.
    pub welcome: UnsignedEvent,
}

/// A membership or metadata change folded into one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupProposal {
    RemoveMember(PublicKey),
    /// Replaces the conversation's name and description for every member.
    UpdateMetadata { name: String, description: Option<String> },
}

/// The group-key-agreement state machine. Events it returns are unsigned.
#[async_trait]
pub trait GroupProtocol: Send + Sync {
    /// Lazily applies `events` in order. An `Err` item fails the whole batch.
    fn ingest<'a>(
        &'a self,
        conversation: &'a Conversation,
        events: Vec<RelayEvent>,
    ) -> BoxStream<'a, Result<GroupUpdate>>;

    /// Commits `proposals` in one epoch change, or rotates the local key when empty.
    async fn commit(
        &self,
        conversation: &Conversation,
        proposals: Vec<GroupProposal>,
    ) -> Result<UnsignedEvent>;

    async fn join_from_invite(&self, invite: &UnsignedEvent) -> Result<JoinedConversation>;

    async fn generate_join_credential(
        &self,
        identity: &PublicKey,
        relays: &[String],
    ) -> Result<GeneratedCredential>;

    async fn create_conversation(
        &self,
        name: &str,
        description: Option<&str>,
        relays: &[String],
    ) -> Result<Conversation>;

    async fn encrypt(&self, conversation: &Conversation, rumor: &UnsignedEvent) -> Result<UnsignedEvent>;

    async fn add_member(&self, conversation: &Conversation, key_package: &RelayEvent) -> Result<MemberAddition>;

    async fn destroy(&self, conversation: &ConversationId) -> Result<()>;
}

/// Identity provider: signs outbound events and opens or seals invite envelopes.
#[async_trait]
pub trait EventSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;

    async fn sign(&self, event: UnsignedEvent) -> Result<RelayEvent>;

    async fn open_envelope(&self, envelope: &RelayEvent) -> Result<UnsignedEvent>;

    async fn seal_envelope(&self, recipient: &PublicKey, rumor: UnsignedEvent) -> Result<RelayEvent>;
}
