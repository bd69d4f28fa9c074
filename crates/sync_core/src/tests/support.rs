use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::{
        Conversation, ConversationId, EventId, GroupTag, KeyPackageRecord, PublicKey, StoredMessage,
        Timestamp, UnreadInvite,
    },
    event::{EventKind, Filter, RelayEvent, UnsignedEvent},
    store::{
        ConversationStore, CursorStore, GroupStateStore, InviteStore, KeyPackageStore, ReadStateStore,
    },
};
use tokio::sync::Mutex;

use crate::{
    config::SyncSettings,
    context::SyncContext,
    protocol::{
        EventSigner, GeneratedCredential, GroupProposal, GroupProtocol, GroupUpdate, JoinedConversation,
        MemberAddition,
    },
    transport::{PublishReport, RelayAck, RelaySubscription, RelayTransport, SubscriptionFeed, SubscriptionSignal},
};

pub const RELAY: &str = "wss://relay.test";

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        database_url: "sqlite::memory:".into(),
        relays: vec![RELAY.into()],
        metadata_relays: vec!["wss://metadata.test".into()],
        ..SyncSettings::default()
    }
}

pub fn me() -> PublicKey {
    PublicKey::from("me")
}

pub fn conversation(name: &str) -> Conversation {
    Conversation::new(
        ConversationId::new(format!("conv-{name}")),
        GroupTag(name.as_bytes().to_vec()),
        vec![RELAY.into()],
        name.to_string(),
    )
}

/// A kind 445 event for `conversation`. Content `msg:<text>` decrypts to a chat rumor.
pub fn group_event(conversation: &Conversation, id: &str, created_at: u64, content: &str) -> RelayEvent {
    RelayEvent {
        id: EventId::from(id),
        pubkey: PublicKey::from("peer"),
        created_at: Timestamp(created_at),
        kind: EventKind::GroupMessage,
        tags: vec![vec!["h".into(), conversation.group_tag.to_hex()]],
        content: content.to_string(),
        sig: "sig".into(),
        relay: Some(RELAY.into()),
    }
}

/// A gift-wrapped welcome for the fake protocol: the rumor names the conversation and key package.
pub fn invite_envelope(id: &str, conversation_name: &str, key_package: Option<&str>) -> RelayEvent {
    let mut rumor = UnsignedEvent::new(PublicKey::from("inviter"), EventKind::Welcome, conversation_name);
    if let Some(key_package) = key_package {
        rumor = rumor.tag(vec!["e".into(), key_package.into()]);
    }
    RelayEvent {
        id: EventId::from(id),
        pubkey: PublicKey::from("ephemeral"),
        created_at: Timestamp::now(),
        kind: EventKind::GiftWrap,
        tags: vec![vec!["p".into(), me().0]],
        content: serde_json::to_string(&rumor.ensure_id()).expect("rumor json"),
        sig: "sig".into(),
        relay: None,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub conversations: Mutex<HashMap<ConversationId, Conversation>>,
    pub messages: Mutex<Vec<StoredMessage>>,
    pub cursors: Mutex<HashMap<ConversationId, Timestamp>>,
    pub cursor_writes: Mutex<Vec<(ConversationId, Timestamp)>>,
    pub received: Mutex<Vec<RelayEvent>>,
    pub unread: Mutex<Vec<UnreadInvite>>,
    pub seen: Mutex<HashSet<EventId>>,
    pub key_packages: Mutex<Vec<KeyPackageRecord>>,
    pub read_state: Mutex<HashMap<ConversationId, Timestamp>>,
    pub identity_keys: Mutex<HashMap<PublicKey, Vec<u8>>>,
    pub group_state: Mutex<HashMap<PublicKey, Vec<u8>>>,
    pub group_state_writes: AtomicUsize,
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut all: Vec<_> = self.conversations.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        Ok(self.conversations.lock().await.get(id).cloned())
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .lock()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        self.conversations.lock().await.remove(id);
        self.messages.lock().await.retain(|m| &m.conversation_id != id);
        Ok(())
    }

    async fn put_message(&self, message: &StoredMessage) -> Result<bool> {
        let mut messages = self.messages.lock().await;
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(false);
        }
        messages.push(message.clone());
        Ok(true)
    }

    async fn record_last_message(&self, message: &StoredMessage) -> Result<()> {
        let count = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.conversation_id == message.conversation_id)
            .count() as u64;
        if let Some(conversation) = self.conversations.lock().await.get_mut(&message.conversation_id) {
            conversation.last_message = Some(message.clone());
            conversation.message_count = count;
        }
        Ok(())
    }

    async fn list_messages(&self, id: &ConversationId, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<_> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| &m.conversation_id == id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let skip = messages.len().saturating_sub(limit as usize);
        Ok(messages.split_off(skip))
    }

    async fn count_messages_since(
        &self,
        id: &ConversationId,
        since: Option<Timestamp>,
        excluding_sender: &PublicKey,
    ) -> Result<u64> {
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| &m.conversation_id == id && &m.sender != excluding_sender)
            .filter(|m| since.map_or(true, |since| m.created_at > since))
            .count() as u64)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_cursor(&self, id: &ConversationId) -> Result<Option<Timestamp>> {
        Ok(self.cursors.lock().await.get(id).copied())
    }

    async fn set_cursor(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        self.cursor_writes.lock().await.push((id.clone(), at));
        let mut cursors = self.cursors.lock().await;
        let entry = cursors.entry(id.clone()).or_insert(at);
        *entry = (*entry).max(at);
        Ok(())
    }

    async fn delete_cursor(&self, id: &ConversationId) -> Result<()> {
        self.cursors.lock().await.remove(id);
        Ok(())
    }
}

#[async_trait]
impl InviteStore for MemoryStore {
    async fn put_received(&self, envelope: &RelayEvent) -> Result<bool> {
        if self.seen.lock().await.contains(&envelope.id)
            || self.unread.lock().await.iter().any(|i| i.envelope_id == envelope.id)
        {
            return Ok(false);
        }
        let mut received = self.received.lock().await;
        if received.iter().any(|e| e.id == envelope.id) {
            return Ok(false);
        }
        received.push(envelope.clone());
        Ok(true)
    }

    async fn list_received(&self) -> Result<Vec<RelayEvent>> {
        Ok(self.received.lock().await.clone())
    }

    async fn remove_received(&self, envelope_id: &EventId) -> Result<()> {
        self.received.lock().await.retain(|e| &e.id != envelope_id);
        Ok(())
    }

    async fn put_unread(&self, invite: &UnreadInvite) -> Result<()> {
        let mut unread = self.unread.lock().await;
        unread.retain(|i| i.envelope_id != invite.envelope_id);
        unread.push(invite.clone());
        Ok(())
    }

    async fn list_unread(&self) -> Result<Vec<UnreadInvite>> {
        Ok(self.unread.lock().await.clone())
    }

    async fn remove_unread(&self, envelope_id: &EventId) -> Result<()> {
        self.unread.lock().await.retain(|i| &i.envelope_id != envelope_id);
        Ok(())
    }

    async fn mark_seen(&self, envelope_id: &EventId) -> Result<()> {
        self.seen.lock().await.insert(envelope_id.clone());
        Ok(())
    }

    async fn is_seen(&self, envelope_id: &EventId) -> Result<bool> {
        Ok(self.seen.lock().await.contains(envelope_id))
    }
}

#[async_trait]
impl KeyPackageStore for MemoryStore {
    async fn add_key_package(&self, record: &KeyPackageRecord) -> Result<()> {
        self.key_packages.lock().await.push(record.clone());
        Ok(())
    }

    async fn count_available_key_packages(&self) -> Result<usize> {
        Ok(self.key_packages.lock().await.iter().filter(|k| !k.consumed).count())
    }

    async fn list_unpublished_key_packages(&self) -> Result<Vec<KeyPackageRecord>> {
        Ok(self
            .key_packages
            .lock()
            .await
            .iter()
            .filter(|k| !k.published && !k.consumed)
            .cloned()
            .collect())
    }

    async fn list_key_packages(&self) -> Result<Vec<KeyPackageRecord>> {
        Ok(self.key_packages.lock().await.clone())
    }

    async fn mark_key_package_published(&self, id: &str) -> Result<()> {
        for record in self.key_packages.lock().await.iter_mut().filter(|k| k.id == id) {
            record.published = true;
        }
        Ok(())
    }

    async fn mark_key_package_consumed(&self, event_id: &EventId) -> Result<bool> {
        let mut found = false;
        for record in self
            .key_packages
            .lock()
            .await
            .iter_mut()
            .filter(|k| &k.advertisement.id == event_id)
        {
            record.consumed = true;
            found = true;
        }
        Ok(found)
    }
}

#[async_trait]
impl ReadStateStore for MemoryStore {
    async fn get_last_read(&self, id: &ConversationId) -> Result<Option<Timestamp>> {
        Ok(self.read_state.lock().await.get(id).copied())
    }

    async fn set_last_read(&self, id: &ConversationId, at: Timestamp) -> Result<()> {
        let mut state = self.read_state.lock().await;
        let entry = state.entry(id.clone()).or_insert(at);
        *entry = (*entry).max(at);
        Ok(())
    }

    async fn delete_read_state(&self, id: &ConversationId) -> Result<()> {
        self.read_state.lock().await.remove(id);
        Ok(())
    }
}

#[async_trait]
impl GroupStateStore for MemoryStore {
    async fn save_identity_keys(&self, identity: &PublicKey, identity_bytes: &[u8]) -> Result<()> {
        self.identity_keys
            .lock()
            .await
            .insert(identity.clone(), identity_bytes.to_vec());
        Ok(())
    }

    async fn load_identity_keys(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>> {
        Ok(self.identity_keys.lock().await.get(identity).cloned())
    }

    async fn save_group_state(&self, identity: &PublicKey, state: &[u8]) -> Result<()> {
        self.group_state_writes.fetch_add(1, Ordering::SeqCst);
        self.group_state.lock().await.insert(identity.clone(), state.to_vec());
        Ok(())
    }

    async fn load_group_state(&self, identity: &PublicKey) -> Result<Option<Vec<u8>>> {
        Ok(self.group_state.lock().await.get(identity).cloned())
    }
}

/// Relay network double. `request` answers from `stored`; live events are pushed by the test.
#[derive(Default)]
pub struct FakeTransport {
    pub stored: Mutex<Vec<RelayEvent>>,
    pub published: Mutex<Vec<(Vec<String>, RelayEvent)>>,
    pub requests: Mutex<Vec<(Vec<String>, Vec<Filter>)>>,
    pub feeds: Mutex<Vec<(Vec<Filter>, SubscriptionFeed)>>,
    pub subscribe_calls: AtomicUsize,
    pub fail_publish: AtomicBool,
    pub reject_publish: AtomicBool,
    pub fail_request: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub subscribe_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    /// Delivers `event` to every open subscription whose filters match. Returns the delivery count.
    pub async fn push_live(&self, event: RelayEvent) -> usize {
        let feeds = self.feeds.lock().await;
        feeds
            .iter()
            .filter(|(filters, feed)| !feed.is_closed() && filters.iter().any(|f| f.matches(&event)))
            .filter(|(_, feed)| feed.send(SubscriptionSignal::Event(event.clone())))
            .count()
    }

    /// Ends every open subscription as a relay closing it would.
    pub async fn complete_all(&self) {
        for (_, feed) in self.feeds.lock().await.iter() {
            feed.send(SubscriptionSignal::Complete);
        }
    }

    pub async fn open_subscriptions(&self) -> usize {
        self.feeds
            .lock()
            .await
            .iter()
            .filter(|(_, feed)| !feed.is_closed())
            .count()
    }

    pub async fn open_subscriptions_for(&self, kind: EventKind) -> usize {
        self.feeds
            .lock()
            .await
            .iter()
            .filter(|(filters, feed)| !feed.is_closed() && filters.iter().any(|f| f.kinds.contains(&kind)))
            .count()
    }

    pub async fn published_of(&self, kind: EventKind) -> Vec<RelayEvent> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(_, event)| event.kind == kind)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl RelayTransport for FakeTransport {
    async fn publish(&self, relays: &[String], event: &RelayEvent) -> Result<PublishReport> {
        self.published.lock().await.push((relays.to_vec(), event.clone()));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(anyhow!("relay connection refused"));
        }
        let accepted = !self.reject_publish.load(Ordering::SeqCst);
        Ok(PublishReport {
            acks: relays
                .iter()
                .map(|relay| RelayAck {
                    relay: relay.clone(),
                    accepted,
                    message: (!accepted).then(|| "blocked".to_string()),
                })
                .collect(),
        })
    }

    async fn request(&self, relays: &[String], filters: &[Filter]) -> Result<Vec<RelayEvent>> {
        self.requests.lock().await.push((relays.to_vec(), filters.to_vec()));
        if self.fail_request.load(Ordering::SeqCst) {
            return Err(anyhow!("relay timed out"));
        }
        Ok(self
            .stored
            .lock()
            .await
            .iter()
            .filter(|event| filters.iter().any(|f| f.matches(event)))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, _relays: &[String], filters: &[Filter]) -> Result<RelaySubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.subscribe_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("relay unreachable"));
        }
        let (feed, subscription) = RelaySubscription::channel(format!("sub-{}", self.subscribe_calls.load(Ordering::SeqCst)));
        self.feeds.lock().await.push((filters.to_vec(), feed));
        Ok(subscription)
    }
}

/// Group protocol double. `msg:<text>` decrypts to a chat rumor, `commit` is a commit,
/// anything else is skipped. Welcome rumors carry the conversation name as content.
#[derive(Default)]
pub struct FakeProtocol {
    pub batches: Mutex<Vec<(ConversationId, Vec<EventId>)>>,
    pub fail_ingest: AtomicBool,
    pub fail_join: AtomicBool,
    pub join_delay: Mutex<Option<Duration>>,
    pub joins: AtomicUsize,
    pub fail_commit: AtomicBool,
    pub commits: Mutex<Vec<(ConversationId, Vec<GroupProposal>)>>,
    pub generated: AtomicUsize,
    pub destroyed: Mutex<Vec<ConversationId>>,
}

impl FakeProtocol {
    pub async fn ingested_ids(&self) -> Vec<EventId> {
        self.batches
            .lock()
            .await
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().await.iter().map(|(_, ids)| ids.len()).collect()
    }
}

#[async_trait]
impl GroupProtocol for FakeProtocol {
    fn ingest<'a>(
        &'a self,
        conversation: &'a Conversation,
        events: Vec<RelayEvent>,
    ) -> BoxStream<'a, Result<GroupUpdate>> {
        futures::stream::once(async move {
            self.batches
                .lock()
                .await
                .push((conversation.id.clone(), events.iter().map(|e| e.id.clone()).collect()));
            if self.fail_ingest.load(Ordering::SeqCst) {
                return vec![Err(anyhow!("epoch mismatch"))];
            }
            events
                .into_iter()
                .map(|event| {
                    Ok(if let Some(text) = event.content.strip_prefix("msg:") {
                        GroupUpdate::ApplicationMessage(UnsignedEvent {
                            id: Some(EventId::new(format!("rumor-{}", event.id))),
                            pubkey: event.pubkey.clone(),
                            created_at: event.created_at,
                            kind: EventKind::ChatMessage,
                            tags: Vec::new(),
                            content: text.to_string(),
                        })
                    } else if event.content == "commit" {
                        GroupUpdate::Commit
                    } else {
                        GroupUpdate::Skipped {
                            event_id: event.id.clone(),
                            reason: "undecryptable".into(),
                        }
                    })
                })
                .collect::<Vec<Result<GroupUpdate>>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }

    async fn commit(&self, conversation: &Conversation, proposals: Vec<GroupProposal>) -> Result<UnsignedEvent> {
        self.commits.lock().await.push((conversation.id.clone(), proposals));
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(anyhow!("only admins may commit"));
        }
        Ok(UnsignedEvent::new(me(), EventKind::GroupMessage, "commit")
            .tag(vec!["h".into(), conversation.group_tag.to_hex()]))
    }

    async fn join_from_invite(&self, invite: &UnsignedEvent) -> Result<JoinedConversation> {
        let delay = *self.join_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(anyhow!("welcome references a superseded epoch"));
        }
        Ok(JoinedConversation {
            conversation: conversation(&invite.content),
            consumed_key_package: invite.tag_value("e").map(EventId::from),
        })
    }

    async fn generate_join_credential(&self, identity: &PublicKey, _relays: &[String]) -> Result<GeneratedCredential> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GeneratedCredential {
            id: format!("kp-{n}"),
            advertisement: UnsignedEvent::new(identity.clone(), EventKind::KeyPackage, format!("kp-{n}")),
        })
    }

    async fn create_conversation(
        &self,
        name: &str,
        description: Option<&str>,
        relays: &[String],
    ) -> Result<Conversation> {
        let mut created = conversation(name);
        created.relays = relays.to_vec();
        created.description = description.map(str::to_string);
        Ok(created)
    }

    async fn encrypt(&self, conversation: &Conversation, rumor: &UnsignedEvent) -> Result<UnsignedEvent> {
        Ok(UnsignedEvent::new(me(), EventKind::GroupMessage, format!("msg:{}", rumor.content))
            .tag(vec!["h".into(), conversation.group_tag.to_hex()]))
    }

    async fn add_member(&self, conversation: &Conversation, key_package: &RelayEvent) -> Result<MemberAddition> {
        Ok(MemberAddition {
            commit: UnsignedEvent::new(me(), EventKind::GroupMessage, "commit")
                .tag(vec!["h".into(), conversation.group_tag.to_hex()]),
            welcome: UnsignedEvent::new(me(), EventKind::Welcome, conversation.name.clone())
                .tag(vec!["e".into(), key_package.id.0.clone()]),
        })
    }

    async fn destroy(&self, conversation: &ConversationId) -> Result<()> {
        self.destroyed.lock().await.push(conversation.clone());
        Ok(())
    }
}

/// Signs by hashing; envelopes are plain JSON of the rumor.
#[derive(Default)]
pub struct FakeSigner {
    pub unopenable: Mutex<HashSet<EventId>>,
}

#[async_trait]
impl EventSigner for FakeSigner {
    fn public_key(&self) -> PublicKey {
        me()
    }

    async fn sign(&self, event: UnsignedEvent) -> Result<RelayEvent> {
        Ok(event.into_signed("sig"))
    }

    async fn open_envelope(&self, envelope: &RelayEvent) -> Result<UnsignedEvent> {
        if self.unopenable.lock().await.contains(&envelope.id) {
            return Err(anyhow!("no conversation key for envelope"));
        }
        Ok(serde_json::from_str(&envelope.content)?)
    }

    async fn seal_envelope(&self, recipient: &PublicKey, rumor: UnsignedEvent) -> Result<RelayEvent> {
        Ok(UnsignedEvent::new(me(), EventKind::GiftWrap, serde_json::to_string(&rumor)?)
            .tag(vec!["p".into(), recipient.0.clone()])
            .into_signed("sig"))
    }
}

pub struct Harness {
    pub ctx: SyncContext,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<FakeTransport>,
    pub protocol: Arc<FakeProtocol>,
    pub signer: Arc<FakeSigner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(FakeTransport::default());
        let protocol = Arc::new(FakeProtocol::default());
        let signer = Arc::new(FakeSigner::default());
        let ctx = SyncContext::new(
            settings,
            transport.clone(),
            protocol.clone(),
            signer.clone(),
            store.clone(),
        );
        Self {
            ctx,
            store,
            transport,
            protocol,
            signer,
        }
    }
}

/// Lets spawned tasks run and any pending debounce timer fire.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Waits until at least `count` subscriptions are open.
pub async fn wait_for_subscriptions(transport: &FakeTransport, count: usize) {
    for _ in 0..1000 {
        if transport.open_subscriptions().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("expected {count} open subscriptions");
}
