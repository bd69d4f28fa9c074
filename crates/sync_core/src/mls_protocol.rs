use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{stream::BoxStream, StreamExt};
use mls::{MlsClient, MlsIdentity, ProcessedMessage};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{to_hex, Conversation, ConversationId, EventId, GroupTag, PublicKey},
    event::{EventKind, RelayEvent, UnsignedEvent},
    store::GroupStateStore,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::protocol::{
    GeneratedCredential, GroupProposal, GroupProtocol, GroupUpdate, JoinedConversation,
    MemberAddition,
};

const MLS_PROTOCOL_VERSION: &str = "1.0";
const CIPHERSUITE_TAG: &str = "0x0001";

/// Name and description as carried in the group context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct GroupMetadata {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl GroupMetadata {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Group protocol backed by OpenMLS. Conversation ids and group tags are the hex MLS group id.
///
/// Every operation that changes key material writes a full client snapshot to the
/// [`GroupStateStore`] before returning, so a restarted process resumes with the same
/// signer, key packages and group epochs.
pub struct MlsGroupProtocol {
    identity: PublicKey,
    client_name: String,
    client: Mutex<MlsClient>,
    store: Arc<dyn GroupStateStore>,
}

impl MlsGroupProtocol {
    /// Loads the identity and group state saved for `identity`, creating fresh ones on first use.
    pub async fn open(
        identity: PublicKey,
        client_name: impl Into<String>,
        store: Arc<dyn GroupStateStore>,
    ) -> Result<Self> {
        let mls_identity = match store.load_identity_keys(&identity).await? {
            Some(bytes) => MlsIdentity::from_bytes(&bytes).context("stored MLS identity is unreadable")?,
            None => {
                let created = MlsIdentity::new_with_name(identity.as_str().as_bytes().to_vec())?;
                store.save_identity_keys(&identity, &created.to_bytes()?).await?;
                info!(identity = %identity, "created MLS identity");
                created
            }
        };
        let client = match store.load_group_state(&identity).await? {
            Some(state) => MlsClient::restore(mls_identity, &state).context("stored MLS state is unreadable")?,
            None => MlsClient::new(mls_identity),
        };
        Ok(Self {
            identity,
            client_name: client_name.into(),
            client: Mutex::new(client),
            store,
        })
    }

    async fn persist(&self, client: &MlsClient) -> Result<()> {
        let state = client.export_state()?;
        self.store
            .save_group_state(&self.identity, &state)
            .await
            .context("failed to persist MLS state")
    }

    async fn persist_current(&self) -> Result<()> {
        let client = self.client.lock().await;
        self.persist(&client).await
    }

    fn group_message(&self, conversation: &Conversation, payload: &[u8]) -> UnsignedEvent {
        UnsignedEvent::new(self.identity.clone(), EventKind::GroupMessage, STANDARD.encode(payload))
            .tag(vec!["h".into(), conversation.group_tag.to_hex()])
    }

    async fn apply(&self, conversation: &Conversation, event: RelayEvent) -> Result<GroupUpdate> {
        let skipped = |reason: String| GroupUpdate::Skipped {
            event_id: event.id.clone(),
            reason,
        };
        if event.kind != EventKind::GroupMessage {
            return Ok(skipped(format!("unexpected kind {}", event.kind.as_u16())));
        }
        let payload = match STANDARD.decode(event.content.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => return Ok(skipped(format!("content is not base64: {err}"))),
        };

        let mut client = self.client.lock().await;
        if !client.has_group(&conversation.group_tag.0) {
            bail!("no group state for conversation {}", conversation.id);
        }
        let processed = match client.process_message(&conversation.group_tag.0, &payload) {
            Ok(processed) => processed,
            Err(err) => return Ok(skipped(err.to_string())),
        };
        drop(client);

        Ok(match processed {
            ProcessedMessage::Application(plaintext) => match serde_json::from_slice::<UnsignedEvent>(&plaintext) {
                Ok(rumor) => GroupUpdate::ApplicationMessage(rumor),
                Err(err) => skipped(format!("application payload is not a rumor: {err}")),
            },
            ProcessedMessage::Proposal => GroupUpdate::Proposal,
            ProcessedMessage::Commit => GroupUpdate::Commit,
        })
    }
}

#[async_trait]
impl GroupProtocol for MlsGroupProtocol {
    fn ingest<'a>(
        &'a self,
        conversation: &'a Conversation,
        mut events: Vec<RelayEvent>,
    ) -> BoxStream<'a, Result<GroupUpdate>> {
        // Epoch order: older commits must be merged before later messages decrypt.
        events.sort_by_key(|event| event.created_at);
        let updates = futures::stream::iter(events).then(move |event| self.apply(conversation, event));
        // Saved once the whole batch went through; a failed batch is redelivered from the cursor.
        let saved = futures::stream::once(self.persist_current())
            .filter_map(|result| async move { result.err().map(Err) });
        updates.chain(saved).boxed()
    }

    async fn commit(&self, conversation: &Conversation, proposals: Vec<GroupProposal>) -> Result<UnsignedEvent> {
        let group_id = &conversation.group_tag.0;
        let mut removals = Vec::new();
        let mut metadata = None;
        for proposal in proposals {
            match proposal {
                GroupProposal::RemoveMember(member) => removals.push(member.as_str().as_bytes().to_vec()),
                GroupProposal::UpdateMetadata { name, description } => {
                    metadata = Some(GroupMetadata { name, description }.encode()?);
                }
            }
        }

        let mut client = self.client.lock().await;
        let commit = if removals.is_empty() && metadata.is_none() {
            client.self_update(group_id)?
        } else {
            client.commit_changes(group_id, &removals, metadata.as_deref())?
        };
        self.persist(&client).await?;
        drop(client);
        Ok(self.group_message(conversation, &commit))
    }

    async fn join_from_invite(&self, invite: &UnsignedEvent) -> Result<JoinedConversation> {
        if invite.kind != EventKind::Welcome {
            bail!("invite rumor has kind {}", invite.kind.as_u16());
        }
        let welcome = STANDARD
            .decode(invite.content.as_bytes())
            .context("welcome content is not base64")?;
        let mut client = self.client.lock().await;
        let group_id = client.join_from_welcome(&welcome)?;
        let metadata = client
            .metadata(&group_id)
            .and_then(|bytes| serde_json::from_slice::<GroupMetadata>(&bytes).ok());
        self.persist(&client).await?;
        drop(client);

        let relays = invite
            .tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some("relays"))
            .map(|tag| tag[1..].to_vec())
            .unwrap_or_default();
        let (name, description) = match metadata {
            Some(metadata) => (metadata.name, metadata.description),
            None => (
                invite.tag_value("name").unwrap_or("Untitled group").to_string(),
                invite.tag_value("description").map(str::to_string),
            ),
        };
        let mut conversation = Conversation::new(
            ConversationId(to_hex(&group_id)),
            GroupTag(group_id),
            relays,
            name,
        );
        conversation.description = description;
        conversation.members.push(invite.pubkey.clone());
        debug!(conversation_id = %conversation.id, "joined group from welcome");

        Ok(JoinedConversation {
            conversation,
            consumed_key_package: invite.tag_value("e").map(EventId::from),
        })
    }

    async fn generate_join_credential(&self, identity: &PublicKey, relays: &[String]) -> Result<GeneratedCredential> {
        let client = self.client.lock().await;
        let generated = client.generate_key_package()?;
        // The private half must be durable before the advertisement can be published.
        self.persist(&client).await?;
        drop(client);
        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(relays.iter().cloned());
        let advertisement = UnsignedEvent::new(
            identity.clone(),
            EventKind::KeyPackage,
            STANDARD.encode(&generated.key_package_bytes),
        )
        .tag(vec!["mls_protocol_version".into(), MLS_PROTOCOL_VERSION.into()])
        .tag(vec!["mls_ciphersuite".into(), CIPHERSUITE_TAG.into()])
        .tag(vec!["client".into(), self.client_name.clone()])
        .tag(relays_tag);
        Ok(GeneratedCredential {
            id: to_hex(&generated.reference),
            advertisement,
        })
    }

    async fn create_conversation(
        &self,
        name: &str,
        description: Option<&str>,
        relays: &[String],
    ) -> Result<Conversation> {
        let metadata = GroupMetadata {
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        let mut client = self.client.lock().await;
        let group_id = client.create_group(&metadata.encode()?)?;
        self.persist(&client).await?;
        drop(client);
        let mut conversation = Conversation::new(
            ConversationId(to_hex(&group_id)),
            GroupTag(group_id),
            relays.to_vec(),
            name.to_string(),
        );
        conversation.description = description.map(str::to_string);
        Ok(conversation)
    }

    async fn encrypt(&self, conversation: &Conversation, rumor: &UnsignedEvent) -> Result<UnsignedEvent> {
        let plaintext = serde_json::to_vec(rumor)?;
        let mut client = self.client.lock().await;
        let ciphertext = client.encrypt_application(&conversation.group_tag.0, &plaintext)?;
        self.persist(&client).await?;
        drop(client);
        Ok(self.group_message(conversation, &ciphertext))
    }

    async fn add_member(&self, conversation: &Conversation, key_package: &RelayEvent) -> Result<MemberAddition> {
        if key_package.kind != EventKind::KeyPackage {
            return Err(anyhow!("event {} is not a key package", key_package.id));
        }
        let key_package_bytes = STANDARD
            .decode(key_package.content.as_bytes())
            .context("key package content is not base64")?;
        let mut client = self.client.lock().await;
        let output = client.add_member(&conversation.group_tag.0, &key_package_bytes)?;
        self.persist(&client).await?;
        drop(client);

        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(conversation.relays.iter().cloned());
        let mut welcome = UnsignedEvent::new(
            self.identity.clone(),
            EventKind::Welcome,
            STANDARD.encode(&output.welcome_bytes),
        )
        .tag(relays_tag)
        .tag(vec!["e".into(), key_package.id.0.clone()])
        .tag(vec!["name".into(), conversation.name.clone()]);
        if let Some(description) = &conversation.description {
            welcome = welcome.tag(vec!["description".into(), description.clone()]);
        }

        Ok(MemberAddition {
            commit: self.group_message(conversation, &output.commit_bytes),
            welcome: welcome.ensure_id(),
        })
    }

    async fn destroy(&self, conversation: &ConversationId) -> Result<()> {
        let Some(group_id) = GroupTag::from_hex(conversation.as_str()) else {
            bail!("conversation id {conversation} is not a group id");
        };
        let mut client = self.client.lock().await;
        if !client.remove_group(&group_id.0)? {
            debug!(conversation_id = %conversation, "no group state to destroy");
            return Ok(());
        }
        self.persist(&client).await
    }
}

#[cfg(test)]
#[path = "tests/mls_protocol_tests.rs"]
mod tests;
