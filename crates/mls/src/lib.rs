use std::collections::HashMap;

use anyhow::{anyhow, Result};
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::OpenMlsRustCrypto;
use openmls_traits::OpenMlsProvider;
use serde::{Deserialize, Serialize};
use tls_codec::{Deserialize as TlsDeserializeTrait, Serialize as TlsSerializeTrait};

const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Private group context extension carrying application-defined conversation metadata.
pub const METADATA_EXTENSION_ID: u16 = 0xF2EE;

const SNAPSHOT_VERSION: u16 = 1;

/// A basic credential and the signature key pair behind it.
#[derive(Debug, Serialize, Deserialize)]
pub struct MlsIdentity {
    name: Vec<u8>,
    signer: SignatureKeyPair,
}

impl MlsIdentity {
    pub fn new_with_name(name: impl Into<Vec<u8>>) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            signer: SignatureKeyPair::new(SignatureScheme::ED25519)?,
        })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn credential_with_key(&self) -> CredentialWithKey {
        CredentialWithKey {
            credential: BasicCredential::new(self.name.clone()).into(),
            signature_key: self.signer.to_public_vec().into(),
        }
    }
}

/// Serialized key package plus its hash reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKeyPackage {
    pub reference: Vec<u8>,
    pub key_package_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMemberOutput {
    pub commit_bytes: Vec<u8>,
    pub welcome_bytes: Vec<u8>,
}

/// Outcome of processing one inbound protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedMessage {
    Application(Vec<u8>),
    Proposal,
    Commit,
}

#[derive(Serialize, Deserialize)]
struct ClientSnapshot {
    version: u16,
    groups: Vec<Vec<u8>>,
    values: Vec<(Vec<u8>, Vec<u8>)>,
}

/// All MLS groups held by one local identity.
///
/// Key package private material lives in the provider, so joins must go through the
/// same client that generated the consumed key package, or one restored from its
/// [`export_state`](Self::export_state).
pub struct MlsClient {
    provider: OpenMlsRustCrypto,
    identity: MlsIdentity,
    groups: HashMap<Vec<u8>, MlsGroup>,
}

impl MlsClient {
    pub fn new(identity: MlsIdentity) -> Self {
        Self {
            provider: OpenMlsRustCrypto::default(),
            identity,
            groups: HashMap::new(),
        }
    }

    /// Rebuilds a client from `identity` and a snapshot taken by [`export_state`](Self::export_state).
    pub fn restore(identity: MlsIdentity, state: &[u8]) -> Result<Self> {
        let snapshot: ClientSnapshot = serde_json::from_slice(state)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(anyhow!("unsupported MLS state version {}", snapshot.version));
        }
        let provider = OpenMlsRustCrypto::default();
        provider
            .storage()
            .values
            .write()
            .map_err(|_| anyhow!("MLS storage lock poisoned"))?
            .extend(snapshot.values);

        let mut groups = HashMap::new();
        for group_id in snapshot.groups {
            let loaded = MlsGroup::load(provider.storage(), &GroupId::from_slice(&group_id))
                .map_err(|e| anyhow!("failed to load group state: {e:?}"))?;
            if let Some(group) = loaded {
                groups.insert(group_id, group);
            }
        }
        Ok(Self {
            provider,
            identity,
            groups,
        })
    }

    /// Provider key-value contents plus the ids of every loaded group.
    pub fn export_state(&self) -> Result<Vec<u8>> {
        let values = self
            .provider
            .storage()
            .values
            .read()
            .map_err(|_| anyhow!("MLS storage lock poisoned"))?
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let snapshot = ClientSnapshot {
            version: SNAPSHOT_VERSION,
            groups: self.groups.keys().cloned().collect(),
            values,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    pub fn identity(&self) -> &MlsIdentity {
        &self.identity
    }

    fn capabilities() -> Capabilities {
        Capabilities::new(
            None,
            None,
            Some(&[ExtensionType::Unknown(METADATA_EXTENSION_ID)]),
            None,
            None,
        )
    }

    fn metadata_extensions(metadata: &[u8]) -> Result<Extensions<GroupContext>> {
        Ok(Extensions::from_vec(vec![
            Extension::RequiredCapabilities(RequiredCapabilitiesExtension::new(
                &[ExtensionType::Unknown(METADATA_EXTENSION_ID)],
                &[],
                &[],
            )),
            Extension::Unknown(METADATA_EXTENSION_ID, UnknownExtension(metadata.to_vec())),
        ])?)
    }

    pub fn generate_key_package(&self) -> Result<GeneratedKeyPackage> {
        let bundle = KeyPackage::builder()
            .leaf_node_capabilities(Self::capabilities())
            .build(
                CIPHERSUITE,
                &self.provider,
                &self.identity.signer,
                self.identity.credential_with_key(),
            )?;
        let key_package = bundle.key_package();
        let reference = key_package
            .hash_ref(self.provider.crypto())
            .map_err(|e| anyhow!("failed to hash key package: {e:?}"))?;
        Ok(GeneratedKeyPackage {
            reference: reference.as_slice().to_vec(),
            key_package_bytes: key_package.tls_serialize_detached()?,
        })
    }

    pub fn has_group(&self, group_id: &[u8]) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Creates a group whose context carries `metadata`.
    pub fn create_group(&mut self, metadata: &[u8]) -> Result<Vec<u8>> {
        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .capabilities(Self::capabilities())
            .with_group_context_extensions(Self::metadata_extensions(metadata)?)
            .build();
        let group = MlsGroup::new(
            &self.provider,
            &self.identity.signer,
            &config,
            self.identity.credential_with_key(),
        )?;
        let group_id = group.group_id().as_slice().to_vec();
        self.groups.insert(group_id.clone(), group);
        Ok(group_id)
    }

    pub fn join_from_welcome(&mut self, welcome_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut bytes = welcome_bytes;
        let message_in = MlsMessageIn::tls_deserialize(&mut bytes)?;
        let welcome = match message_in.extract() {
            MlsMessageBodyIn::Welcome(welcome) => welcome,
            _ => return Err(anyhow!("invite material did not contain an MLS welcome")),
        };
        let config = MlsGroupJoinConfig::builder()
            .use_ratchet_tree_extension(true)
            .build();
        let staged = StagedWelcome::new_from_welcome(&self.provider, &config, welcome, None)?;
        let group = staged.into_group(&self.provider)?;
        let group_id = group.group_id().as_slice().to_vec();
        self.groups.insert(group_id.clone(), group);
        Ok(group_id)
    }

    pub fn add_member(&mut self, group_id: &[u8], key_package_bytes: &[u8]) -> Result<AddMemberOutput> {
        let mut bytes = key_package_bytes;
        let key_package_in = <KeyPackageIn as TlsDeserializeTrait>::tls_deserialize(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(anyhow!("key package bytes had trailing data"));
        }
        let key_package = key_package_in
            .validate(self.provider.crypto(), ProtocolVersion::default())
            .map_err(|e| anyhow!("invalid key package bytes: {e}"))?;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group not initialized"))?;
        let (commit, welcome, _group_info) =
            group.add_members(&self.provider, &self.identity.signer, &[key_package])?;
        let output = AddMemberOutput {
            commit_bytes: commit.tls_serialize_detached()?,
            welcome_bytes: welcome.tls_serialize_detached()?,
        };
        group.merge_pending_commit(&self.provider)?;
        Ok(output)
    }

    /// Commit removing the member whose basic credential identity is `member`.
    pub fn remove_member(&mut self, group_id: &[u8], member: &[u8]) -> Result<Vec<u8>> {
        self.commit_changes(group_id, &[member.to_vec()], None)
    }

    /// Commit replacing the metadata extension in the group context.
    pub fn update_metadata(&mut self, group_id: &[u8], metadata: &[u8]) -> Result<Vec<u8>> {
        self.commit_changes(group_id, &[], Some(metadata))
    }

    /// One commit carrying every removal plus an optional metadata replacement, by value.
    pub fn commit_changes(
        &mut self,
        group_id: &[u8],
        remove: &[Vec<u8>],
        metadata: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if remove.iter().any(|member| member == &self.identity.name) {
            return Err(anyhow!("cannot remove the local member"));
        }
        let extensions = metadata.map(Self::metadata_extensions).transpose()?;
        let provider = &self.provider;
        let signer = &self.identity.signer;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group not initialized"))?;

        let mut leaves = Vec::with_capacity(remove.len());
        for member in remove {
            let leaf = group
                .members()
                .find(|m| m.credential.serialized_content() == member.as_slice())
                .map(|m| m.index)
                .ok_or_else(|| anyhow!("not a member of the group"))?;
            leaves.push(leaf);
        }

        let mut builder = group.commit_builder().propose_removals(leaves);
        if let Some(extensions) = extensions {
            builder = builder.propose_group_context_extensions(extensions)?;
        }
        let bundle = builder
            .load_psks(provider.storage())?
            .build(provider.rand(), provider.crypto(), signer, |_| true)?
            .stage_commit(provider)?;
        let commit_bytes = bundle.commit().tls_serialize_detached()?;
        group.merge_pending_commit(provider)?;
        Ok(commit_bytes)
    }

    pub fn metadata(&self, group_id: &[u8]) -> Option<Vec<u8>> {
        self.groups
            .get(group_id)?
            .extensions()
            .unknown(METADATA_EXTENSION_ID)
            .map(|extension| extension.0.clone())
    }

    /// Basic credential identities of every current member.
    pub fn members(&self, group_id: &[u8]) -> Vec<Vec<u8>> {
        self.groups
            .get(group_id)
            .map(|group| {
                group
                    .members()
                    .map(|m| m.credential.serialized_content().to_vec())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Empty commit that rotates the local leaf key.
    pub fn self_update(&mut self, group_id: &[u8]) -> Result<Vec<u8>> {
        let provider = &self.provider;
        let signer = &self.identity.signer;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group not initialized"))?;
        let bundle = group.self_update(provider, signer, LeafNodeParameters::default())?;
        let commit_bytes = bundle.commit().tls_serialize_detached()?;
        group.merge_pending_commit(provider)?;
        Ok(commit_bytes)
    }

    pub fn encrypt_application(&mut self, group_id: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let provider = &self.provider;
        let signer = &self.identity.signer;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group not initialized"))?;
        let message = group.create_message(provider, signer, plaintext)?;
        Ok(message.tls_serialize_detached()?)
    }

    pub fn process_message(&mut self, group_id: &[u8], message_bytes: &[u8]) -> Result<ProcessedMessage> {
        let mut bytes = message_bytes;
        let message_in = MlsMessageIn::tls_deserialize(&mut bytes)?;
        let protocol_message: ProtocolMessage = message_in
            .try_into_protocol_message()
            .map_err(|_| anyhow!("payload did not contain a protocol message"))?;
        let provider = &self.provider;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group not initialized"))?;
        let processed = group.process_message(provider, protocol_message)?;

        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app_msg) => {
                Ok(ProcessedMessage::Application(app_msg.into_bytes()))
            }
            ProcessedMessageContent::ProposalMessage(proposal) => {
                group.store_pending_proposal(provider.storage(), *proposal)?;
                Ok(ProcessedMessage::Proposal)
            }
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                group.merge_staged_commit(provider, *staged_commit)?;
                Ok(ProcessedMessage::Commit)
            }
            _ => Ok(ProcessedMessage::Proposal),
        }
    }

    /// Drops the group and erases its state from the provider.
    pub fn remove_group(&mut self, group_id: &[u8]) -> Result<bool> {
        let Some(mut group) = self.groups.remove(group_id) else {
            return Ok(false);
        };
        group
            .delete(self.provider.storage())
            .map_err(|e| anyhow!("failed to delete group state: {e:?}"))?;
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
