use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nostr_sdk::{
    nips::nip59::UnwrappedGift, Event, EventBuilder, JsonUtil, Keys, PublicKey as NostrPublicKey,
    Tag, UnsignedEvent as NostrUnsignedEvent,
};
use shared::{
    domain::PublicKey,
    event::{RelayEvent, UnsignedEvent},
};

use crate::protocol::EventSigner;

fn to_nostr_event(event: &RelayEvent) -> Result<Event> {
    Event::from_json(serde_json::to_vec(event)?).with_context(|| format!("event {} is malformed", event.id))
}

fn from_nostr_event(event: &Event) -> Result<RelayEvent> {
    Ok(serde_json::from_str(&event.try_as_json()?)?)
}

fn to_nostr_rumor(rumor: &UnsignedEvent) -> Result<NostrUnsignedEvent> {
    NostrUnsignedEvent::from_json(serde_json::to_vec(rumor)?).context("rumor is malformed")
}

fn from_nostr_rumor(rumor: &NostrUnsignedEvent) -> Result<UnsignedEvent> {
    Ok(serde_json::from_str(&rumor.try_as_json()?)?)
}

/// Checks that the event id hashes the event body and that `sig` is the author's
/// signature over it. Events that fail must never reach deduplication, or a forged
/// copy carrying a real id would hide the genuine event.
pub fn verify_event(event: &RelayEvent) -> Result<()> {
    to_nostr_event(event)?
        .verify()
        .with_context(|| format!("event {} failed verification", event.id))
}

/// [`EventSigner`] backed by a local secp256k1 key. Invite envelopes are NIP-59 gift wraps.
pub struct KeysSigner {
    keys: Keys,
    identity: PublicKey,
}

impl KeysSigner {
    pub fn new(keys: Keys) -> Self {
        let identity = PublicKey::new(keys.public_key().to_hex());
        Self { keys, identity }
    }

    pub fn generate() -> Self {
        Self::new(Keys::generate())
    }

    /// Accepts a hex or bech32 secret key.
    pub fn parse(secret_key: &str) -> Result<Self> {
        Ok(Self::new(Keys::parse(secret_key).context("invalid secret key")?))
    }
}

#[async_trait]
impl EventSigner for KeysSigner {
    fn public_key(&self) -> PublicKey {
        self.identity.clone()
    }

    async fn sign(&self, event: UnsignedEvent) -> Result<RelayEvent> {
        if event.pubkey != self.identity {
            bail!("event authored by {} cannot be signed by {}", event.pubkey, self.identity);
        }
        let signed = to_nostr_rumor(&event)?
            .sign_with_keys(&self.keys)
            .context("failed to sign event")?;
        from_nostr_event(&signed)
    }

    async fn open_envelope(&self, envelope: &RelayEvent) -> Result<UnsignedEvent> {
        let wrap = to_nostr_event(envelope)?;
        let gift = UnwrappedGift::from_gift_wrap(&self.keys, &wrap)
            .await
            .with_context(|| format!("cannot open envelope {}", envelope.id))?;
        from_nostr_rumor(&gift.rumor)
    }

    async fn seal_envelope(&self, recipient: &PublicKey, rumor: UnsignedEvent) -> Result<RelayEvent> {
        let receiver = NostrPublicKey::parse(recipient.as_str())
            .with_context(|| format!("invalid recipient key {recipient}"))?;
        let rumor = to_nostr_rumor(&rumor)?;
        let wrap = EventBuilder::gift_wrap(&self.keys, &receiver, rumor, Vec::<Tag>::new())
            .await
            .context("failed to seal envelope")?;
        from_nostr_event(&wrap)
    }
}

#[cfg(test)]
#[path = "tests/signer_tests.rs"]
mod tests;
