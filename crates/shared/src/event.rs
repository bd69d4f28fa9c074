use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{to_hex, EventId, GroupTag, PublicKey, Timestamp};

pub mod kinds {
    pub const CHAT_MESSAGE: u16 = 9;
    pub const KEY_PACKAGE: u16 = 443;
    pub const WELCOME: u16 = 444;
    pub const GROUP_MESSAGE: u16 = 445;
    pub const GIFT_WRAP: u16 = 1059;
    pub const KEY_PACKAGE_RELAYS: u16 = 10051;
}

/// Transport discriminator for relay events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum EventKind {
    ChatMessage,
    KeyPackage,
    Welcome,
    GroupMessage,
    GiftWrap,
    KeyPackageRelayList,
    Other(u16),
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        match self {
            EventKind::ChatMessage => kinds::CHAT_MESSAGE,
            EventKind::KeyPackage => kinds::KEY_PACKAGE,
            EventKind::Welcome => kinds::WELCOME,
            EventKind::GroupMessage => kinds::GROUP_MESSAGE,
            EventKind::GiftWrap => kinds::GIFT_WRAP,
            EventKind::KeyPackageRelayList => kinds::KEY_PACKAGE_RELAYS,
            EventKind::Other(kind) => kind,
        }
    }
}

impl From<u16> for EventKind {
    fn from(value: u16) -> Self {
        match value {
            kinds::CHAT_MESSAGE => EventKind::ChatMessage,
            kinds::KEY_PACKAGE => EventKind::KeyPackage,
            kinds::WELCOME => EventKind::Welcome,
            kinds::GROUP_MESSAGE => EventKind::GroupMessage,
            kinds::GIFT_WRAP => EventKind::GiftWrap,
            kinds::KEY_PACKAGE_RELAYS => EventKind::KeyPackageRelayList,
            other => EventKind::Other(other),
        }
    }
}

impl From<EventKind> for u16 {
    fn from(value: EventKind) -> Self {
        value.as_u16()
    }
}

fn tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().map(String::as_str) == Some(name))
        .and_then(|tag| tag.get(1))
        .map(String::as_str)
}

fn tag_values<'a>(tags: &'a [Vec<String>], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    tags.iter()
        .filter(move |tag| tag.first().map(String::as_str) == Some(name))
        .filter_map(|tag| tag.get(1))
        .map(String::as_str)
}

/// A signed event as delivered by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: EventKind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
    /// Relay the event was received from; never serialized.
    #[serde(skip)]
    pub relay: Option<String>,
}

impl RelayEvent {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        tag_values(&self.tags, name)
    }

    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }
}

/// An event that has not been signed. Rumors inside invite envelopes stay unsigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: EventKind,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(pubkey: PublicKey, kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            id: None,
            pubkey,
            created_at: Timestamp::now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        tag_values(&self.tags, name)
    }

    /// Content hash over the canonical `[0, pubkey, created_at, kind, tags, content]` array.
    pub fn compute_id(&self) -> EventId {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind.as_u16(),
            self.tags,
            self.content,
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        EventId(to_hex(&digest))
    }

    pub fn ensure_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(self.compute_id());
        }
        self
    }

    pub fn into_signed(self, sig: impl Into<String>) -> RelayEvent {
        let id = self.id.clone().unwrap_or_else(|| self.compute_id());
        RelayEvent {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
            relay: None,
        }
    }
}

/// Relay query filter. Serializes to the relay wire shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<EventKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<PublicKey>,
    #[serde(rename = "#h", default, skip_serializing_if = "Vec::is_empty")]
    pub group_tags: Vec<String>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.push(author);
        self
    }

    pub fn group_tag(mut self, tag: &GroupTag) -> Self {
        self.group_tags.push(tag.to_hex());
        self
    }

    pub fn recipient(mut self, recipient: &PublicKey) -> Self {
        self.recipients.push(recipient.0.clone());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.group_tags.is_empty()
            && !event
                .tag_values("h")
                .any(|value| self.group_tags.iter().any(|tag| tag == value))
        {
            return false;
        }
        if !self.recipients.is_empty()
            && !event
                .tag_values("p")
                .any(|value| self.recipients.iter().any(|p| p == value))
        {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/event_tests.rs"]
mod tests;
