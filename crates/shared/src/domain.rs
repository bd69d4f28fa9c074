use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(EventId);
id_newtype!(PublicKey);

/// Seconds since the unix epoch, as carried in relay events.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp().max(0) as u64)
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    pub fn saturating_sub_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level group tag. Relays filter group messages on its hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupTag(pub Vec<u8>);

impl GroupTag {
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        from_hex(value).map(Self)
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn from_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    value
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender: PublicKey,
    pub content: String,
    pub created_at: Timestamp,
    pub kind: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub group_tag: GroupTag,
    pub relays: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub members: Vec<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<StoredMessage>,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: Timestamp,
}

impl Conversation {
    pub fn new(id: ConversationId, group_tag: GroupTag, relays: Vec<String>, name: String) -> Self {
        Self {
            id,
            group_tag,
            relays,
            name,
            description: None,
            members: Vec::new(),
            last_message: None,
            message_count: 0,
            created_at: Timestamp::now(),
        }
    }

    /// Relays to use for this conversation, falling back to `defaults` when none are recorded.
    pub fn relays_or<'a>(&'a self, defaults: &'a [String]) -> &'a [String] {
        if self.relays.is_empty() {
            defaults
        } else {
            &self.relays
        }
    }
}

/// A locally held one-time join credential and its signed advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackageRecord {
    pub id: String,
    pub advertisement: crate::event::RelayEvent,
    pub published: bool,
    pub consumed: bool,
    pub created_at: Timestamp,
}

/// A decrypted invite awaiting a join attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadInvite {
    pub envelope_id: EventId,
    pub rumor: crate::event::UnsignedEvent,
}
