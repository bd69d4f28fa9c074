use shared::domain::{ConversationId, EventId, PublicKey};
use thiserror::Error;

/// Failures surfaced to foreground callers. Background tasks log these instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("no key package advertised by {0}")]
    MissingKeyPackage(PublicKey),
    #[error("no relay accepted event {event_id}: {details}")]
    PublishRejected { event_id: EventId, details: String },
    #[error("cannot remove yourself from {0}; leave the conversation instead")]
    RemoveSelf(ConversationId),
    #[error("sync engine has not been started")]
    NotStarted,
    #[error("invalid relay url '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },
}
