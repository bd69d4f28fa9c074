//! Relay event synchronization and invite processing for encrypted group conversations.
//!
//! [`SyncEngine`] keeps one backfill plus live subscription per conversation, feeds
//! deduplicated batches to a [`GroupProtocol`], and runs the invite pipeline and key
//! package rotation for the local identity.

pub mod backfill;
pub mod config;
pub mod context;
pub mod cursor;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod invites;
pub mod key_packages;
pub mod live;
pub mod mls_protocol;
pub mod notifications;
pub mod protocol;
pub mod relay_ws;
pub mod signer;
pub mod transport;

pub use config::{load_settings, SyncSettings};
pub use context::SyncContext;
pub use cursor::SyncCursors;
pub use dedup::DedupTracker;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use invites::{InvitePassReport, InvitePipeline};
pub use key_packages::{CredentialRotation, RotationOutcome};
pub use mls_protocol::MlsGroupProtocol;
pub use notifications::{SubscriptionState, SyncNotification};
pub use protocol::{EventSigner, GroupProtocol, GroupUpdate};
pub use relay_ws::WsRelayTransport;
pub use signer::{verify_event, KeysSigner};
pub use transport::{PublishReport, RelaySubscription, RelayTransport, SubscriptionSignal};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
