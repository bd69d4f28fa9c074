use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{event::RelayEvent, store::SyncStore};
use tracing::warn;

use crate::{
    config::SyncSettings,
    error::SyncError,
    notifications::Notifier,
    protocol::{EventSigner, GroupProtocol},
    transport::RelayTransport,
};

/// Collaborators shared by every engine component.
#[derive(Clone)]
pub struct SyncContext {
    pub settings: Arc<SyncSettings>,
    pub transport: Arc<dyn RelayTransport>,
    pub protocol: Arc<dyn GroupProtocol>,
    pub signer: Arc<dyn EventSigner>,
    pub store: Arc<dyn SyncStore>,
    pub notifier: Notifier,
}

impl SyncContext {
    pub fn new(
        settings: SyncSettings,
        transport: Arc<dyn RelayTransport>,
        protocol: Arc<dyn GroupProtocol>,
        signer: Arc<dyn EventSigner>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            transport,
            protocol,
            signer,
            store,
            notifier: Notifier::new(256),
        }
    }

    /// Publishes and requires at least one relay to accept.
    pub async fn publish_accepted(&self, relays: &[String], event: &RelayEvent) -> Result<()> {
        let report = self
            .transport
            .publish(relays, event)
            .await
            .with_context(|| format!("failed to publish event {}", event.id))?;
        if report.is_accepted() {
            return Ok(());
        }
        warn!(event_id = %event.id, kind = event.kind.as_u16(), "no relay accepted event");
        Err(SyncError::PublishRejected {
            event_id: event.id.clone(),
            details: report.rejections(),
        }
        .into())
    }
}
