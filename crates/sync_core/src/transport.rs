use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::PublicKey,
    event::{EventKind, Filter, RelayEvent},
};
use tokio::sync::mpsc;

/// One relay's answer to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAck {
    pub relay: String,
    pub accepted: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub acks: Vec<RelayAck>,
}

impl PublishReport {
    pub fn accepted(&self) -> usize {
        self.acks.iter().filter(|ack| ack.accepted).count()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted() > 0
    }

    /// `relay: message` pairs for every rejection, for error reporting.
    pub fn rejections(&self) -> String {
        self.acks
            .iter()
            .filter(|ack| !ack.accepted)
            .map(|ack| format!("{}: {}", ack.relay, ack.message.as_deref().unwrap_or("rejected")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSignal {
    Event(RelayEvent),
    Error(String),
    Complete,
}

/// Consumer end of a standing subscription. Dropping it closes the subscription.
#[derive(Debug)]
pub struct RelaySubscription {
    id: String,
    signals: mpsc::UnboundedReceiver<SubscriptionSignal>,
}

/// Producer end held by the transport.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    tx: mpsc::UnboundedSender<SubscriptionSignal>,
}

impl RelaySubscription {
    pub fn channel(id: impl Into<String>) -> (SubscriptionFeed, RelaySubscription) {
        let (tx, signals) = mpsc::unbounded_channel();
        (
            SubscriptionFeed { tx },
            RelaySubscription {
                id: id.into(),
                signals,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<SubscriptionSignal> {
        self.signals.recv().await
    }

    pub fn close(self) {}
}

impl SubscriptionFeed {
    /// Returns `false` when the consumer has closed the subscription.
    pub fn send(&self, signal: SubscriptionSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// The relay network as seen by the engine.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, relays: &[String], event: &RelayEvent) -> Result<PublishReport>;

    /// One-shot historical query, finished once every relay reports end of stored events.
    async fn request(&self, relays: &[String], filters: &[Filter]) -> Result<Vec<RelayEvent>>;

    async fn subscribe(&self, relays: &[String], filters: &[Filter]) -> Result<RelaySubscription>;

    /// Relays listed in the identity's newest key package relay list, empty when none is found.
    async fn resolve_inbox_relays(
        &self,
        identity: &PublicKey,
        lookup_relays: &[String],
    ) -> Result<Vec<String>> {
        let filter = Filter::new()
            .kind(EventKind::KeyPackageRelayList)
            .author(identity.clone())
            .limit(1);
        let events = self.request(lookup_relays, &[filter]).await?;
        let newest = events.into_iter().max_by_key(|event| event.created_at);
        Ok(newest
            .map(|event| event.tag_values("relay").map(str::to_string).collect())
            .unwrap_or_default())
    }
}
