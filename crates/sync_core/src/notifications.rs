use shared::domain::ConversationId;
use tokio::sync::broadcast;

/// Lifecycle of one conversation's subscription pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Backfilling,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    ConversationsChanged,
    ConversationJoined {
        conversation_id: ConversationId,
    },
    MessageReceived {
        conversation_id: ConversationId,
        message_id: String,
    },
    InvitesProcessed {
        joined: usize,
        failed: usize,
    },
    SubscriptionStateChanged {
        conversation_id: ConversationId,
        state: SubscriptionState,
    },
    Reconnected,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: SyncNotification) {
        let _ = self.tx.send(notification);
    }
}
