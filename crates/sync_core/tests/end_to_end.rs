mod common;

use std::{sync::Arc, time::Duration};

use common::{eventually, FakeRelay};
use nostr_sdk::Keys;
use shared::{
    domain::{ConversationId, PublicKey},
    store::{ConversationStore, KeyPackageStore},
};
use storage::Storage;
use sync_core::{
    EventSigner, KeysSigner, MlsGroupProtocol, SubscriptionState, SyncContext, SyncEngine, SyncNotification,
    SyncSettings, WsRelayTransport,
};
use tokio::{sync::broadcast, time::timeout};

struct Peer {
    engine: Arc<SyncEngine>,
    store: Arc<Storage>,
    identity: PublicKey,
}

async fn peer_with(keys: Keys, database_url: &str, relay: &FakeRelay) -> Peer {
    let signer = KeysSigner::new(keys);
    let identity = signer.public_key();
    let settings = SyncSettings {
        database_url: database_url.into(),
        relays: vec![relay.url.clone()],
        metadata_relays: vec![relay.url.clone()],
        ..SyncSettings::default()
    };
    let store = Arc::new(Storage::new(&settings.database_url).await.expect("storage"));
    let protocol = MlsGroupProtocol::open(identity.clone(), "relay-sync-test", store.clone())
        .await
        .expect("mls");
    let ctx = SyncContext::new(
        settings,
        Arc::new(WsRelayTransport::with_timeouts(Duration::from_secs(3), Duration::from_secs(3))),
        Arc::new(protocol),
        Arc::new(signer),
        store.clone(),
    );
    Peer {
        engine: SyncEngine::new(ctx),
        store,
        identity,
    }
}

async fn peer(relay: &FakeRelay) -> Peer {
    peer_with(Keys::generate(), "sqlite::memory:", relay).await
}

async fn wait_for_join(notifications: &mut broadcast::Receiver<SyncNotification>) -> ConversationId {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(SyncNotification::ConversationJoined { conversation_id }) = notifications.recv().await {
                return conversation_id;
            }
        }
    })
    .await
    .expect("joined in time")
}

async fn has_message(store: &Storage, id: &ConversationId, content: &str) -> bool {
    store
        .list_messages(id, 50)
        .await
        .map(|messages| messages.iter().any(|m| m.content == content))
        .unwrap_or(false)
}

async fn pool_replenished(store: &Storage) -> bool {
    let held = store.list_key_packages().await.map(|all| all.len()).unwrap_or(0);
    held == 4 && store.count_available_key_packages().await.unwrap_or(0) == 3
}

async fn is_live(engine: &SyncEngine, id: &ConversationId) -> bool {
    engine.subscription_state(id).await == SubscriptionState::Live
}

#[tokio::test]
async fn invited_peer_joins_and_both_sides_exchange_messages() {
    let relay = FakeRelay::start().await;
    let alice = peer(&relay).await;
    let bob = peer(&relay).await;
    let mut bob_notifications = bob.engine.subscribe_notifications();

    alice.engine.start().await.expect("alice start");
    bob.engine.start().await.expect("bob start");
    assert_eq!(bob.store.count_available_key_packages().await.expect("pool"), 3);

    let conversation = alice
        .engine
        .create_conversation("team", Some("weekly sync"), &[])
        .await
        .expect("create");
    alice
        .engine
        .invite_member(&conversation.id, &bob.identity)
        .await
        .expect("invite");

    let joined = wait_for_join(&mut bob_notifications).await;
    assert_eq!(joined, conversation.id);
    let bob_view = bob
        .store
        .get_conversation(&conversation.id)
        .await
        .expect("get")
        .expect("bob stored the conversation");
    assert_eq!(bob_view.name, "team");
    assert_eq!(bob_view.relays, vec![relay.url.clone()]);

    // Bob's consumed key package is replaced.
    assert!(eventually(Duration::from_secs(5), || pool_replenished(&bob.store)).await);
    assert!(eventually(Duration::from_secs(5), || is_live(&bob.engine, &conversation.id)).await);

    bob.engine
        .send_message(&conversation.id, "hi alice")
        .await
        .expect("bob sends");
    assert!(eventually(Duration::from_secs(10), || has_message(&alice.store, &conversation.id, "hi alice")).await);
    assert_eq!(alice.engine.unread_count(&conversation.id).await.expect("unread"), 1);

    alice
        .engine
        .send_message(&conversation.id, "hello bob")
        .await
        .expect("alice sends");
    assert!(eventually(Duration::from_secs(10), || has_message(&bob.store, &conversation.id, "hello bob")).await);

    // After a reconnect Alice resumes from her cursor and keeps receiving.
    assert!(alice.engine.reconnect().await.expect("reconnect"));
    assert!(eventually(Duration::from_secs(5), || is_live(&alice.engine, &conversation.id)).await);
    bob.engine
        .send_message(&conversation.id, "still there?")
        .await
        .expect("bob sends again");
    assert!(eventually(Duration::from_secs(10), || has_message(&alice.store, &conversation.id, "still there?")).await);

    let alice_messages = alice.store.list_messages(&conversation.id, 50).await.expect("messages");
    assert_eq!(
        alice_messages.iter().filter(|m| m.content == "hi alice").count(),
        1
    );
}

#[tokio::test]
async fn restarted_peer_catches_up_with_its_stored_group_state() {
    let relay = FakeRelay::start().await;
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("relay-sync-restart-{suffix}.db"));
    let bob_db = format!("sqlite://{}", path.display());
    let bob_keys = Keys::generate();

    let alice = peer(&relay).await;
    let bob = peer_with(bob_keys.clone(), &bob_db, &relay).await;
    let mut bob_notifications = bob.engine.subscribe_notifications();
    alice.engine.start().await.expect("alice start");
    bob.engine.start().await.expect("bob start");

    let conversation = alice
        .engine
        .create_conversation("ops", None, &[])
        .await
        .expect("create");
    alice
        .engine
        .invite_member(&conversation.id, &bob.identity)
        .await
        .expect("invite");
    assert_eq!(wait_for_join(&mut bob_notifications).await, conversation.id);
    assert!(eventually(Duration::from_secs(5), || is_live(&bob.engine, &conversation.id)).await);

    bob.engine.teardown().await;
    bob.store.pool().close().await;
    drop(bob);

    alice
        .engine
        .send_message(&conversation.id, "while you were away")
        .await
        .expect("alice sends");

    let bob = peer_with(bob_keys, &bob_db, &relay).await;
    bob.engine.start().await.expect("bob restarts");
    assert!(eventually(Duration::from_secs(10), || has_message(&bob.store, &conversation.id, "while you were away")).await);

    bob.engine
        .send_message(&conversation.id, "back again")
        .await
        .expect("bob sends after restart");
    assert!(eventually(Duration::from_secs(10), || has_message(&alice.store, &conversation.id, "back again")).await);

    bob.engine.teardown().await;
    bob.store.pool().close().await;
    let _ = std::fs::remove_file(path);
}
