#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::event::{Filter, RelayEvent};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

type Outbound = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Clone)]
struct RelayState {
    events: Arc<Mutex<Vec<RelayEvent>>>,
    live: broadcast::Sender<RelayEvent>,
}

/// In-process relay: stores every accepted event, answers REQ with stored matches
/// followed by EOSE, then keeps forwarding new matches until CLOSE.
/// Events whose content is `reject` are refused.
pub struct FakeRelay {
    pub url: String,
    state: RelayState,
    server: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let (live, _) = broadcast::channel(1024);
        let state = RelayState {
            events: Arc::new(Mutex::new(Vec::new())),
            live,
        };
        let app = Router::new()
            .route("/", get(upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("ws://{addr}"),
            state,
            server,
        }
    }

    pub async fn events(&self) -> Vec<RelayEvent> {
        self.state.events.lock().await.clone()
    }

    /// Stores and broadcasts `event` as if a client had published it.
    pub async fn inject(&self, event: RelayEvent) {
        self.state.events.lock().await.push(event.clone());
        let _ = self.state.live.send(event);
    }

    pub fn live_listeners(&self) -> usize {
        self.state.live.receiver_count()
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(state, socket))
}

async fn send(outbound: &Outbound, frame: Value) -> bool {
    outbound
        .lock()
        .await
        .send(Message::Text(frame.to_string()))
        .await
        .is_ok()
}

async fn connection(state: RelayState, socket: WebSocket) {
    let (sender, mut receiver) = socket.split();
    let outbound: Outbound = Arc::new(Mutex::new(sender));
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(&text) else {
            send(&outbound, json!(["NOTICE", "could not parse frame"])).await;
            continue;
        };
        match frame.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Some(event) = frame
                    .get(1)
                    .cloned()
                    .and_then(|raw| serde_json::from_value::<RelayEvent>(raw).ok())
                else {
                    send(&outbound, json!(["NOTICE", "invalid event"])).await;
                    continue;
                };
                let accepted = event.content != "reject";
                if accepted {
                    state.events.lock().await.push(event.clone());
                    let _ = state.live.send(event.clone());
                }
                let reason = if accepted { "" } else { "blocked: rejected" };
                send(&outbound, json!(["OK", event.id, accepted, reason])).await;
            }
            Some("REQ") => {
                let Some(subscription) = frame.get(1).and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                let filters: Vec<Filter> = frame[2..]
                    .iter()
                    .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                    .collect();
                let mut live = state.live.subscribe();
                let stored: Vec<RelayEvent> = state
                    .events
                    .lock()
                    .await
                    .iter()
                    .filter(|event| filters.iter().any(|f| f.matches(event)))
                    .cloned()
                    .collect();
                for event in stored {
                    send(&outbound, json!(["EVENT", subscription, event])).await;
                }
                send(&outbound, json!(["EOSE", subscription])).await;

                let forward_to = Arc::clone(&outbound);
                let sub = subscription.clone();
                let forwarder = tokio::spawn(async move {
                    while let Ok(event) = live.recv().await {
                        if filters.iter().any(|f| f.matches(&event))
                            && !send(&forward_to, json!(["EVENT", sub, event])).await
                        {
                            break;
                        }
                    }
                });
                if let Some(previous) = forwarders.insert(subscription, forwarder) {
                    previous.abort();
                }
            }
            Some("CLOSE") => {
                if let Some(forwarder) = frame
                    .get(1)
                    .and_then(Value::as_str)
                    .and_then(|sub| forwarders.remove(sub))
                {
                    forwarder.abort();
                }
            }
            _ => {
                send(&outbound, json!(["NOTICE", "unsupported message"])).await;
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
}

/// Polls `check` every 20ms until it holds, for at most `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
