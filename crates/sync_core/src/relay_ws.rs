use std::{collections::HashSet, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use futures::{future::join_all, SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::event::{Filter, RelayEvent};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    signer::verify_event,
    transport::{PublishReport, RelayAck, RelaySubscription, RelayTransport, SubscriptionFeed, SubscriptionSignal},
};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to {relay}: {reason}")]
    Connect { relay: String, reason: String },
    #[error("relay {relay} sent an invalid message: {reason}")]
    Protocol { relay: String, reason: String },
    #[error("relay {relay} closed the connection")]
    Closed { relay: String },
    #[error("relay {relay} timed out")]
    Timeout { relay: String },
}

/// Messages a relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event { subscription: String, event: RelayEvent },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { subscription: String },
    Closed { subscription: String, message: String },
    Notice { message: String },
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let parts = value.as_array().ok_or("relay message is not an array")?;
        let label = parts.first().and_then(Value::as_str).ok_or("missing message label")?;
        let text_at = |index: usize| -> Result<String, String> {
            parts
                .get(index)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("{label} missing field {index}"))
        };
        match label {
            "EVENT" => {
                let event = parts
                    .get(2)
                    .cloned()
                    .ok_or("EVENT missing payload")
                    .and_then(|raw| serde_json::from_value(raw).map_err(|_| "EVENT payload invalid"))?;
                Ok(Self::Event {
                    subscription: text_at(1)?,
                    event,
                })
            }
            "OK" => Ok(Self::Ok {
                event_id: text_at(1)?,
                accepted: parts.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text_at(3).unwrap_or_default(),
            }),
            "EOSE" => Ok(Self::Eose {
                subscription: text_at(1)?,
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription: text_at(1)?,
                message: text_at(2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice {
                message: text_at(1).unwrap_or_default(),
            }),
            other => Err(format!("unknown message label {other}")),
        }
    }
}

fn req_message(subscription: &str, filters: &[Filter]) -> String {
    let mut frame = vec![json!("REQ"), json!(subscription)];
    frame.extend(filters.iter().map(|filter| json!(filter)));
    Value::Array(frame).to_string()
}

fn close_message(subscription: &str) -> String {
    json!(["CLOSE", subscription]).to_string()
}

fn event_message(event: &RelayEvent) -> String {
    json!(["EVENT", event]).to_string()
}

async fn connect(relay: &str) -> Result<RelaySocket, RelayError> {
    let (socket, _) = connect_async(relay).await.map_err(|err| RelayError::Connect {
        relay: relay.to_string(),
        reason: err.to_string(),
    })?;
    Ok(socket)
}

async fn send_text(socket: &mut RelaySocket, relay: &str, text: String) -> Result<(), RelayError> {
    socket.send(Message::Text(text)).await.map_err(|_| RelayError::Closed {
        relay: relay.to_string(),
    })
}

/// Next parsed relay message, skipping frames that are not text.
async fn next_message(socket: &mut RelaySocket, relay: &str) -> Result<RelayMessage, RelayError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return RelayMessage::parse(&text).map_err(|reason| RelayError::Protocol {
                    relay: relay.to_string(),
                    reason,
                })
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::Closed {
                    relay: relay.to_string(),
                })
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) => {
                return Err(RelayError::Closed {
                    relay: relay.to_string(),
                })
            }
        }
    }
}

/// Drops events whose id or signature does not check out, so they never reach deduplication.
fn verified(relay: &str, event: RelayEvent) -> Option<RelayEvent> {
    match verify_event(&event) {
        Ok(()) => Some(event.with_relay(relay)),
        Err(err) => {
            warn!(relay, event_id = %event.id, error = %err, "dropping unverifiable event");
            None
        }
    }
}

/// Relay transport speaking the relay JSON protocol over one WebSocket per relay and call.
#[derive(Debug, Clone)]
pub struct WsRelayTransport {
    request_timeout: Duration,
    publish_timeout: Duration,
}

impl Default for WsRelayTransport {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl WsRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(request_timeout: Duration, publish_timeout: Duration) -> Self {
        Self {
            request_timeout,
            publish_timeout,
        }
    }

    async fn publish_one(&self, relay: &str, event: &RelayEvent) -> RelayAck {
        let attempt = async {
            let mut socket = connect(relay).await?;
            send_text(&mut socket, relay, event_message(event)).await?;
            loop {
                match next_message(&mut socket, relay).await? {
                    RelayMessage::Ok {
                        event_id,
                        accepted,
                        message,
                    } if event_id == event.id.as_str() => {
                        let _ = socket.close(None).await;
                        return Ok::<_, RelayError>((accepted, message));
                    }
                    RelayMessage::Notice { message } => debug!(relay, %message, "relay notice"),
                    _ => {}
                }
            }
        };
        let (accepted, message) = match timeout(self.publish_timeout, attempt).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => (false, err.to_string()),
            Err(_) => (
                false,
                RelayError::Timeout {
                    relay: relay.to_string(),
                }
                .to_string(),
            ),
        };
        RelayAck {
            relay: relay.to_string(),
            accepted,
            message: (!message.is_empty()).then_some(message),
        }
    }

    async fn request_one(&self, relay: &str, filters: &[Filter]) -> Result<Vec<RelayEvent>, RelayError> {
        let subscription = Uuid::new_v4().to_string();
        let attempt = async {
            let mut socket = connect(relay).await?;
            send_text(&mut socket, relay, req_message(&subscription, filters)).await?;
            let mut events = Vec::new();
            loop {
                match next_message(&mut socket, relay).await? {
                    RelayMessage::Event {
                        subscription: sub,
                        event,
                    } if sub == subscription => events.extend(verified(relay, event)),
                    RelayMessage::Eose { subscription: sub } if sub == subscription => break,
                    RelayMessage::Closed {
                        subscription: sub,
                        message,
                    } if sub == subscription => {
                        debug!(relay, %message, "relay closed request");
                        break;
                    }
                    RelayMessage::Notice { message } => debug!(relay, %message, "relay notice"),
                    _ => {}
                }
            }
            let _ = send_text(&mut socket, relay, close_message(&subscription)).await;
            let _ = socket.close(None).await;
            Ok::<_, RelayError>(events)
        };
        timeout(self.request_timeout, attempt)
            .await
            .map_err(|_| RelayError::Timeout {
                relay: relay.to_string(),
            })?
    }
}

#[async_trait]
impl RelayTransport for WsRelayTransport {
    async fn publish(&self, relays: &[String], event: &RelayEvent) -> Result<PublishReport> {
        let acks = join_all(relays.iter().map(|relay| self.publish_one(relay, event))).await;
        for ack in acks.iter().filter(|ack| !ack.accepted) {
            debug!(relay = %ack.relay, event_id = %event.id, message = ?ack.message, "publish not accepted");
        }
        Ok(PublishReport { acks })
    }

    async fn request(&self, relays: &[String], filters: &[Filter]) -> Result<Vec<RelayEvent>> {
        let results = join_all(relays.iter().map(|relay| self.request_one(relay, filters))).await;
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(batch) => events.extend(batch.into_iter().filter(|event| seen.insert(event.id.clone()))),
                Err(err) => {
                    warn!(error = %err, "relay request failed");
                    failures.push(err.to_string());
                }
            }
        }
        if !relays.is_empty() && failures.len() == relays.len() {
            anyhow::bail!("every relay failed: {}", failures.join("; "));
        }
        Ok(events)
    }

    async fn subscribe(&self, relays: &[String], filters: &[Filter]) -> Result<RelaySubscription> {
        let subscription_id = Uuid::new_v4().to_string();
        let (feed, subscription) = RelaySubscription::channel(subscription_id.clone());
        let workers: Vec<_> = relays
            .iter()
            .map(|relay| {
                tokio::spawn(stream_relay(
                    relay.clone(),
                    subscription_id.clone(),
                    filters.to_vec(),
                    feed.clone(),
                ))
            })
            .collect();
        tokio::spawn(async move {
            join_all(workers).await;
            feed.send(SubscriptionSignal::Complete);
        });
        Ok(subscription)
    }
}

/// Forwards one relay's verified events until the consumer closes or the relay goes away.
/// Repeats are passed through; the consumer's dedup tracker drops them.
async fn stream_relay(relay: String, subscription: String, filters: Vec<Filter>, feed: SubscriptionFeed) {
    let mut socket = match connect(&relay).await {
        Ok(socket) => socket,
        Err(err) => {
            feed.send(SubscriptionSignal::Error(err.to_string()));
            return;
        }
    };
    if let Err(err) = send_text(&mut socket, &relay, req_message(&subscription, &filters)).await {
        feed.send(SubscriptionSignal::Error(err.to_string()));
        return;
    }

    loop {
        tokio::select! {
            _ = feed.closed() => {
                let _ = send_text(&mut socket, &relay, close_message(&subscription)).await;
                let _ = socket.close(None).await;
                return;
            }
            message = next_message(&mut socket, &relay) => match message {
                Ok(RelayMessage::Event { subscription: sub, event }) if sub == subscription => {
                    if let Some(event) = verified(&relay, event) {
                        if !feed.send(SubscriptionSignal::Event(event)) {
                            return;
                        }
                    }
                }
                Ok(RelayMessage::Eose { .. }) => debug!(%relay, "caught up with stored events"),
                Ok(RelayMessage::Closed { subscription: sub, message }) if sub == subscription => {
                    feed.send(SubscriptionSignal::Error(format!("{relay} closed subscription: {message}")));
                    return;
                }
                Ok(RelayMessage::Notice { message }) => {
                    feed.send(SubscriptionSignal::Error(format!("{relay} notice: {message}")));
                }
                Ok(_) => {}
                Err(err @ RelayError::Protocol { .. }) => {
                    feed.send(SubscriptionSignal::Error(err.to_string()));
                }
                Err(err) => {
                    feed.send(SubscriptionSignal::Error(err.to_string()));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/relay_ws_tests.rs"]
mod tests;
