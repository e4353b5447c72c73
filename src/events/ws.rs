// Subscription WebSocket sessions
// Connection lifecycle, throttled event delivery and health commands

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::model::resource::{Health, ResourceType};
use crate::model::tai::Tai;
use crate::model::{make_id, NodeModel};

use super::{
    get_grain_timestamp, grain_data, grain_data_mut, make_grain, make_resource_events,
    set_grain_timestamp,
};

/// The open WebSocket connections, keyed by the id of the grain buffering
/// each connection's events.
#[derive(Default)]
pub struct QueryWsConnections {
    connections: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl QueryWsConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(QueryWsConnections::default())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop a connection's sender, which closes its socket.
    pub fn close(&self, grain_id: &str) {
        self.connections.remove(grain_id);
    }

    /// Attach an outgoing channel for the connection owning `grain_id`.
    pub(crate) fn attach(&self, grain_id: String, tx: mpsc::UnboundedSender<String>) {
        self.connections.insert(grain_id, tx);
    }
}

// Incoming WebSocket commands

#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
enum ClientCommand {
    #[serde(rename = "health")]
    Health { timestamp: Option<String> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "message_type")]
enum ServerMessage {
    #[serde(rename = "health")]
    Health { timing: HealthTiming },
}

#[derive(Debug, Serialize)]
struct HealthTiming {
    origin_timestamp: String,
    received_timestamp: String,
}

/// Serve one subscription WebSocket connection.
///
/// Creates the connection's grain (primed with the initial sync events),
/// attaches it to the subscription, then pumps messages both ways until the
/// peer disconnects or the grain disappears.
pub async fn serve_connection(
    socket: WebSocket,
    model: Arc<NodeModel>,
    connections: Arc<QueryWsConnections>,
    subscription_id: String,
) {
    let grain_id = make_id();

    // create the grain under the exclusive lock
    {
        let mut resources = model.node_resources.write().await;
        let Some(subscription) = resources
            .find_typed(&subscription_id, ResourceType::Subscription)
            .filter(|subscription| subscription.has_data())
        else {
            info!(%subscription_id, "rejecting connection to unknown subscription");
            return;
        };

        let version = subscription.version;
        let resource_path = subscription.data["resource_path"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let params = subscription.data["params"].clone();
        let topic = format!("{}/", resource_path);

        let mut grain = make_grain(
            &grain_id,
            &subscription_id,
            version,
            &topic,
            Health::At(Health::now()),
        );
        let events = make_resource_events(&resources, version, &resource_path, &params);
        if let Some(data) = grain_data_mut(&mut grain.data) {
            *data = events;
        }

        if let Err(e) = resources.insert(grain) {
            error!(%subscription_id, "failed to create grain: {}", e);
            return;
        }
        let _ = resources.modify(&subscription_id, |subscription| {
            subscription.sub_resources.insert(grain_id.clone());
            if subscription.health != Health::Forever {
                subscription.health = Health::At(Health::now());
            }
        });
    }

    // the connection table owns the only long-lived sender, so dropping the
    // entry (corruption recovery, expiry) closes the socket
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    connections.attach(grain_id.clone(), tx);
    model.notify();

    info!(%subscription_id, %grain_id, "subscription websocket connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // read commands until the peer goes away
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Health { timestamp }) => {
                    let now = Tai::now();
                    {
                        let mut resources = model.node_resources.write().await;
                        let _ = resources.set_health(&grain_id, Health::At(Health::now()));
                        if let Some(subscription) = resources.find(&subscription_id) {
                            if subscription.health != Health::Forever {
                                let _ = resources
                                    .set_health(&subscription_id, Health::At(Health::now()));
                            }
                        }
                    }
                    let response = ServerMessage::Health {
                        timing: HealthTiming {
                            origin_timestamp: timestamp.unwrap_or_else(|| now.to_string()),
                            received_timestamp: now.to_string(),
                        },
                    };
                    if let Ok(response) = serde_json::to_string(&response) {
                        if let Some(tx) = connections.connections.get(&grain_id) {
                            let _ = tx.send(response);
                        }
                    }
                }
                Err(e) => {
                    debug!(%grain_id, "ignoring unrecognised command: {}", e);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(%subscription_id, %grain_id, "subscription websocket disconnected");

    connections.connections.remove(&grain_id);
    writer.abort();

    // drop the grain; the subscription's expiry clock restarts now
    {
        let mut resources = model.node_resources.write().await;
        if resources.contains(&grain_id) {
            let _ = resources.erase(&grain_id, true);
        }
        if resources.contains(&subscription_id) {
            let _ = resources.modify(&subscription_id, |subscription| {
                subscription.sub_resources.remove(&grain_id);
                if subscription.health != Health::Forever {
                    subscription.health = Health::At(Health::now());
                }
            });
        }
    }
    model.notify();
}

/// The sending loop: drains non-empty grains to their connections, honouring
/// each subscription's `max_update_rate_ms`.
pub async fn send_events_task(model: Arc<NodeModel>, connections: Arc<QueryWsConnections>) {
    let mut updates = model.watch_updates();
    let mut earliest_deadline: Option<tokio::time::Instant> = None;

    info!("starting subscription event delivery");

    loop {
        tokio::select! {
            _ = model.shutdown.cancelled() => break,
            _ = updates.changed() => {}
            _ = async {
                match earliest_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    // no throttled grains; sleep until notified
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        earliest_deadline = None;
        let mut outgoing: Vec<(mpsc::UnboundedSender<String>, String)> = Vec::new();
        let mut corrupt: Vec<String> = Vec::new();

        {
            let mut resources = model.node_resources.write().await;
            let now = Tai::now();

            for entry in connections.connections.iter() {
                let grain_id = entry.key();

                let Some(grain) = resources
                    .find_typed(grain_id, ResourceType::Grain)
                    .filter(|grain| grain.has_data())
                else {
                    continue;
                };

                let subscription_id = grain.data["subscription_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let Some(subscription) = resources
                    .find_typed(&subscription_id, ResourceType::Subscription)
                    .filter(|subscription| subscription.has_data())
                else {
                    // grain without a subscription; close the connection
                    warn!(%grain_id, "grain has no subscription, closing connection");
                    corrupt.push(grain_id.clone());
                    continue;
                };

                if grain_data(&grain.data).map(|events| events.is_empty()).unwrap_or(true) {
                    continue;
                }

                let max_update_rate_ms =
                    subscription.data["max_update_rate_ms"].as_u64().unwrap_or(0);
                if max_update_rate_ms > 0 {
                    let earliest_permitted =
                        get_grain_timestamp(&grain.data["message"]).plus_millis(max_update_rate_ms);
                    if now < earliest_permitted {
                        let deadline = tokio::time::Instant::now()
                            + earliest_permitted.duration_since(now);
                        earliest_deadline = Some(match earliest_deadline {
                            Some(current) => current.min(deadline),
                            None => deadline,
                        });
                        continue;
                    }
                }

                // drain the grain and stamp the outgoing message
                let sync = resources.most_recent_update();
                let mut message = Value::Null;
                let grain_id = grain_id.clone();
                let _ = resources.modify(&grain_id, |grain| {
                    set_grain_timestamp(&mut grain.data["message"], sync);
                    message = grain.data["message"].clone();
                    if let Some(events) = grain_data_mut(&mut grain.data) {
                        events.clear();
                    }
                });

                if let Ok(payload) = serde_json::to_string(&message) {
                    outgoing.push((entry.value().clone(), payload));
                }
            }
        }

        for grain_id in corrupt {
            // dropping the sender closes the connection's writer
            connections.connections.remove(&grain_id);
        }
        for (tx, payload) in outgoing {
            let _ = tx.send(payload);
        }
    }

    info!("stopping subscription event delivery");
}
