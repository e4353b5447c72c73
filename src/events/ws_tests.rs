// Tests for the subscription sending loop

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::ws::{send_events_task, QueryWsConnections};
use super::*;
use crate::model::resource::make_id;
use crate::model::NodeModel;
use crate::settings::Settings;

const V1_3: crate::model::ApiVersion = crate::model::ApiVersion::new(1, 3);

async fn model_with_connection(
    max_update_rate_ms: u64,
) -> (Arc<NodeModel>, Arc<QueryWsConnections>, String, mpsc::UnboundedReceiver<String>) {
    let model = NodeModel::new(Settings::default());
    let connections = QueryWsConnections::new();
    let subscription_id = make_id();
    let grain_id = make_id();

    {
        let mut resources = model.node_resources.write().await;
        resources
            .insert(make_subscription(
                &subscription_id,
                V1_3,
                "ws://example.com/ws",
                max_update_rate_ms,
                true,
                "/senders",
                json!({}),
            ))
            .unwrap();
        let mut grain = make_grain(&grain_id, &subscription_id, V1_3, "/senders/", Health::Forever);
        // start the throttle clock from now, as a live connection would after
        // its initial sync
        set_grain_timestamp(&mut grain.data["message"], Tai::now());
        resources.insert(grain).unwrap();
        resources
            .modify(&subscription_id, |subscription| {
                subscription.sub_resources.insert(grain_id.clone());
            })
            .unwrap();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    connections.attach(grain_id.clone(), tx);

    (model, connections, grain_id, rx)
}

fn insert_test_sender(resources: &mut ResourceStore) {
    let id = make_id();
    insert_resource(
        resources,
        Resource::new(
            ResourceType::Sender,
            &id,
            V1_3,
            json!({ "id": id, "label": "s" }),
            Health::At(Health::now()),
        ),
    )
    .unwrap();
}

#[tokio::test]
async fn test_throttled_events_coalesce_into_one_frame() {
    let (model, connections, _, mut rx) = model_with_connection(100).await;
    let task = tokio::spawn(send_events_task(model.clone(), connections));

    // a burst of mutations well inside the update rate window
    for _ in 0..10 {
        let mut resources = model.node_resources.write().await;
        insert_test_sender(&mut resources);
        drop(resources);
        model.notify();
    }

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("a frame should be delivered at the throttle boundary")
        .expect("connection should stay open");
    let message: Value = serde_json::from_str(&frame).unwrap();

    // all ten events in one frame, stamped with the store's clock as of the
    // flush (draining the grain advances the clock past the stamp)
    assert_eq!(message["grain"]["data"].as_array().unwrap().len(), 10);
    let sync: Tai = message["sync_timestamp"].as_str().unwrap().parse().unwrap();
    let last_mutation = {
        let resources = model.node_resources.read().await;
        resources
            .iter_type(ResourceType::Sender)
            .map(|sender| sender.updated)
            .max()
            .unwrap()
    };
    assert!(sync >= last_mutation);
    assert!(sync <= model.node_resources.read().await.most_recent_update());
    assert_eq!(message["origin_timestamp"], message["sync_timestamp"]);

    // and nothing else pending
    assert!(rx.try_recv().is_err());

    model.controlled_shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_zero_update_rate_is_unthrottled() {
    let (model, connections, _, mut rx) = model_with_connection(0).await;
    let task = tokio::spawn(send_events_task(model.clone(), connections));

    {
        let mut resources = model.node_resources.write().await;
        insert_test_sender(&mut resources);
    }
    model.notify();

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("an unthrottled frame should be delivered immediately")
        .unwrap();
    let message: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(message["grain"]["data"].as_array().unwrap().len(), 1);

    model.controlled_shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_expiry_sweep_drops_stale_connections() {
    let (model, connections, grain_id, mut rx) = model_with_connection(0).await;

    let subscription_id = {
        let mut resources = model.node_resources.write().await;
        let subscription_id = resources.find(&grain_id).unwrap().data["subscription_id"]
            .as_str()
            .unwrap()
            .to_string();
        // make the subscription non-persistent and long past its last health
        resources
            .modify(&subscription_id, |subscription| {
                subscription.data["persist"] = false.into();
            })
            .unwrap();
        resources.set_health(&grain_id, Health::At(0)).unwrap();
        resources.set_health(&subscription_id, Health::At(0)).unwrap();
        subscription_id
    };

    super::expiry::sweep(&model, &connections).await;
    // the stale connection is gone; the subscription expires on the next
    // sweep, once its grain no longer holds it alive
    assert!(connections.is_empty());
    assert!(rx.recv().await.is_none());
    assert!(!model.node_resources.read().await.contains(&grain_id));

    super::expiry::sweep(&model, &connections).await;
    let resources = model.node_resources.read().await;
    let subscription = resources.find(&subscription_id);
    assert!(subscription.map(|s| !s.has_data()).unwrap_or(true));
}

#[tokio::test]
async fn test_grain_without_subscription_closes_connection() {
    let (model, connections, grain_id, mut rx) = model_with_connection(0).await;

    // corrupt the store: drop the subscription but keep the grain and give it
    // a pending event
    {
        let mut resources = model.node_resources.write().await;
        let subscription_id = resources.find(&grain_id).unwrap().data["subscription_id"]
            .as_str()
            .unwrap()
            .to_string();
        resources.erase(&subscription_id, true).unwrap();
        // re-create the grain that was cascade-erased with the subscription
        resources
            .insert(make_grain(&grain_id, &subscription_id, V1_3, "/senders/", Health::Forever))
            .unwrap();
        resources
            .modify(&grain_id, |grain| {
                if let Some(events) = grain_data_mut(&mut grain.data) {
                    events.push(json!({ "path": "senders/x" }));
                }
            })
            .unwrap();
    }

    let connections_for_task = connections.clone();
    let task = tokio::spawn(send_events_task(model.clone(), connections_for_task));
    model.notify();

    // the sender is dropped, so the channel reports closed
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await
    .expect("connection should be closed");
    assert!(connections.is_empty());

    model.controlled_shutdown();
    task.await.unwrap();
}
