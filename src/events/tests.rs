// Tests for grain event generation

use serde_json::{json, Value};

use super::*;
use crate::model::api_version::ApiVersion;
use crate::model::resource::make_id;

const V1_3: ApiVersion = ApiVersion::new(1, 3);

fn store_with_subscription(resource_path: &str, params: Value) -> (ResourceStore, String, String) {
    let mut store = ResourceStore::new();
    let subscription_id = make_id();
    let grain_id = make_id();

    store
        .insert(make_subscription(
            &subscription_id,
            V1_3,
            "ws://example.com/ws",
            100,
            false,
            resource_path,
            params,
        ))
        .unwrap();
    store
        .insert(make_grain(
            &grain_id,
            &subscription_id,
            V1_3,
            &format!("{}/", resource_path),
            Health::Forever,
        ))
        .unwrap();
    store
        .modify(&subscription_id, |subscription| {
            subscription.sub_resources.insert(grain_id.clone());
        })
        .unwrap();

    (store, subscription_id, grain_id)
}

fn pending_events(store: &ResourceStore, grain_id: &str) -> Vec<Value> {
    grain_data(&store.find(grain_id).unwrap().data).unwrap().clone()
}

fn sender_resource(id: &str) -> Resource {
    Resource::new(
        ResourceType::Sender,
        id,
        V1_3,
        json!({ "id": id, "label": "a sender", "transport": "urn:x-nmos:transport:rtp" }),
        Health::At(Health::now()),
    )
}

#[test]
fn test_added_event_reaches_matching_grain() {
    let (mut store, _, grain_id) = store_with_subscription("/senders", json!({}));

    let id = make_id();
    insert_resource(&mut store, sender_resource(&id)).unwrap();

    let events = pending_events(&store, &grain_id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["path"], Value::String(id.clone()));
    assert!(events[0].get("pre").is_none());
    assert_eq!(events[0]["post"]["id"], Value::String(id));
}

#[test]
fn test_modified_event_has_pre_and_post() {
    let (mut store, _, grain_id) = store_with_subscription("/senders", json!({}));

    let id = make_id();
    insert_resource(&mut store, sender_resource(&id)).unwrap();
    modify_resource(&mut store, &id, |resource| {
        resource.data["label"] = "renamed".into();
    })
    .unwrap();

    let events = pending_events(&store, &grain_id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["pre"]["label"], "a sender");
    assert_eq!(events[1]["post"]["label"], "renamed");
}

#[test]
fn test_removed_event_has_pre_only() {
    let (mut store, _, grain_id) = store_with_subscription("/senders", json!({}));

    let id = make_id();
    insert_resource(&mut store, sender_resource(&id)).unwrap();
    erase_resource(&mut store, &id, false).unwrap();

    let events = pending_events(&store, &grain_id);
    assert_eq!(events.len(), 2);
    assert!(events[1].get("pre").is_some());
    assert!(events[1].get("post").is_none());
}

#[test]
fn test_non_matching_resource_type_ignored() {
    let (mut store, _, grain_id) = store_with_subscription("/receivers", json!({}));

    insert_resource(&mut store, sender_resource(&make_id())).unwrap();
    assert!(pending_events(&store, &grain_id).is_empty());
}

#[test]
fn test_filtered_subscription_matches_pre_or_post() {
    let (mut store, _, grain_id) =
        store_with_subscription("/senders", json!({ "label": "a sender" }));

    let id = make_id();
    insert_resource(&mut store, sender_resource(&id)).unwrap();
    // renaming the sender makes it leave the filter; the event still arrives
    // with only the matching pre snapshot
    modify_resource(&mut store, &id, |resource| {
        resource.data["label"] = "renamed".into();
    })
    .unwrap();

    let events = pending_events(&store, &grain_id);
    assert_eq!(events.len(), 2);
    assert!(events[1].get("pre").is_some());
    assert!(events[1].get("post").is_none());
}

#[test]
fn test_subscription_and_grain_mutations_generate_no_events() {
    let (mut store, subscription_id, grain_id) = store_with_subscription("", json!({}));

    modify_resource(&mut store, &subscription_id, |_| {}).unwrap();
    assert!(pending_events(&store, &grain_id).is_empty());
}

#[test]
fn test_event_path_for_unfiltered_subscription() {
    let (mut store, _, grain_id) = store_with_subscription("", json!({}));

    let id = make_id();
    insert_resource(&mut store, sender_resource(&id)).unwrap();

    let events = pending_events(&store, &grain_id);
    assert_eq!(events[0]["path"], Value::String(format!("senders/{}", id)));
}

#[test]
fn test_initial_sync_events_in_creation_order() {
    let mut store = ResourceStore::new();
    let node_id = make_id();
    let device_id = make_id();
    store
        .insert(Resource::new(
            ResourceType::Node,
            &node_id,
            V1_3,
            json!({ "id": node_id }),
            Health::Forever,
        ))
        .unwrap();
    store
        .insert(Resource::new(
            ResourceType::Device,
            &device_id,
            V1_3,
            json!({ "id": device_id, "node_id": node_id }),
            Health::At(Health::now()),
        ))
        .unwrap();

    let events = make_resource_events(&store, V1_3, "", &json!({}));
    assert_eq!(events.len(), 2);
    // super-resource first
    assert_eq!(events[0]["path"], Value::String(format!("nodes/{}", node_id)));
    assert_eq!(events[1]["path"], Value::String(format!("devices/{}", device_id)));
    // sync events carry identical pre and post
    assert_eq!(events[0]["pre"], events[0]["post"]);
}

#[test]
fn test_grain_timestamps() {
    let mut message = json!({});
    let tai = Tai::new(100, 5);
    set_grain_timestamp(&mut message, tai);
    assert_eq!(get_grain_timestamp(&message), tai);
    assert_eq!(message["origin_timestamp"], message["creation_timestamp"]);
}
