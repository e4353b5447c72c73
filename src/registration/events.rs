// Registration event queue
// A hidden subscription and grain that mirror every store mutation as the
// controller's serial work queue

use serde_json::{json, Value};

use crate::events::{grain_data, grain_data_mut, make_grain, make_resource_events, make_subscription};
use crate::model::api_version::ApiVersion;
use crate::model::resource::{Health, ResourceType};
use crate::model::store::ResourceStore;
use crate::Result;

/// What a queued event says happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEventType {
    Added,
    Removed,
    Modified,
    /// Initial sync, with identical pre and post
    Unchanged,
}

/// A queued resource event, decoded from the grain's wire form.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub resource_type: ResourceType,
    pub id: String,
    pub event_type: ResourceEventType,
    pub post: Value,
}

/// Create the pseudo-subscription and its grain; returns the grain id.
///
/// The subscription is persistent and matches every queryable resource, so
/// the grain serialises the complete mutation history of the store.
pub fn setup(store: &mut ResourceStore, grain_id: &str) -> Result<()> {
    let version = ApiVersion::new(1, 3);
    let subscription_id = crate::model::make_id();

    store.insert(make_subscription(
        &subscription_id,
        version,
        // never served to external clients
        "",
        0,
        true,
        "",
        json!({}),
    ))?;
    store.insert(make_grain(grain_id, &subscription_id, version, "/", Health::Forever))?;
    store.modify(&subscription_id, |subscription| {
        subscription.sub_resources.insert(grain_id.to_string());
    })?;
    Ok(())
}

/// Discard anything queued and refill the grain with one `unchanged` event
/// per resource, in creation order.
///
/// Used on entry to initial registration, including after a heartbeat 404,
/// so that everything is re-registered in dependency order.
pub fn prime_initial_events(store: &mut ResourceStore, grain_id: &str) -> Result<()> {
    let events = make_resource_events(store, ApiVersion::new(1, 3), "", &json!({}));
    store.modify(grain_id, |grain| {
        if let Some(data) = grain_data_mut(&mut grain.data) {
            *data = events;
        }
    })?;
    Ok(())
}

/// The queued event at the head of the grain, if any.
pub fn peek_event(store: &ResourceStore, grain_id: &str) -> Option<ResourceEvent> {
    let grain = store.find_typed(grain_id, ResourceType::Grain)?;
    let events = grain_data(&grain.data)?;
    decode_event(events.first()?)
}

/// Drop the head event after it has been handled.
pub fn pop_event(store: &mut ResourceStore, grain_id: &str) {
    let _ = store.modify(grain_id, |grain| {
        if let Some(events) = grain_data_mut(&mut grain.data) {
            if !events.is_empty() {
                events.remove(0);
            }
        }
    });
}

/// Whether any events are queued.
pub fn has_events(store: &ResourceStore, grain_id: &str) -> bool {
    store
        .find_typed(grain_id, ResourceType::Grain)
        .and_then(|grain| grain_data(&grain.data))
        .map(|events| !events.is_empty())
        .unwrap_or(false)
}

fn decode_event(event: &Value) -> Option<ResourceEvent> {
    let path = event["path"].as_str()?;
    let (plural, id) = path.split_once('/')?;
    let resource_type = ResourceType::from_plural(plural)?;

    let pre = &event["pre"];
    let post = &event["post"];
    let event_type = match (pre.is_null(), post.is_null()) {
        (true, false) => ResourceEventType::Added,
        (false, true) => ResourceEventType::Removed,
        (false, false) if pre == post => ResourceEventType::Unchanged,
        (false, false) => ResourceEventType::Modified,
        (true, true) => return None,
    };

    Some(ResourceEvent {
        resource_type,
        id: id.to_string(),
        event_type,
        post: post.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::insert_resource;
    use crate::model::resource::{make_id, Resource};

    const V1_3: ApiVersion = ApiVersion::new(1, 3);

    fn node_resource(id: &str) -> Resource {
        Resource::new(
            ResourceType::Node,
            id,
            V1_3,
            json!({ "id": id, "label": "node" }),
            Health::Forever,
        )
    }

    #[test]
    fn test_queue_mirrors_mutations_in_order() {
        let mut store = ResourceStore::new();
        let grain_id = make_id();
        setup(&mut store, &grain_id).unwrap();

        let node_id = make_id();
        let device_id = make_id();
        insert_resource(&mut store, node_resource(&node_id)).unwrap();
        insert_resource(
            &mut store,
            Resource::new(
                ResourceType::Device,
                &device_id,
                V1_3,
                json!({ "id": device_id, "node_id": node_id }),
                Health::At(Health::now()),
            ),
        )
        .unwrap();

        let first = peek_event(&store, &grain_id).unwrap();
        assert_eq!(first.resource_type, ResourceType::Node);
        assert_eq!(first.event_type, ResourceEventType::Added);
        assert_eq!(first.id, node_id);

        pop_event(&mut store, &grain_id);
        let second = peek_event(&store, &grain_id).unwrap();
        assert_eq!(second.resource_type, ResourceType::Device);
        assert_eq!(second.id, device_id);

        pop_event(&mut store, &grain_id);
        assert!(!has_events(&store, &grain_id));
    }

    #[test]
    fn test_prime_replays_in_created_order() {
        let mut store = ResourceStore::new();
        let grain_id = make_id();
        setup(&mut store, &grain_id).unwrap();

        let node_id = make_id();
        let device_id = make_id();
        insert_resource(&mut store, node_resource(&node_id)).unwrap();
        insert_resource(
            &mut store,
            Resource::new(
                ResourceType::Device,
                &device_id,
                V1_3,
                json!({ "id": device_id, "node_id": node_id }),
                Health::At(Health::now()),
            ),
        )
        .unwrap();

        // consume the live events, then re-prime as after a heartbeat 404
        pop_event(&mut store, &grain_id);
        pop_event(&mut store, &grain_id);
        prime_initial_events(&mut store, &grain_id).unwrap();

        let first = peek_event(&store, &grain_id).unwrap();
        assert_eq!(first.event_type, ResourceEventType::Unchanged);
        assert_eq!(first.resource_type, ResourceType::Node);
        pop_event(&mut store, &grain_id);
        let second = peek_event(&store, &grain_id).unwrap();
        assert_eq!(second.resource_type, ResourceType::Device);
    }

    #[test]
    fn test_erase_queues_removed_event() {
        let mut store = ResourceStore::new();
        let grain_id = make_id();
        setup(&mut store, &grain_id).unwrap();

        let node_id = make_id();
        insert_resource(&mut store, node_resource(&node_id)).unwrap();
        crate::events::erase_resource(&mut store, &node_id, false).unwrap();

        pop_event(&mut store, &grain_id);
        let removed = peek_event(&store, &grain_id).unwrap();
        assert_eq!(removed.event_type, ResourceEventType::Removed);
        assert!(removed.post.is_null());
    }
}
