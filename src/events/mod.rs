// Subscription fan-out
// Grain event generation for every resource mutation, and the store mutation
// wrappers that drive it

pub mod expiry;
pub mod ws;

use serde_json::{json, Map, Value};

use crate::model::api_version::ApiVersion;
use crate::model::resource::{Health, Resource, ResourceType};
use crate::model::store::ResourceStore;
use crate::model::tai::Tai;
use crate::query::ResourceQuery;
use crate::Result;

/// Subscriptions and grains record mutations; they do not themselves
/// generate events.
pub fn is_queryable_resource(resource_type: ResourceType) -> bool {
    resource_type != ResourceType::Subscription && resource_type != ResourceType::Grain
}

/// Cap on a connection's pending events; a consumer this far behind will
/// resynchronise on reconnect anyway.
pub const MAX_PENDING_EVENTS: usize = 4096;

/// Build a subscription resource.
///
/// Persistent subscriptions never expire; non-persistent ones carry a health
/// that the expiry sweep checks once their last WebSocket connection closes.
pub fn make_subscription(
    id: &str,
    version: ApiVersion,
    ws_href: &str,
    max_update_rate_ms: u64,
    persist: bool,
    resource_path: &str,
    params: Value,
) -> Resource {
    let data = json!({
        "id": id,
        "ws_href": ws_href,
        "max_update_rate_ms": max_update_rate_ms,
        "persist": persist,
        "secure": false,
        "resource_path": resource_path,
        "params": params,
    });
    let health = if persist {
        Health::Forever
    } else {
        Health::At(Health::now())
    };
    Resource::new(ResourceType::Subscription, id, version, data, health)
}

/// Build the grain buffering pending events for one WebSocket connection to
/// a subscription.
///
/// WebSocket connection grains carry an expirable health refreshed by the
/// connection's health commands; internal grains pass `Health::Forever`.
pub fn make_grain(
    id: &str,
    subscription_id: &str,
    version: ApiVersion,
    topic: &str,
    health: Health,
) -> Resource {
    let mut message = json!({
        "grain_type": "event",
        "source_id": id,
        "flow_id": subscription_id,
        "rate": { "numerator": 0, "denominator": 1 },
        "duration": { "numerator": 0, "denominator": 1 },
        "grain": {
            "type": "urn:x-nmos:format:data.event",
            "topic": topic,
            "data": [],
        },
    });
    set_grain_timestamp(&mut message, Tai::MIN);
    let data = json!({
        "id": id,
        "subscription_id": subscription_id,
        "message": message,
    });
    Resource::new(ResourceType::Grain, id, version, data, health)
}

/// Set all three timestamps in a grain message.
pub fn set_grain_timestamp(message: &mut Value, tai: Tai) {
    let timestamp = Value::String(tai.to_string());
    message["origin_timestamp"] = timestamp.clone();
    message["sync_timestamp"] = timestamp.clone();
    message["creation_timestamp"] = timestamp;
}

/// The time a grain message was last flushed.
pub fn get_grain_timestamp(message: &Value) -> Tai {
    message["sync_timestamp"]
        .as_str()
        .and_then(|timestamp| timestamp.parse().ok())
        .unwrap_or(Tai::MIN)
}

/// The pending events of a grain, e.g. for appending.
pub fn grain_data_mut(grain_data: &mut Value) -> Option<&mut Vec<Value>> {
    grain_data
        .get_mut("message")?
        .get_mut("grain")?
        .get_mut("data")?
        .as_array_mut()
}

pub fn grain_data(grain_data: &Value) -> Option<&Vec<Value>> {
    grain_data.get("message")?.get("grain")?.get("data")?.as_array()
}

/// An `added`, `removed`, `modified` or sync event.
///
/// `resource_path` may be empty (a subscription to all resource types) or
/// e.g. "/senders"; the event path carries whatever the topic does not.
pub fn make_resource_event(
    resource_path: &str,
    resource_type: ResourceType,
    pre: &Value,
    post: &Value,
) -> Value {
    let snapshot = if !pre.is_null() { pre } else { post };
    let id = snapshot["id"].as_str().unwrap_or_default();
    let path = if resource_path.is_empty() {
        format!("{}/{}", resource_type.plural(), id)
    } else {
        id.to_string()
    };

    let mut event = Map::new();
    event.insert("path".to_string(), Value::String(path));
    if !pre.is_null() {
        event.insert("pre".to_string(), pre.clone());
    }
    if !post.is_null() {
        event.insert("post".to_string(), post.clone());
    }
    Value::Object(event)
}

/// The initial sync events for a new grain: one `unchanged` event for every
/// resource matching the subscription, super-resources first.
pub fn make_resource_events(
    store: &ResourceStore,
    version: ApiVersion,
    resource_path: &str,
    params: &Value,
) -> Vec<Value> {
    let flat = params.as_object().cloned().unwrap_or_default();
    let query = match ResourceQuery::new(version, resource_path, &flat) {
        Ok(query) => query,
        Err(_) => return Vec::new(),
    };

    // in increasing creation order, so super-resources come first
    store
        .iter_by_created()
        .filter(|resource| is_queryable_resource(resource.resource_type))
        .filter(|resource| query.matches_resource(resource))
        .map(|resource| {
            let data = query.downgrade(resource);
            make_resource_event(resource_path, resource.resource_type, &data, &data)
        })
        .collect()
}

/// Insert an event into the grains of every subscription matching `pre` or
/// `post`.
pub fn insert_resource_events(
    store: &mut ResourceStore,
    version: ApiVersion,
    resource_type: ResourceType,
    pre: &Value,
    post: &Value,
) {
    if !is_queryable_resource(resource_type) {
        return;
    }

    struct MatchedSubscription {
        grains: Vec<String>,
        event: Value,
    }

    let mut matched = Vec::new();
    for subscription in store.iter_type(ResourceType::Subscription) {
        if !subscription.has_data() {
            continue;
        }
        let resource_path = subscription.data["resource_path"].as_str().unwrap_or_default();
        let params = subscription.data["params"].as_object().cloned().unwrap_or_default();
        let Ok(query) = ResourceQuery::new(subscription.version, resource_path, &params) else {
            continue;
        };

        let pre_match = !pre.is_null() && query.matches(version, resource_type, pre);
        let post_match = !post.is_null() && query.matches(version, resource_type, post);
        if !pre_match && !post_match {
            continue;
        }

        let event = make_resource_event(
            resource_path,
            resource_type,
            if pre_match { pre } else { &Value::Null },
            if post_match { post } else { &Value::Null },
        );
        matched.push(MatchedSubscription {
            grains: subscription.sub_resources.iter().cloned().collect(),
            event,
        });
    }

    for subscription in matched {
        for grain_id in subscription.grains {
            // the grain may already be gone if its connection closed
            if store.find_typed(&grain_id, ResourceType::Grain).is_none() {
                continue;
            }
            let event = subscription.event.clone();
            let _ = store.modify(&grain_id, |grain| {
                if let Some(events) = grain_data_mut(&mut grain.data) {
                    if events.len() < MAX_PENDING_EVENTS {
                        events.push(event);
                    } else {
                        tracing::warn!(
                            grain_id = %grain.id,
                            "event queue full, dropping event"
                        );
                    }
                }
            });
        }
    }
}

/// Insert a resource, generating `added` events for matching subscriptions.
pub fn insert_resource(store: &mut ResourceStore, resource: Resource) -> Result<Tai> {
    let version = resource.version;
    let resource_type = resource.resource_type;
    let post = resource.data.clone();
    let update = store.insert(resource)?;
    insert_resource_events(store, version, resource_type, &Value::Null, &post);
    Ok(update)
}

/// Modify a resource, generating a `modified` event for matching
/// subscriptions.
pub fn modify_resource(
    store: &mut ResourceStore,
    id: &str,
    mutator: impl FnOnce(&mut Resource),
) -> Result<Tai> {
    let pre = store
        .find(id)
        .map(|resource| resource.data.clone())
        .unwrap_or(Value::Null);
    let update = store.modify(id, mutator)?;
    let resource = store.find(id).expect("modified resource exists");
    let version = resource.version;
    let resource_type = resource.resource_type;
    let post = resource.data.clone();
    insert_resource_events(store, version, resource_type, &pre, &post);
    Ok(update)
}

/// Erase a resource, generating a `removed` event for matching
/// subscriptions.
pub fn erase_resource(store: &mut ResourceStore, id: &str, allow_forget: bool) -> Result<Tai> {
    let Some(resource) = store.find(id) else {
        return Err(crate::NmosError::ResourceNotFound { id: id.to_string() });
    };
    let version = resource.version;
    let resource_type = resource.resource_type;
    let pre = resource.data.clone();
    let update = store.erase(id, allow_forget)?;
    insert_resource_events(store, version, resource_type, &pre, &Value::Null);
    Ok(update)
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod ws_tests;
