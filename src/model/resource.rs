// Resource domain model
// The versioned, health-checked entities tracked by the resource store

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::api_version::ApiVersion;
use super::tai::Tai;

/// The kinds of resource a store can hold.
///
/// IS-04 resources, subscriptions and their grains live in the node store;
/// connection senders/receivers live in the connection store; channel mapping
/// outputs live in the channel mapping store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Node,
    Device,
    Source,
    Flow,
    Sender,
    Receiver,
    Subscription,
    Grain,
    ConnectionSender,
    ConnectionReceiver,
    ChannelMappingOutput,
    AuthorizationSubscription,
}

impl ResourceType {
    /// The singular name used in registration request bodies, e.g. `"node"`.
    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Node => "node",
            ResourceType::Device => "device",
            ResourceType::Source => "source",
            ResourceType::Flow => "flow",
            ResourceType::Sender => "sender",
            ResourceType::Receiver => "receiver",
            ResourceType::Subscription => "subscription",
            ResourceType::Grain => "grain",
            ResourceType::ConnectionSender => "sender",
            ResourceType::ConnectionReceiver => "receiver",
            ResourceType::ChannelMappingOutput => "output",
            ResourceType::AuthorizationSubscription => "subscription",
        }
    }

    /// The plural name used in URL paths and event paths, e.g. `"nodes"`.
    pub fn plural(self) -> &'static str {
        match self {
            ResourceType::Node => "nodes",
            ResourceType::Device => "devices",
            ResourceType::Source => "sources",
            ResourceType::Flow => "flows",
            ResourceType::Sender => "senders",
            ResourceType::Receiver => "receivers",
            ResourceType::Subscription => "subscriptions",
            ResourceType::Grain => "grains",
            ResourceType::ConnectionSender => "senders",
            ResourceType::ConnectionReceiver => "receivers",
            ResourceType::ChannelMappingOutput => "outputs",
            ResourceType::AuthorizationSubscription => "subscriptions",
        }
    }

    /// Parse the plural form used in Query API paths.
    pub fn from_plural(plural: &str) -> Option<ResourceType> {
        match plural {
            "nodes" => Some(ResourceType::Node),
            "devices" => Some(ResourceType::Device),
            "sources" => Some(ResourceType::Source),
            "flows" => Some(ResourceType::Flow),
            "senders" => Some(ResourceType::Sender),
            "receivers" => Some(ResourceType::Receiver),
            "subscriptions" => Some(ResourceType::Subscription),
            _ => None,
        }
    }

    /// Whether resources of this type are registered with (and queried from)
    /// an IS-04 registry.
    pub fn is_registrable(self) -> bool {
        matches!(
            self,
            ResourceType::Node
                | ResourceType::Device
                | ResourceType::Source
                | ResourceType::Flow
                | ResourceType::Sender
                | ResourceType::Receiver
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource health, i.e. the time of the most recent heartbeat.
///
/// Resources which are not expired by the health sweep (the self node,
/// persistent subscriptions, grains) carry `Forever`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Health {
    At(u64),
    Forever,
}

impl Health {
    /// Seconds since the epoch, now.
    pub fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A versioned resource held by a `ResourceStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Opaque identifier, unique within a store
    pub id: String,

    /// What kind of resource this is
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// The API version the resource was created against
    pub version: ApiVersion,

    /// The resource representation; `Null` once the resource has been erased
    pub data: serde_json::Value,

    /// When the resource was inserted into the store
    pub created: Tai,

    /// When the resource was last mutated; strictly increasing across the store
    pub updated: Tai,

    /// Time of the most recent heartbeat
    pub health: Health,

    /// Ids of resources owned by this one, e.g. a subscription's grains
    pub sub_resources: BTreeSet<String>,
}

impl Resource {
    pub fn new(
        resource_type: ResourceType,
        id: impl Into<String>,
        version: ApiVersion,
        data: serde_json::Value,
        health: Health,
    ) -> Self {
        Resource {
            id: id.into(),
            resource_type,
            version,
            data,
            created: Tai::MIN,
            updated: Tai::MIN,
            health,
            sub_resources: BTreeSet::new(),
        }
    }

    /// Whether this resource still has a representation, i.e. has not been
    /// erased pending garbage collection.
    pub fn has_data(&self) -> bool {
        !self.data.is_null()
    }
}

/// Generate a fresh UUID-shaped resource id.
pub fn make_id() -> String {
    Uuid::new_v4().to_string()
}
