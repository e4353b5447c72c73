// Node registration behaviour
// The state machine that keeps this node's resources registered with a
// discovered registry, falling back to peer-to-peer operation

pub mod client;
pub mod events;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::authorization::SharedAuthorizationState;
use crate::dnssd::{
    ResolvedService, ServiceAdvertiser, ServiceDiscovery, TxtRecords, NODE_SERVICE,
    REGISTER_SERVICE, REGISTRATION_SERVICE,
};
use crate::model::api_version::{ApiVersion, IS04_VERSIONS};
use crate::model::resource::ResourceType;
use crate::model::{make_id, NodeModel};
use crate::query::downgrade;
use crate::settings::Settings;
use crate::NmosError;

use client::{HeartbeatOutcome, RegisterOutcome, RegistryClient};
use events::{ResourceEvent, ResourceEventType};

/// A discovered registry, ordered by DNS-SD priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryService {
    pub base_url: String,
    pub version: ApiVersion,
    pub priority: u32,
}

/// The modes of node behaviour, worked through as the standard registration
/// sequences dictate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    InitialDiscovery,
    InitialRegistration,
    RegisteredOperation,
    Rediscovery,
    PeerToPeerOperation,
    Shutdown,
}

/// Why registered operation (or initial registration) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Heartbeat 404: the registry no longer knows this node
    NotFound,
    /// 5xx, connection failure or timeout: rotate registries
    TransientFailure,
    /// The node resource was deleted from the registry on request
    NodeDeleted,
    Shutdown,
}

/// Everything the node behaviour needs.
pub struct NodeBehaviour {
    pub model: Arc<NodeModel>,
    pub auth_state: SharedAuthorizationState,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub advertiser: Arc<dyn ServiceAdvertiser>,
}

/// The node behaviour task.
pub async fn node_behaviour_task(behaviour: NodeBehaviour) {
    let NodeBehaviour {
        model,
        auth_state,
        discovery,
        advertiser,
    } = behaviour;

    // the node advertises its own API before doing anything else
    if let Err(e) = advertise_node_service(&model, advertiser.as_ref()).await {
        warn!("node service advertisement failed: {}", e);
    }

    // the pseudo-subscription mirroring every store mutation
    let grain_id = make_id();
    {
        let mut resources = model.node_resources.write().await;
        if let Err(e) = events::setup(&mut resources, &grain_id) {
            error!("registration event queue setup failed: {}", e);
            return;
        }
    }
    model.notify();

    let mut mode = Mode::InitialDiscovery;
    let mut services: Vec<RegistryService> = Vec::new();
    let mut discovery_backoff = 0f64;
    let mut self_id: Option<String> = None;

    info!("starting node behaviour");

    while !model.shutdown.is_cancelled() && mode != Mode::Shutdown {
        match mode {
            Mode::InitialDiscovery | Mode::Rediscovery => {
                if discovery_backoff > 0.0 {
                    let wait = rand::thread_rng().gen_range(0.0..discovery_backoff);
                    tokio::select! {
                        _ = model.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
                    }
                }

                services = discover_registration_services(&model, discovery.as_ref()).await;

                if !services.is_empty() {
                    // after a heartbeat failure the node is already known to
                    // have registered, so it rejoins registered operation
                    mode = if mode == Mode::InitialDiscovery {
                        Mode::InitialRegistration
                    } else {
                        Mode::RegisteredOperation
                    };

                    let settings = model.settings.read().await;
                    discovery_backoff = (discovery_backoff * settings.discovery_backoff_factor)
                        .max(settings.discovery_backoff_min)
                        .min(settings.discovery_backoff_max);
                } else {
                    info!("no registration services discovered, assuming peer-to-peer operation");
                    mode = Mode::PeerToPeerOperation;
                }
            }

            Mode::InitialRegistration => {
                let Some(client) = make_registry_client(&model, &services).await else {
                    mode = Mode::InitialDiscovery;
                    continue;
                };

                match initial_registration(&model, &auth_state, &grain_id, &client).await {
                    Ok(Some(registered_self_id)) => {
                        self_id = Some(registered_self_id);
                        mode = Mode::RegisteredOperation;
                    }
                    Ok(None) => mode = Mode::Shutdown,
                    Err(e) => {
                        error!(registry = client.base(), "initial registration failed: {}", e);
                        services.remove(0);
                        mode = Mode::Rediscovery;
                    }
                }
            }

            Mode::RegisteredOperation => {
                let Some(client) = make_registry_client(&model, &services).await else {
                    mode = Mode::Rediscovery;
                    continue;
                };
                let Some(node_id) = self_id.clone() else {
                    mode = Mode::InitialRegistration;
                    continue;
                };

                match registered_operation(&model, &auth_state, &grain_id, &client, &node_id).await
                {
                    Outcome::NotFound => mode = Mode::InitialRegistration,
                    Outcome::TransientFailure => {
                        services.remove(0);
                        mode = Mode::Rediscovery;
                    }
                    Outcome::NodeDeleted | Outcome::Shutdown => mode = Mode::Shutdown,
                }
            }

            Mode::PeerToPeerOperation => {
                match peer_to_peer_operation(&model, &grain_id, discovery.as_ref(), advertiser.as_ref())
                    .await
                {
                    Some(found) => {
                        services = found;
                        mode = Mode::InitialRegistration;
                        discovery_backoff = 0.0;
                    }
                    None => mode = Mode::Shutdown,
                }
            }

            Mode::Shutdown => {}
        }
    }

    info!("stopping node behaviour");
}

/// Advertise `_nmos-node._tcp` for this node's own API.
async fn advertise_node_service(
    model: &NodeModel,
    advertiser: &dyn ServiceAdvertiser,
) -> crate::Result<()> {
    let settings = model.settings.read().await;
    let mut txt = TxtRecords::new();
    txt.insert(
        "api_ver".to_string(),
        IS04_VERSIONS
            .iter()
            .map(ApiVersion::to_string)
            .collect::<Vec<_>>()
            .join(","),
    );
    txt.insert("api_proto".to_string(), "http".to_string());
    txt.insert(
        "api_auth".to_string(),
        settings.server_authorization.to_string(),
    );
    advertiser
        .register(&settings.node_id.clone(), NODE_SERVICE, settings.node_port(), txt)
        .await
}

/// Browse for registration services and order them for failover.
async fn discover_registration_services(
    model: &NodeModel,
    discovery: &dyn ServiceDiscovery,
) -> Vec<RegistryService> {
    let mut found = Vec::new();
    for service_type in [REGISTRATION_SERVICE, REGISTER_SERVICE] {
        match discovery.browse(service_type).await {
            Ok(services) => found.extend(services),
            Err(e) => warn!(service_type, "browse failed: {}", e),
        }
    }

    let settings = model.settings.read().await;
    let mut services = select_registration_services(&found, &settings);

    if services.is_empty() {
        if let Some(address) = &settings.registry_address {
            services.push(RegistryService {
                base_url: address.clone(),
                version: settings.registry_version,
                priority: 0,
            });
        }
    }
    services
}

/// Filter browse results by priority bounds and version compatibility, and
/// order them by priority.
pub fn select_registration_services(
    found: &[ResolvedService],
    settings: &Settings,
) -> Vec<RegistryService> {
    let mut services: Vec<RegistryService> = found
        .iter()
        .filter(|service| {
            let priority = service.priority();
            priority >= settings.highest_pri && priority <= settings.lowest_pri
        })
        .filter_map(|service| {
            // the highest version both sides support
            let advertised = service.api_versions();
            let version = settings
                .registration_versions
                .iter()
                .find(|version| advertised.is_empty() || advertised.contains(version))?;
            Some(RegistryService {
                base_url: service.base_url(),
                version: *version,
                priority: service.priority(),
            })
        })
        .collect();
    services.sort_by_key(|service| service.priority);
    services
}

async fn make_registry_client(
    model: &NodeModel,
    services: &[RegistryService],
) -> Option<RegistryClient> {
    let service = services.first()?;
    let settings = model.settings.read().await;
    RegistryClient::new(
        &service.base_url,
        service.version,
        Duration::from_secs(settings.registration_request_max),
        Duration::from_secs(settings.registration_heartbeat_max),
    )
    .ok()
}

async fn bearer_token(model: &NodeModel, auth_state: &SharedAuthorizationState) -> Option<String> {
    if !model.settings.read().await.client_authorization {
        return None;
    }
    auth_state
        .read()
        .await
        .bearer_token
        .as_ref()
        .map(|token| token.access_token.clone())
}

/// Register the node resource itself.
///
/// Returns the node id on success, or `None` for a controlled shutdown.
async fn initial_registration(
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    grain_id: &str,
    client: &RegistryClient,
) -> crate::Result<Option<String>> {
    // replay everything in creation order
    {
        let mut resources = model.node_resources.write().await;
        events::prime_initial_events(&mut resources, grain_id)?;
    }

    let mut updates = model.watch_updates();

    loop {
        let event = {
            let resources = model.node_resources.read().await;
            events::peek_event(&resources, grain_id)
        };

        let Some(event) = event else {
            // the node resource may not have been added yet
            tokio::select! {
                _ = model.shutdown.cancelled() => return Ok(None),
                _ = updates.changed() => continue,
            }
        };

        if event.resource_type != ResourceType::Node
            || event.event_type == ResourceEventType::Removed
        {
            // nothing can be registered before the node itself
            warn!(
                id = %event.id,
                resource_type = %event.resource_type,
                "discarding event queued ahead of the node registration"
            );
            let mut resources = model.node_resources.write().await;
            events::pop_event(&mut resources, grain_id);
            continue;
        }

        let token = bearer_token(model, auth_state).await;
        let data = downgraded_event_data(model, &event).await;

        match client
            .register_resource(ResourceType::Node, &data, token.as_deref())
            .await?
        {
            RegisterOutcome::Created => {}
            RegisterOutcome::AlreadyRegistered => {
                // the registry has stale state from a previous incarnation
                info!(id = %event.id, "registry knew this node already, re-registering");
                client
                    .delete_resource(ResourceType::Node, &event.id, token.as_deref())
                    .await?;
                match client
                    .register_resource(ResourceType::Node, &data, token.as_deref())
                    .await?
                {
                    RegisterOutcome::Created => {}
                    RegisterOutcome::AlreadyRegistered => {
                        return Err(NmosError::TransientNetwork(
                            "registry kept a deleted node".to_string(),
                        ))
                    }
                }
            }
        }

        let mut resources = model.node_resources.write().await;
        events::pop_event(&mut resources, grain_id);
        info!(id = %event.id, registry = client.base(), "node registered");
        return Ok(Some(event.id));
    }
}

/// Heartbeats and the serial event pump.
async fn registered_operation(
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    grain_id: &str,
    client: &RegistryClient,
    self_id: &str,
) -> Outcome {
    let heartbeat_interval = {
        let settings = model.settings.read().await;
        Duration::from_secs(settings.registration_heartbeat_interval)
    };
    // measured on the monotonic clock, regardless of what the registry's
    // Date header claims
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut updates = model.watch_updates();

    loop {
        // drain all pending events before waiting again
        loop {
            let event = {
                let resources = model.node_resources.read().await;
                events::peek_event(&resources, grain_id)
            };
            let Some(event) = event else { break };

            match process_event(model, auth_state, client, &event).await {
                Ok(()) => {
                    let mut resources = model.node_resources.write().await;
                    events::pop_event(&mut resources, grain_id);
                    if event.resource_type == ResourceType::Node
                        && event.event_type == ResourceEventType::Removed
                    {
                        info!("node deleted from registry, shutting down registration");
                        return Outcome::NodeDeleted;
                    }
                }
                Err(NmosError::PeerProtocol { status, message }) => {
                    // not retryable; the registry's view now diverges from
                    // ours until the next full re-registration
                    error!(
                        id = %event.id,
                        status,
                        "registry rejected event, discarding: {}",
                        message
                    );
                    let mut resources = model.node_resources.write().await;
                    events::pop_event(&mut resources, grain_id);
                }
                Err(e) => {
                    error!(id = %event.id, "registry request failed: {}", e);
                    return Outcome::TransientFailure;
                }
            }
        }

        tokio::select! {
            _ = model.shutdown.cancelled() => return Outcome::Shutdown,
            _ = updates.changed() => {}
            _ = heartbeat.tick() => {
                let token = bearer_token(model, auth_state).await;
                match client.heartbeat(self_id, token.as_deref()).await {
                    Ok(HeartbeatOutcome::Ok) => {}
                    Ok(HeartbeatOutcome::NotFound) => {
                        info!("heartbeat 404, re-registering all resources");
                        return Outcome::NotFound;
                    }
                    Err(e) => {
                        error!("heartbeat failed: {}", e);
                        return Outcome::TransientFailure;
                    }
                }
            }
        }
    }
}

async fn process_event(
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    client: &RegistryClient,
    event: &ResourceEvent,
) -> crate::Result<()> {
    let token = bearer_token(model, auth_state).await;

    match event.event_type {
        ResourceEventType::Added | ResourceEventType::Modified | ResourceEventType::Unchanged => {
            let data = downgraded_event_data(model, event).await;
            client
                .register_resource(event.resource_type, &data, token.as_deref())
                .await?;
            Ok(())
        }
        ResourceEventType::Removed => {
            client
                .delete_resource(event.resource_type, &event.id, token.as_deref())
                .await
        }
    }
}

/// The representation to POST, downgraded to the registry's API version.
async fn downgraded_event_data(model: &NodeModel, event: &ResourceEvent) -> serde_json::Value {
    let registry_version = model.settings.read().await.registry_version;
    let resources = model.node_resources.read().await;
    let resource_version = resources
        .find(&event.id)
        .map(|resource| resource.version)
        .unwrap_or(registry_version);
    downgrade(resource_version, event.resource_type, &event.post, registry_version)
}

// ver_* TXT counters advertised during peer-to-peer operation
const VER_KEYS: &[(ResourceType, &str)] = &[
    (ResourceType::Node, "ver_slf"),
    (ResourceType::Device, "ver_dvc"),
    (ResourceType::Source, "ver_src"),
    (ResourceType::Flow, "ver_flw"),
    (ResourceType::Sender, "ver_snd"),
    (ResourceType::Receiver, "ver_rcv"),
];

/// Advertise resource version counters and keep re-browsing for a registry.
///
/// Returns the discovered registries, or `None` on shutdown.
async fn peer_to_peer_operation(
    model: &NodeModel,
    grain_id: &str,
    discovery: &dyn ServiceDiscovery,
    advertiser: &dyn ServiceAdvertiser,
) -> Option<Vec<RegistryService>> {
    let (node_id, rebrowse_interval) = {
        let settings = model.settings.read().await;
        (
            settings.node_id.clone(),
            Duration::from_secs(settings.discovery_backoff_max as u64),
        )
    };

    let mut counters: HashMap<ResourceType, u8> = HashMap::new();

    // discard anything already queued; only changes from now on matter
    {
        let mut resources = model.node_resources.write().await;
        while events::peek_event(&resources, grain_id).is_some() {
            events::pop_event(&mut resources, grain_id);
        }
    }

    if let Err(e) = update_ver_records(model, advertiser, &node_id, Some(&counters)).await {
        warn!("ver_* advertisement failed: {}", e);
    }

    let mut updates = model.watch_updates();
    let mut rebrowse = tokio::time::interval(rebrowse_interval);
    rebrowse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately; peer-to-peer operation should hold
    // for a full interval before looking again
    rebrowse.tick().await;

    info!("entering peer-to-peer operation");

    loop {
        tokio::select! {
            _ = model.shutdown.cancelled() => return None,
            _ = updates.changed() => {
                let mut changed = false;
                {
                    let mut resources = model.node_resources.write().await;
                    while let Some(event) = events::peek_event(&resources, grain_id) {
                        events::pop_event(&mut resources, grain_id);
                        let counter = counters.entry(event.resource_type).or_insert(0);
                        *counter = counter.wrapping_add(1);
                        changed = true;
                    }
                }
                if changed {
                    if let Err(e) = update_ver_records(model, advertiser, &node_id, Some(&counters)).await {
                        warn!("ver_* update failed: {}", e);
                    }
                }
            }
            _ = rebrowse.tick() => {
                let services = discover_registration_services(model, discovery).await;
                if !services.is_empty() {
                    info!("registration service appeared, leaving peer-to-peer operation");
                    if let Err(e) = update_ver_records(model, advertiser, &node_id, None).await {
                        warn!("ver_* withdrawal failed: {}", e);
                    }
                    return Some(services);
                }
            }
        }
    }
}

async fn update_ver_records(
    model: &NodeModel,
    advertiser: &dyn ServiceAdvertiser,
    node_id: &str,
    counters: Option<&HashMap<ResourceType, u8>>,
) -> crate::Result<()> {
    let settings = model.settings.read().await;
    let mut txt = TxtRecords::new();
    txt.insert(
        "api_ver".to_string(),
        IS04_VERSIONS
            .iter()
            .map(ApiVersion::to_string)
            .collect::<Vec<_>>()
            .join(","),
    );
    txt.insert("api_proto".to_string(), "http".to_string());
    txt.insert(
        "api_auth".to_string(),
        settings.server_authorization.to_string(),
    );
    if let Some(counters) = counters {
        for (resource_type, key) in VER_KEYS {
            let count = counters.get(resource_type).copied().unwrap_or(0);
            txt.insert((*key).to_string(), count.to_string());
        }
    }
    drop(settings);

    advertiser.update_record(node_id, NODE_SERVICE, txt).await
}

#[cfg(test)]
mod tests;
