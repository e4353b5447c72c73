// Activation engine
// Transitions staged connection and channel mapping parameters into active
// parameters at the requested time

pub mod auto_resolve;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::events;
use crate::model::resource::{Resource, ResourceType};
use crate::model::store::ResourceStore;
use crate::model::tai::Tai;
use crate::model::NodeModel;
use crate::{NmosError, Result};

/// The three ways a staged activation can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    ActivateScheduledAbsolute,
    ActivateScheduledRelative,
    ActivateImmediate,
}

impl ActivationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationMode::ActivateScheduledAbsolute => "activate_scheduled_absolute",
            ActivationMode::ActivateScheduledRelative => "activate_scheduled_relative",
            ActivationMode::ActivateImmediate => "activate_immediate",
        }
    }

    pub fn is_scheduled(self) -> bool {
        !matches!(self, ActivationMode::ActivateImmediate)
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationMode {
    type Err = NmosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "activate_scheduled_absolute" => Ok(ActivationMode::ActivateScheduledAbsolute),
            "activate_scheduled_relative" => Ok(ActivationMode::ActivateScheduledRelative),
            "activate_immediate" => Ok(ActivationMode::ActivateImmediate),
            _ => Err(NmosError::Validation(format!("invalid activation mode: {}", s))),
        }
    }
}

/// An empty staged activation: `{mode: null, requested_time: null,
/// activation_time: null}`.
pub fn make_activation() -> Value {
    json!({
        "mode": null,
        "requested_time": null,
        "activation_time": null,
    })
}

/// Clear any pending activation from a resource's staged endpoint.
///
/// For an in-flight immediate activation this clears `requested_time`, which
/// a waiting PATCH handler observes as failure.
pub fn set_resource_not_pending(resource_data: &mut Value) {
    resource_data["endpoint_staged"]["activation"] = make_activation();
}

/// What the sweep should do with a resource's staged activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staged {
    /// Nothing staged
    None,
    /// Scheduled, not yet due
    ScheduledAt(Tai),
    /// A scheduled activation whose time has passed
    Due(ActivationMode),
    /// An in-flight immediate activation
    DueImmediate,
}

fn staged_state(resource_data: &Value, now: Tai) -> Staged {
    let activation = &resource_data["endpoint_staged"]["activation"];
    let Some(mode) = activation["mode"].as_str() else {
        return Staged::None;
    };
    let Ok(mode) = mode.parse::<ActivationMode>() else {
        warn!("unexpected activation mode: {}", mode);
        return Staged::None;
    };

    match mode {
        ActivationMode::ActivateScheduledAbsolute | ActivationMode::ActivateScheduledRelative => {
            // the PATCH layer resolves relative requests to an absolute
            // activation_time when staging them
            let Some(time) = activation["activation_time"]
                .as_str()
                .and_then(|time| time.parse::<Tai>().ok())
            else {
                return Staged::None;
            };
            if time <= now {
                Staged::Due(mode)
            } else {
                Staged::ScheduledAt(time)
            }
        }
        ActivationMode::ActivateImmediate => {
            // requested_time and activation_time implement the per-resource
            // in-flight lock: a cancelled activation has requested_time null,
            // a processed one has activation_time set
            if activation["requested_time"].is_null() || !activation["activation_time"].is_null() {
                Staged::None
            } else {
                Staged::DueImmediate
            }
        }
    }
}

/// Integrator hooks for connection activations.
///
/// `resolve_transport_params` runs before the built-in RTP defaults and is
/// where `auto` source/destination/interface addresses get their values.
/// `set_transportfile` replaces the built-in SDP composition for senders.
/// `connection_activated` is notified after each completed activation.
pub type TransportParamsResolver =
    Box<dyn Fn(&Resource, &Resource, &mut Value) -> Result<()> + Send + Sync>;
pub type TransportfileSetter = Box<dyn Fn(&Resource, &Resource) -> Result<Value> + Send + Sync>;
pub type ConnectionActivatedHandler = Box<dyn Fn(&str, ResourceType) + Send + Sync>;

#[derive(Default)]
pub struct ConnectionActivationHandlers {
    pub resolve_transport_params: Option<TransportParamsResolver>,
    pub set_transportfile: Option<TransportfileSetter>,
    pub connection_activated: Option<ConnectionActivatedHandler>,
}

/// The IS-05 connection activation task.
///
/// Waits until the store changes or the earliest scheduled activation falls
/// due, then sweeps all connection resources in reverse update order.
pub async fn connection_activation_task(
    model: Arc<NodeModel>,
    handlers: ConnectionActivationHandlers,
) {
    let mut updates = model.watch_updates();
    let mut earliest_scheduled: Option<Tai> = None;

    info!("starting connection activation");

    loop {
        tokio::select! {
            _ = model.shutdown.cancelled() => break,
            _ = updates.changed() => {}
            _ = async {
                match earliest_scheduled {
                    Some(deadline) => {
                        tokio::time::sleep(deadline.duration_since(Tai::now())).await
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        let notify = {
            let mut connection_resources = model.connection_resources.write().await;
            let mut node_resources = model.node_resources.write().await;
            let auto_rtp_port = model.settings.read().await.auto_rtp_port;

            let (notify, earliest) = sweep_connection_activations(
                &mut connection_resources,
                &mut node_resources,
                &handlers,
                auto_rtp_port,
            );
            earliest_scheduled = earliest;
            notify
        };

        if notify {
            model.notify();
        }
    }

    info!("stopping connection activation");
}

/// One sweep over the connection resources; returns whether anything was
/// activated and the next scheduled deadline.
pub fn sweep_connection_activations(
    connection_resources: &mut ResourceStore,
    node_resources: &mut ResourceStore,
    handlers: &ConnectionActivationHandlers,
    auto_rtp_port: u16,
) -> (bool, Option<Tai>) {
    let now = Tai::now();
    let mut earliest_scheduled: Option<Tai> = None;
    let mut notify = false;

    // modify reorders the updated index, so iterate a descending snapshot
    for id in connection_resources.ids_by_updated_desc() {
        let Some(resource) = connection_resources.find(&id) else { continue };
        if !resource.has_data() {
            continue;
        }
        let resource_type = resource.resource_type;

        match staged_state(&resource.data, now) {
            Staged::None => continue,
            Staged::ScheduledAt(time) => {
                earliest_scheduled = Some(match earliest_scheduled {
                    Some(earliest) => earliest.min(time),
                    None => time,
                });
                continue;
            }
            Staged::Due(_) => {
                info!(%id, "processing scheduled activation");
            }
            Staged::DueImmediate => {
                info!(%id, "processing immediate activation");
            }
        }

        if let Err(e) = activate_connection_resource(
            connection_resources,
            node_resources,
            &id,
            resource_type,
            handlers,
            auto_rtp_port,
        ) {
            error!(%id, "activation failed: {}", e);
            // unlock the resource; an in-flight immediate activation
            // surfaces this as a 500 to the waiting request
            let _ = connection_resources.modify(&id, |resource| {
                set_resource_not_pending(&mut resource.data);
            });
        }

        notify = true;
    }

    if notify {
        bump_device_versions(node_resources, Tai::now());
    }

    (notify, earliest_scheduled)
}

fn activate_connection_resource(
    connection_resources: &mut ResourceStore,
    node_resources: &mut ResourceStore,
    id: &str,
    resource_type: ResourceType,
    handlers: &ConnectionActivationHandlers,
    auto_rtp_port: u16,
) -> Result<()> {
    let is_sender = resource_type == ResourceType::ConnectionSender;
    let matching_type = if is_sender {
        ResourceType::Sender
    } else {
        ResourceType::Receiver
    };

    let matching = node_resources
        .find_typed(id, matching_type)
        .filter(|resource| resource.has_data())
        .cloned()
        .ok_or_else(|| NmosError::Internal("matching IS-04 resource not found".to_string()))?;

    let activation_time = Tai::now();
    let at = Value::String(activation_time.to_string());

    // resolve auto on a copy of the staged parameters, so that a failure
    // leaves the previous active parameters untouched
    let connection = connection_resources
        .find(id)
        .ok_or_else(|| NmosError::ResourceNotFound { id: id.to_string() })?;
    let staged = connection.data["endpoint_staged"].clone();
    let mode: ActivationMode = staged["activation"]["mode"]
        .as_str()
        .unwrap_or_default()
        .parse()?;

    let mut activating = staged.clone();
    if let Some(resolver) = &handlers.resolve_transport_params {
        resolver(&matching, connection, &mut activating["transport_params"])?;
    }
    auto_resolve::resolve_rtp_auto(is_sender, &mut activating["transport_params"], auto_rtp_port)?;

    let transportfile = if is_sender {
        Some(match &handlers.set_transportfile {
            Some(setter) => setter(&matching, connection)?,
            None => make_sdp_transportfile(&activating),
        })
    } else {
        None
    };

    let active = activating["master_enable"].as_bool().unwrap_or(false);
    let connected_id = activating[if is_sender { "receiver_id" } else { "sender_id" }]
        .as_str()
        .map(str::to_string);

    connection_resources.modify(id, |connection| {
        connection.data["version"] = at.clone();
        connection.data["endpoint_staged"]["activation"]["activation_time"] = at.clone();

        let mut endpoint_active = activating.clone();
        endpoint_active["activation"] = connection.data["endpoint_staged"]["activation"].clone();
        connection.data["endpoint_active"] = endpoint_active;

        if let Some(transportfile) = &transportfile {
            connection.data["endpoint_transportfile"] = transportfile.clone();
        }

        // scheduled activations return the staged activation to null here;
        // for an immediate activation the PATCH handler finishes the
        // transition after it has built its response
        if mode.is_scheduled() {
            set_resource_not_pending(&mut connection.data);
        }
    })?;

    // update the matching IS-04 resource's subscription and version
    events::modify_resource(node_resources, id, |resource| {
        set_resource_subscription(resource, active, connected_id.as_deref(), activation_time);
    })?;

    if let Some(activated) = &handlers.connection_activated {
        activated(id, resource_type);
    }

    Ok(())
}

/// Update an IS-04 sender or receiver after its active connection changed.
pub fn set_resource_subscription(
    resource: &mut Resource,
    active: bool,
    connected_id: Option<&str>,
    activation_time: Tai,
) {
    let connected = match connected_id {
        Some(connected_id) if active => Value::String(connected_id.to_string()),
        _ => Value::Null,
    };
    let connected_key = if resource.resource_type == ResourceType::Sender {
        "receiver_id"
    } else {
        "sender_id"
    };

    resource.data["version"] = Value::String(activation_time.to_string());
    resource.data["subscription"] = json!({
        "active": active,
        connected_key: connected,
    });
}

/// Bump the version of every device; IS-04 requires this whenever the
/// connection capabilities beneath a device change.
pub fn bump_device_versions(node_resources: &mut ResourceStore, activation_time: Tai) {
    let at = Value::String(activation_time.to_string());
    let devices: Vec<String> = node_resources
        .iter_type(ResourceType::Device)
        .filter(|device| device.has_data())
        .map(|device| device.id.clone())
        .collect();
    for id in devices {
        let at = at.clone();
        let _ = events::modify_resource(node_resources, &id, |device| {
            device.data["version"] = at;
        });
    }
}

// A minimal SDP session description from the first leg of a sender's
// resolved transport parameters. Integrators replace this via
// ConnectionActivationHandlers::set_transportfile.
fn make_sdp_transportfile(endpoint_active: &Value) -> Value {
    let leg = &endpoint_active["transport_params"][0];
    let source_ip = leg["source_ip"].as_str().unwrap_or("0.0.0.0");
    let destination_ip = leg["destination_ip"].as_str().unwrap_or("0.0.0.0");
    let destination_port = leg["destination_port"].as_u64().unwrap_or(5004);

    let sdp = format!(
        "v=0\r\no=- 0 0 IN IP4 {source_ip}\r\ns=nmos_node\r\nc=IN IP4 {destination_ip}\r\nt=0 0\r\nm=video {destination_port} RTP/AVP 96\r\n"
    );
    json!({
        "data": sdp,
        "type": "application/sdp",
    })
}

/// Default RTP transport parameters for one leg of a connection sender.
pub fn make_sender_transport_params() -> Value {
    json!({
        "source_ip": "auto",
        "destination_ip": "auto",
        "source_port": "auto",
        "destination_port": "auto",
        "rtp_enabled": true,
        "rtcp_enabled": false,
        "rtcp_destination_ip": "auto",
        "rtcp_destination_port": "auto",
        "rtcp_source_port": "auto",
        "fec_enabled": false,
        "fec_destination_ip": "auto",
        "fec1D_destination_port": "auto",
        "fec2D_destination_port": "auto",
        "fec1D_source_port": "auto",
        "fec2D_source_port": "auto",
    })
}

/// Default RTP transport parameters for one leg of a connection receiver.
pub fn make_receiver_transport_params() -> Value {
    json!({
        "source_ip": null,
        "interface_ip": "auto",
        "multicast_ip": null,
        "destination_port": "auto",
        "rtp_enabled": true,
        "rtcp_enabled": false,
        "rtcp_destination_ip": "auto",
        "rtcp_destination_port": "auto",
        "fec_enabled": false,
        "fec_destination_ip": "auto",
        "fec_mode": "1D",
        "fec1D_destination_port": "auto",
        "fec2D_destination_port": "auto",
    })
}

fn make_connection_resource(
    resource_type: ResourceType,
    id: &str,
    version: crate::model::ApiVersion,
    legs: usize,
) -> Resource {
    let is_sender = resource_type == ResourceType::ConnectionSender;
    let params: Vec<Value> = (0..legs)
        .map(|_| {
            if is_sender {
                make_sender_transport_params()
            } else {
                make_receiver_transport_params()
            }
        })
        .collect();
    let connected_key = if is_sender { "receiver_id" } else { "sender_id" };

    let mut endpoint = json!({
        "activation": make_activation(),
        "master_enable": false,
        connected_key: null,
        "transport_params": params,
    });
    if !is_sender {
        endpoint["transport_file"] = json!({ "data": null, "type": null });
    }

    let mut data = json!({
        "id": id,
        "version": Tai::now().to_string(),
        "transport_type": "urn:x-nmos:transport:rtp",
        "endpoint_constraints": (0..legs).map(|_| json!({})).collect::<Vec<Value>>(),
        "endpoint_staged": endpoint.clone(),
        "endpoint_active": endpoint,
    });
    if is_sender {
        data["endpoint_transportfile"] = json!({ "data": null, "type": null });
    }

    Resource::new(
        resource_type,
        id,
        version,
        data,
        crate::model::Health::Forever,
    )
}

/// Build the IS-05 counterpart of an IS-04 sender, with all transport
/// parameters staged `auto` and nothing active.
pub fn make_connection_sender(id: &str, version: crate::model::ApiVersion, legs: usize) -> Resource {
    make_connection_resource(ResourceType::ConnectionSender, id, version, legs)
}

/// Build the IS-05 counterpart of an IS-04 receiver.
pub fn make_connection_receiver(
    id: &str,
    version: crate::model::ApiVersion,
    legs: usize,
) -> Resource {
    make_connection_resource(ResourceType::ConnectionReceiver, id, version, legs)
}

/// Build an IS-08 channel mapping output with an empty active map.
pub fn make_channelmapping_output(id: &str, version: crate::model::ApiVersion) -> Resource {
    let data = json!({
        "id": id,
        "version": Tai::now().to_string(),
        "endpoint_staged": {
            "activation": make_activation(),
            "action": {},
        },
        "endpoint_active": {
            "activation": make_activation(),
            "map": {},
        },
    });
    Resource::new(
        ResourceType::ChannelMappingOutput,
        id,
        version,
        data,
        crate::model::Health::Forever,
    )
}

/// The IS-08 channel mapping activation task.
///
/// Identical scheduling to the connection task; processing replaces each
/// output's active map with the staged actions.
pub async fn channelmapping_activation_task(model: Arc<NodeModel>) {
    let mut updates = model.watch_updates();
    let mut earliest_scheduled: Option<Tai> = None;

    info!("starting channel mapping activation");

    loop {
        tokio::select! {
            _ = model.shutdown.cancelled() => break,
            _ = updates.changed() => {}
            _ = async {
                match earliest_scheduled {
                    Some(deadline) => {
                        tokio::time::sleep(deadline.duration_since(Tai::now())).await
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        let notify = {
            let mut channelmapping_resources = model.channelmapping_resources.write().await;
            let mut node_resources = model.node_resources.write().await;

            let (notify, earliest) =
                sweep_channelmapping_activations(&mut channelmapping_resources, &mut node_resources);
            earliest_scheduled = earliest;
            notify
        };

        if notify {
            model.notify();
        }
    }

    info!("stopping channel mapping activation");
}

/// One sweep over the channel mapping outputs.
pub fn sweep_channelmapping_activations(
    channelmapping_resources: &mut ResourceStore,
    node_resources: &mut ResourceStore,
) -> (bool, Option<Tai>) {
    let now = Tai::now();
    let mut earliest_scheduled: Option<Tai> = None;
    let mut notify = false;

    for id in channelmapping_resources.ids_by_updated_desc() {
        let Some(resource) = channelmapping_resources.find(&id) else { continue };
        if !resource.has_data() || resource.resource_type != ResourceType::ChannelMappingOutput {
            continue;
        }

        let mode = match staged_state(&resource.data, now) {
            Staged::None => continue,
            Staged::ScheduledAt(time) => {
                earliest_scheduled = Some(match earliest_scheduled {
                    Some(earliest) => earliest.min(time),
                    None => time,
                });
                continue;
            }
            Staged::Due(mode) => mode,
            Staged::DueImmediate => ActivationMode::ActivateImmediate,
        };

        info!(%id, "processing channel mapping activation");

        let activation_time = Tai::now();
        let at = Value::String(activation_time.to_string());
        let _ = channelmapping_resources.modify(&id, |output| {
            output.data["version"] = at.clone();
            output.data["endpoint_staged"]["activation"]["activation_time"] = at.clone();

            let action = output.data["endpoint_staged"]["action"].clone();
            let mut activation = output.data["endpoint_staged"]["activation"].clone();
            activation["mode"] = Value::String(mode.as_str().to_string());
            output.data["endpoint_active"] = json!({
                "activation": activation,
                "map": action,
            });

            if mode.is_scheduled() {
                set_resource_not_pending(&mut output.data);
            }
        });

        notify = true;
    }

    if notify {
        bump_device_versions(node_resources, Tai::now());
    }

    (notify, earliest_scheduled)
}
