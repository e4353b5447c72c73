// Transport parameter "auto" resolution
// Sensible defaults for the RTP transport type; IP selection stays with the integrator

use serde_json::{json, Map, Value};

use crate::{NmosError, Result};

/// Replace `"auto"` in a parameter with a computed default.
///
/// The default is computed lazily so that offsets from other parameters see
/// their already-resolved values.
fn resolve_auto(
    params: &mut Map<String, Value>,
    field: &str,
    default: impl FnOnce(&Map<String, Value>) -> Result<Value>,
) -> Result<()> {
    if params.get(field).and_then(Value::as_str) == Some("auto") {
        let value = default(params)?;
        params.insert(field.to_string(), value);
    }
    Ok(())
}

fn port_offset(params: &Map<String, Value>, field: &str, offset: i64) -> Result<Value> {
    let port = params
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| NmosError::Internal(format!("{} is not numeric", field)))?;
    Ok(json!(port + offset))
}

fn copy_field(params: &Map<String, Value>, field: &str) -> Value {
    params.get(field).cloned().unwrap_or(Value::Null)
}

/// Resolve `"auto"` in a sender's or receiver's RTP transport parameters.
///
/// Ports default to `auto_rtp_port` with the usual +1 RTCP and +2/+4 FEC
/// offsets; FEC and RTCP addresses follow the destination (or multicast)
/// address. Source, destination and interface IPs marked `auto` are not
/// resolved here; the integrator's resolver runs first.
pub fn resolve_rtp_auto(
    is_sender: bool,
    transport_params: &mut Value,
    auto_rtp_port: u16,
) -> Result<()> {
    let legs = transport_params
        .as_array_mut()
        .ok_or_else(|| NmosError::Internal("transport_params is not an array".to_string()))?;

    for leg in legs {
        let params = leg
            .as_object_mut()
            .ok_or_else(|| NmosError::Internal("transport_params leg is not an object".to_string()))?;

        if is_sender {
            resolve_auto(params, "source_port", |_| Ok(json!(auto_rtp_port)))?;
            resolve_auto(params, "destination_port", |_| Ok(json!(auto_rtp_port)))?;
            resolve_auto(params, "fec_destination_ip", |p| Ok(copy_field(p, "destination_ip")))?;
            resolve_auto(params, "fec1D_destination_port", |p| port_offset(p, "destination_port", 2))?;
            resolve_auto(params, "fec2D_destination_port", |p| port_offset(p, "destination_port", 4))?;
            resolve_auto(params, "fec1D_source_port", |p| port_offset(p, "source_port", 2))?;
            resolve_auto(params, "fec2D_source_port", |p| port_offset(p, "source_port", 4))?;
            resolve_auto(params, "rtcp_destination_ip", |p| Ok(copy_field(p, "destination_ip")))?;
            resolve_auto(params, "rtcp_destination_port", |p| port_offset(p, "destination_port", 1))?;
            resolve_auto(params, "rtcp_source_port", |p| port_offset(p, "source_port", 1))?;
        } else {
            resolve_auto(params, "destination_port", |_| Ok(json!(auto_rtp_port)))?;
            resolve_auto(params, "fec_destination_ip", |p| {
                Ok(match p.get("multicast_ip") {
                    Some(multicast) if !multicast.is_null() => multicast.clone(),
                    _ => copy_field(p, "interface_ip"),
                })
            })?;
            resolve_auto(params, "fec1D_destination_port", |p| port_offset(p, "destination_port", 2))?;
            resolve_auto(params, "fec2D_destination_port", |p| port_offset(p, "destination_port", 4))?;
            resolve_auto(params, "rtcp_destination_ip", |p| {
                Ok(match p.get("multicast_ip") {
                    Some(multicast) if !multicast.is_null() => multicast.clone(),
                    _ => copy_field(p, "interface_ip"),
                })
            })?;
            resolve_auto(params, "rtcp_destination_port", |p| port_offset(p, "destination_port", 1))?;
        }
    }

    Ok(())
}
