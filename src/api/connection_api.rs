// Connection API
// Staged/active parameter access and the activation handshake with the
// activation engine

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::activation::{make_activation, ActivationMode};
use crate::model::resource::ResourceType;
use crate::model::tai::Tai;

use super::error::{ApiError, ApiResult};
use super::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(index))
        .route("/single/", get(single_index))
        .route("/single/:resource_type", get(list_connection_resources))
        .route("/single/:resource_type/:id", get(resource_index))
        .route("/single/:resource_type/:id/constraints", get(get_constraints))
        .route(
            "/single/:resource_type/:id/staged",
            get(get_staged).patch(patch_staged),
        )
        .route("/single/:resource_type/:id/active", get(get_active))
        .route("/single/:resource_type/:id/transportfile", get(get_transportfile))
        .route("/single/:resource_type/:id/transporttype", get(get_transporttype))
        .route("/bulk/:resource_type", get(bulk_index).post(bulk_staged))
}

async fn index() -> impl IntoResponse {
    Json(json!(["bulk/", "single/"]))
}

async fn single_index() -> impl IntoResponse {
    Json(json!(["senders/", "receivers/"]))
}

async fn bulk_index() -> impl IntoResponse {
    Json(json!(["senders/", "receivers/"]))
}

fn connection_type(resource_type: &str) -> ApiResult<ResourceType> {
    match resource_type {
        "senders" => Ok(ResourceType::ConnectionSender),
        "receivers" => Ok(ResourceType::ConnectionReceiver),
        _ => Err(ApiError::not_found()),
    }
}

async fn list_connection_resources(
    Path((_version, resource_type)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let resources = state.model.connection_resources.read().await;
    let ids: Vec<String> = resources
        .iter_type(resource_type)
        .filter(|resource| resource.has_data())
        .map(|resource| format!("{}/", resource.id))
        .collect();
    Ok(Json(ids).into_response())
}

async fn resource_index(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let resources = state.model.connection_resources.read().await;
    resources
        .find_typed(&id, resource_type)
        .filter(|resource| resource.has_data())
        .ok_or_else(ApiError::not_found)?;

    let mut routes = vec!["constraints/", "staged/", "active/", "transporttype/"];
    if resource_type == ResourceType::ConnectionSender {
        routes.push("transportfile/");
    }
    Ok(Json(routes).into_response())
}

async fn endpoint(
    state: &ApiState,
    resource_type: ResourceType,
    id: &str,
    field: &str,
) -> ApiResult<Value> {
    let resources = state.model.connection_resources.read().await;
    let resource = resources
        .find_typed(id, resource_type)
        .filter(|resource| resource.has_data())
        .ok_or_else(ApiError::not_found)?;
    Ok(resource.data[field].clone())
}

async fn get_constraints(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let constraints = endpoint(&state, resource_type, &id, "endpoint_constraints").await?;
    Ok(Json(constraints).into_response())
}

async fn get_active(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let active = endpoint(&state, resource_type, &id, "endpoint_active").await?;
    Ok(Json(active).into_response())
}

async fn get_transporttype(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let transport_type = endpoint(&state, resource_type, &id, "transport_type").await?;
    Ok(Json(transport_type).into_response())
}

async fn get_transportfile(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    if resource_type != "senders" {
        return Err(ApiError::not_found());
    }
    let transportfile =
        endpoint(&state, ResourceType::ConnectionSender, &id, "endpoint_transportfile").await?;

    let data = transportfile["data"]
        .as_str()
        .filter(|data| !data.is_empty())
        .ok_or_else(|| ApiError::not_found())?
        .to_string();
    let content_type = transportfile["type"].as_str().unwrap_or("application/sdp").to_string();

    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

async fn get_staged(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    // a concurrent immediate activation makes the staged parameters
    // momentarily indeterminate; observe causality by waiting it out
    wait_immediate_not_in_flight(&state, resource_type, &id).await?;
    let staged = endpoint(&state, resource_type, &id, "endpoint_staged").await?;
    Ok(Json(staged).into_response())
}

/// Block while the resource has an immediate activation in flight, bounded
/// by `immediate_activation_max`.
async fn wait_immediate_not_in_flight(
    state: &ApiState,
    resource_type: ResourceType,
    id: &str,
) -> ApiResult<()> {
    let timeout = {
        let settings = state.model.settings.read().await;
        Duration::from_secs(settings.immediate_activation_max)
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut updates = state.model.watch_updates();

    loop {
        {
            let resources = state.model.connection_resources.read().await;
            let Some(resource) = resources.find_typed(id, resource_type) else {
                return Ok(());
            };
            let activation = &resource.data["endpoint_staged"]["activation"];
            let in_flight = activation["mode"].as_str() == Some("activate_immediate")
                && !activation["requested_time"].is_null()
                && activation["activation_time"].is_null();
            if !in_flight {
                return Ok(());
            }
        }
        tokio::select! {
            _ = state.model.shutdown.cancelled() => {
                return Err(ApiError::internal("shutting down"))
            }
            _ = updates.changed() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ApiError::internal("immediate activation did not complete in time"))
            }
        }
    }
}

// merge a PATCH body into the staged endpoint, activation aside
fn merge_staged(staged: &mut Value, patch: &Value) -> Result<(), String> {
    let Some(patch) = patch.as_object() else {
        return Err("request body must be an object".to_string());
    };

    for (key, value) in patch {
        match key.as_str() {
            "activation" => {}
            "transport_params" => {
                let staged_legs = staged["transport_params"]
                    .as_array()
                    .map(Vec::len)
                    .unwrap_or_default();
                let Some(patch_legs) = value.as_array() else {
                    return Err("transport_params must be an array".to_string());
                };
                if patch_legs.len() != staged_legs {
                    return Err(format!(
                        "transport_params must have {} legs",
                        staged_legs
                    ));
                }
                for (index, leg) in patch_legs.iter().enumerate() {
                    let Some(leg) = leg.as_object() else {
                        return Err("transport_params legs must be objects".to_string());
                    };
                    for (param, param_value) in leg {
                        staged["transport_params"][index][param.as_str()] = param_value.clone();
                    }
                }
            }
            "master_enable" | "sender_id" | "receiver_id" | "transport_file" => {
                staged[key.as_str()] = value.clone();
            }
            unknown => return Err(format!("unexpected field: {}", unknown)),
        }
    }
    Ok(())
}

async fn patch_staged(
    Path((_version, resource_type, id)): Path<(String, String, String)>,
    State(state): State<ApiState>,
    Json(patch): Json<Value>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    patch_staged_impl(&state, resource_type, &id, &patch).await
}

async fn patch_staged_impl(
    state: &ApiState,
    resource_type: ResourceType,
    id: &str,
    patch: &Value,
) -> ApiResult<Response> {
    let request_time = Tai::now();
    let requested_mode = parse_requested_activation(patch)?;

    let staged = loop {
        wait_immediate_not_in_flight(state, resource_type, id).await?;

        let mut resources = state.model.connection_resources.write().await;
        let resource = resources
            .find_typed(id, resource_type)
            .filter(|resource| resource.has_data())
            .ok_or_else(ApiError::not_found)?;

        // a competing request may have staged its own immediate activation
        // between the wait and this lock; go back to waiting if so
        let activation = &resource.data["endpoint_staged"]["activation"];
        if activation["mode"].as_str() == Some(ActivationMode::ActivateImmediate.as_str())
            && !activation["requested_time"].is_null()
            && activation["activation_time"].is_null()
        {
            continue;
        }

        // scheduled activations lock the resource until they fire or are
        // cancelled
        let pending_mode = resource.data["endpoint_staged"]["activation"]["mode"]
            .as_str()
            .and_then(|mode| mode.parse::<ActivationMode>().ok());
        if matches!(pending_mode, Some(mode) if mode.is_scheduled())
            && !matches!(requested_mode, RequestedActivation::Cancel)
        {
            return Err(ApiError::locked(format!("{} has a pending activation", id)));
        }

        let mut staged = resource.data["endpoint_staged"].clone();
        merge_staged(&mut staged, patch).map_err(ApiError::bad_request)?;

        match &requested_mode {
            RequestedActivation::None => {}
            RequestedActivation::Cancel => {
                staged["activation"] = make_activation();
            }
            RequestedActivation::Scheduled {
                mode,
                requested_time,
                activation_time,
            } => {
                staged["activation"] = json!({
                    "mode": mode.as_str(),
                    "requested_time": requested_time.to_string(),
                    "activation_time": activation_time.to_string(),
                });
            }
            RequestedActivation::Immediate => {
                // requested_time set and activation_time null is the
                // in-flight lock the activation engine looks for
                staged["activation"] = json!({
                    "mode": ActivationMode::ActivateImmediate.as_str(),
                    "requested_time": request_time.to_string(),
                    "activation_time": null,
                });
            }
        }

        let staged_copy = staged.clone();
        resources
            .modify(id, move |resource| {
                resource.data["endpoint_staged"] = staged_copy;
            })
            .map_err(ApiError::from)?;
        break staged;
    };
    state.model.notify();

    match requested_mode {
        RequestedActivation::None | RequestedActivation::Cancel => {
            debug!(%id, "staged parameters updated");
            Ok((StatusCode::OK, Json(staged)).into_response())
        }
        RequestedActivation::Scheduled { .. } => {
            info!(%id, "activation scheduled");
            Ok((StatusCode::ACCEPTED, Json(staged)).into_response())
        }
        RequestedActivation::Immediate => {
            finish_immediate_activation(state, resource_type, id, request_time).await
        }
    }
}

enum RequestedActivation {
    /// No activation field in the request
    None,
    /// `mode: null`, cancelling any pending activation
    Cancel,
    Scheduled {
        mode: ActivationMode,
        requested_time: Tai,
        activation_time: Tai,
    },
    Immediate,
}

fn parse_requested_activation(patch: &Value) -> ApiResult<RequestedActivation> {
    let Some(activation) = patch.get("activation") else {
        return Ok(RequestedActivation::None);
    };
    let mode = &activation["mode"];
    if mode.is_null() {
        return Ok(RequestedActivation::Cancel);
    }
    let mode: ActivationMode = mode
        .as_str()
        .ok_or_else(|| ApiError::bad_request("activation mode must be a string or null"))?
        .parse()
        .map_err(|e: crate::NmosError| ApiError::bad_request(e.to_string()))?;

    match mode {
        ActivationMode::ActivateImmediate => {
            if !activation["requested_time"].is_null() {
                return Err(ApiError::bad_request(
                    "requested_time may not be specified for an immediate activation",
                ));
            }
            Ok(RequestedActivation::Immediate)
        }
        scheduled => {
            let requested_time: Tai = activation["requested_time"]
                .as_str()
                .and_then(|time| time.parse().ok())
                .ok_or_else(|| ApiError::bad_request("requested_time must be a TAI timestamp"))?;
            // relative requests resolve against the request time, so the
            // activation engine only ever sees absolute deadlines
            let activation_time = match scheduled {
                ActivationMode::ActivateScheduledAbsolute => requested_time,
                _ => requested_time.after(Tai::now()),
            };
            Ok(RequestedActivation::Scheduled {
                mode: scheduled,
                requested_time,
                activation_time,
            })
        }
    }
}

/// Wait for the activation engine to process an in-flight immediate
/// activation, then finish the transition of the staged activation to null.
async fn finish_immediate_activation(
    state: &ApiState,
    resource_type: ResourceType,
    id: &str,
    request_time: Tai,
) -> ApiResult<Response> {
    let timeout = {
        let settings = state.model.settings.read().await;
        Duration::from_secs(settings.immediate_activation_max)
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut updates = state.model.watch_updates();

    loop {
        {
            let resources = state.model.connection_resources.read().await;
            let resource = resources
                .find_typed(id, resource_type)
                .ok_or_else(ApiError::not_found)?;
            let activation = &resource.data["endpoint_staged"]["activation"];

            if activation["requested_time"].is_null() {
                // the engine hit an error and unlocked the resource
                return Err(ApiError::internal("immediate activation failed"));
            }
            let requested = request_time.to_string();
            if activation["requested_time"].as_str() != Some(requested.as_str()) {
                // another request's activation overtook this one
                return Err(ApiError::internal("immediate activation was superseded"));
            }
            if !activation["activation_time"].is_null() {
                break;
            }
        }
        tokio::select! {
            _ = state.model.shutdown.cancelled() => {
                return Err(ApiError::internal("shutting down"))
            }
            _ = updates.changed() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ApiError::internal("immediate activation did not complete in time"))
            }
        }
    }

    // success: report the activation time and return the staged endpoint to
    // its resting state
    let mut resources = state.model.connection_resources.write().await;
    let resource = resources
        .find_typed(id, resource_type)
        .ok_or_else(ApiError::not_found)?;
    let mut staged = resource.data["endpoint_staged"].clone();
    let activation_time = staged["activation"]["activation_time"].clone();
    staged["activation"] = json!({
        "mode": ActivationMode::ActivateImmediate.as_str(),
        "requested_time": null,
        "activation_time": activation_time,
    });

    resources
        .modify(id, |resource| {
            crate::activation::set_resource_not_pending(&mut resource.data);
        })
        .map_err(ApiError::from)?;
    drop(resources);
    state.model.notify();

    info!(%id, "immediate activation complete");
    Ok((StatusCode::OK, Json(staged)).into_response())
}

async fn bulk_staged(
    Path((_version, resource_type)): Path<(String, String)>,
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let resource_type = connection_type(&resource_type)?;
    let Some(entries) = body.as_array() else {
        return Err(ApiError::bad_request("bulk request must be an array"));
    };

    let mut results = Vec::with_capacity(entries.len());
    let mut seen = std::collections::HashSet::new();

    for entry in entries {
        let Some(id) = entry["id"].as_str() else {
            results.push(json!({ "id": null, "code": 400, "error": "id is required" }));
            continue;
        };

        // the same resource may not be activated twice in one bulk request
        if !seen.insert(id.to_string()) {
            results.push(json!({
                "id": id,
                "code": 400,
                "error": "duplicate id in bulk request",
            }));
            continue;
        }

        match patch_staged_impl(&state, resource_type, id, &entry["params"]).await {
            Ok(response) => {
                results.push(json!({ "id": id, "code": response.status().as_u16() }));
            }
            Err(e) => {
                results.push(json!({
                    "id": id,
                    "code": e.status.as_u16(),
                    "error": e.error,
                    "debug": e.debug,
                }));
            }
        }
    }

    Ok((StatusCode::OK, Json(results)).into_response())
}
