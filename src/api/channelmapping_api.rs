// Channel Mapping API
// Staged map actions and their activation, mirroring the connection staging
// contract

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::activation::{make_activation, ActivationMode};
use crate::model::resource::ResourceType;
use crate::model::tai::Tai;

use super::error::{ApiError, ApiResult};
use super::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(index))
        .route("/outputs/", get(list_outputs))
        .route("/outputs/:id/map", get(get_output_map))
        .route("/map/", get(map_index))
        .route("/map/active", get(get_active_map))
        .route("/map/activations", get(get_staged_activations).post(post_activation))
}

async fn index() -> impl IntoResponse {
    Json(json!(["map/", "outputs/"]))
}

async fn map_index() -> impl IntoResponse {
    Json(json!(["active/", "activations/"]))
}

async fn list_outputs(State(state): State<ApiState>) -> ApiResult<Response> {
    let resources = state.model.channelmapping_resources.read().await;
    let ids: Vec<String> = resources
        .iter_type(ResourceType::ChannelMappingOutput)
        .filter(|output| output.has_data())
        .map(|output| format!("{}/", output.id))
        .collect();
    Ok(Json(ids).into_response())
}

async fn get_output_map(
    Path((_version, id)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let resources = state.model.channelmapping_resources.read().await;
    let output = resources
        .find_typed(&id, ResourceType::ChannelMappingOutput)
        .filter(|output| output.has_data())
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(output.data["endpoint_active"]["map"].clone()).into_response())
}

/// The active map across all outputs.
async fn get_active_map(State(state): State<ApiState>) -> ApiResult<Response> {
    let resources = state.model.channelmapping_resources.read().await;
    let mut map = Map::new();
    let mut activation = make_activation();
    let mut latest: Option<Tai> = None;
    for output in resources.iter_type(ResourceType::ChannelMappingOutput) {
        if !output.has_data() {
            continue;
        }
        map.insert(output.id.clone(), output.data["endpoint_active"]["map"].clone());
        // the most recent activation across outputs describes the map
        let output_activation = &output.data["endpoint_active"]["activation"];
        let activated_at = output_activation["activation_time"]
            .as_str()
            .and_then(|time| time.parse::<Tai>().ok());
        if let Some(activated_at) = activated_at {
            if latest.map(|latest| activated_at > latest).unwrap_or(true) {
                latest = Some(activated_at);
                activation = output_activation.clone();
            }
        }
    }
    Ok(Json(json!({ "activation": activation, "map": map })).into_response())
}

/// The staged actions awaiting activation, by output.
async fn get_staged_activations(State(state): State<ApiState>) -> ApiResult<Response> {
    let resources = state.model.channelmapping_resources.read().await;
    let mut staged = Map::new();
    for output in resources.iter_type(ResourceType::ChannelMappingOutput) {
        if !output.has_data() {
            continue;
        }
        if output.data["endpoint_staged"]["activation"]["mode"].is_null() {
            continue;
        }
        staged.insert(output.id.clone(), output.data["endpoint_staged"].clone());
    }
    Ok(Json(Value::Object(staged)).into_response())
}

/// Stage an activation: `{activation, action: {output_id: {channel: route}}}`.
async fn post_activation(
    Path(_version): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let Some(action) = body["action"].as_object() else {
        return Err(ApiError::bad_request("action must be an object keyed by output"));
    };
    if action.is_empty() {
        return Err(ApiError::bad_request("action must name at least one output"));
    }

    let request_time = Tai::now();
    let activation = &body["activation"];
    let mode: ActivationMode = activation["mode"]
        .as_str()
        .ok_or_else(|| ApiError::bad_request("activation mode is required"))?
        .parse()
        .map_err(|e: crate::NmosError| ApiError::bad_request(e.to_string()))?;

    let staged_activation = match mode {
        ActivationMode::ActivateImmediate => json!({
            "mode": mode.as_str(),
            "requested_time": request_time.to_string(),
            "activation_time": null,
        }),
        scheduled => {
            let requested_time: Tai = activation["requested_time"]
                .as_str()
                .and_then(|time| time.parse().ok())
                .ok_or_else(|| ApiError::bad_request("requested_time must be a TAI timestamp"))?;
            let activation_time = match scheduled {
                ActivationMode::ActivateScheduledAbsolute => requested_time,
                _ => requested_time.after(Tai::now()),
            };
            json!({
                "mode": scheduled.as_str(),
                "requested_time": requested_time.to_string(),
                "activation_time": activation_time.to_string(),
            })
        }
    };

    {
        let mut resources = state.model.channelmapping_resources.write().await;

        // every referenced output must exist and be unlocked before any is
        // staged
        for output_id in action.keys() {
            let output = resources
                .find_typed(output_id, ResourceType::ChannelMappingOutput)
                .filter(|output| output.has_data())
                .ok_or_else(ApiError::not_found)?;
            if !output.data["endpoint_staged"]["activation"]["mode"].is_null() {
                return Err(ApiError::locked(format!(
                    "output {} has a pending activation",
                    output_id
                )));
            }
        }

        for (output_id, output_action) in action {
            let staged_activation = staged_activation.clone();
            let output_action = output_action.clone();
            resources
                .modify(output_id, move |output| {
                    output.data["endpoint_staged"]["action"] = output_action;
                    output.data["endpoint_staged"]["activation"] = staged_activation;
                })
                .map_err(ApiError::from)?;
        }
    }
    state.model.notify();

    if mode == ActivationMode::ActivateImmediate {
        finish_immediate_activation(&state, action).await
    } else {
        info!("channel mapping activation scheduled");
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "activation": staged_activation, "action": body["action"] })),
        )
            .into_response())
    }
}

async fn finish_immediate_activation(
    state: &ApiState,
    action: &Map<String, Value>,
) -> ApiResult<Response> {
    let timeout = {
        let settings = state.model.settings.read().await;
        Duration::from_secs(settings.immediate_activation_max)
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut updates = state.model.watch_updates();

    loop {
        let mut all_processed = true;
        {
            let resources = state.model.channelmapping_resources.read().await;
            for output_id in action.keys() {
                let output = resources
                    .find_typed(output_id, ResourceType::ChannelMappingOutput)
                    .ok_or_else(ApiError::not_found)?;
                let activation = &output.data["endpoint_staged"]["activation"];
                if activation["requested_time"].is_null() {
                    return Err(ApiError::internal("channel mapping activation failed"));
                }
                if activation["activation_time"].is_null() {
                    all_processed = false;
                }
            }
        }
        if all_processed {
            break;
        }
        tokio::select! {
            _ = state.model.shutdown.cancelled() => {
                return Err(ApiError::internal("shutting down"))
            }
            _ = updates.changed() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ApiError::internal("activation did not complete in time"))
            }
        }
    }

    // return the staged activations to their resting state
    let mut activation_time = Value::Null;
    {
        let mut resources = state.model.channelmapping_resources.write().await;
        for output_id in action.keys() {
            if let Some(output) = resources.find_typed(output_id, ResourceType::ChannelMappingOutput)
            {
                activation_time =
                    output.data["endpoint_staged"]["activation"]["activation_time"].clone();
            }
            let _ = resources.modify(output_id, |output| {
                crate::activation::set_resource_not_pending(&mut output.data);
            });
        }
    }
    state.model.notify();

    info!("channel mapping immediate activation complete");
    Ok((
        StatusCode::OK,
        Json(json!({
            "activation": {
                "mode": ActivationMode::ActivateImmediate.as_str(),
                "requested_time": null,
                "activation_time": activation_time,
            },
            "action": Value::Object(action.clone()),
        })),
    )
        .into_response())
}
