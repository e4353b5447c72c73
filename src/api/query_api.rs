// Query API
// Filtered, paged access to the resource store, and subscription management

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::events::{make_subscription, ws::serve_connection};
use crate::model::api_version::ApiVersion;
use crate::model::resource::ResourceType;
use crate::model::make_id;
use crate::query::{ResourcePaging, ResourceQuery};

use super::error::{ApiError, ApiResult};
use super::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(index))
        .route("/subscriptions", get(list_subscriptions).post(create_subscription))
        .route(
            "/subscriptions/:id",
            get(get_subscription).delete(delete_subscription),
        )
        .route("/ws/:id", get(subscription_websocket))
        .route("/:resource_type", get(list_resources))
        .route("/:resource_type/:id", get(get_resource))
}

async fn index() -> impl IntoResponse {
    Json(json!([
        "nodes/",
        "devices/",
        "sources/",
        "flows/",
        "senders/",
        "receivers/",
        "subscriptions/"
    ]))
}

/// Decode a query string into flat parameters.
///
/// `query.rql` is kept URI-encoded; its reserved characters are significant
/// and the RQL parser decodes the values itself.
pub fn parse_flat_query(raw: Option<&str>) -> Map<String, Value> {
    let mut flat = Map::new();
    let Some(raw) = raw else { return flat };

    for pair in raw.split('&').filter(|pair| !pair.is_empty()) {
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(raw_key);
        let value = if key == "query.rql" {
            raw_value.to_string()
        } else {
            decode_component(raw_value)
        };
        flat.insert(key, Value::String(value));
    }
    flat
}

fn decode_component(component: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", component).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| component.to_string())
}

fn parse_version(version: &str) -> ApiResult<ApiVersion> {
    version
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid API version: {}", version)))
}

fn parse_resource_type(resource_type: &str) -> ApiResult<ResourceType> {
    ResourceType::from_plural(resource_type)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown resource type"))
}

// the request URL with the paging parameters removed, for the Link header
fn query_uri_with_no_paging(
    headers: &HeaderMap,
    http_port: u16,
    path: &str,
    flat_query_params: &Map<String, Value>,
) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", http_port));

    let mut query = String::new();
    for (key, value) in flat_query_params {
        if key.starts_with("paging.") {
            continue;
        }
        if !query.is_empty() {
            query.push('&');
        }
        let value = if key == "query.rql" {
            value.as_str().unwrap_or_default().to_string()
        } else {
            url::form_urlencoded::byte_serialize(value.as_str().unwrap_or_default().as_bytes())
                .collect()
        };
        query.push_str(&format!("{}={}", key, value));
    }

    if query.is_empty() {
        format!("http://{}{}", host, path)
    } else {
        format!("http://{}{}?{}", host, path, query)
    }
}

async fn list_resources(
    Path((version, resource_type)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    list_resources_impl(&version, &resource_type, raw, headers, state).await
}

// subscriptions are routed ahead of the :resource_type captures
async fn list_subscriptions(
    Path(version): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    list_resources_impl(&version, "subscriptions", raw, headers, state).await
}

async fn get_subscription(
    Path((version, id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    get_resource_impl(&version, "subscriptions", &id, raw, state).await
}

async fn list_resources_impl(
    version: &str,
    resource_type: &str,
    raw: Option<String>,
    headers: HeaderMap,
    state: ApiState,
) -> ApiResult<Response> {
    let version = parse_version(version)?;
    parse_resource_type(resource_type)?;

    let flat_query_params = parse_flat_query(raw.as_deref());
    let query = ResourceQuery::new(version, format!("/{}", resource_type), &flat_query_params)?;

    let (default_limit, max_limit, http_port) = {
        let settings = state.model.settings.read().await;
        (
            settings.query_paging_default,
            settings.query_paging_limit,
            settings.http_port,
        )
    };

    let resources = state.model.node_resources.read().await;
    let mut paging = ResourcePaging::new(
        &flat_query_params,
        resources.most_recent_update(),
        default_limit,
        max_limit,
    )?;
    if !paging.valid() {
        return Err(ApiError::bad_request("paging.since is after paging.until"));
    }

    let page: Vec<Value> = paging
        .page(&resources, |resource| query.matches_resource(resource))
        .iter()
        .map(|resource| query.downgrade(resource))
        .collect();
    debug!(%version, resource_type, count = page.len(), "query");

    let base_link = query_uri_with_no_paging(
        &headers,
        http_port,
        &format!("/x-nmos/query/{}/{}", version, resource_type),
        &flat_query_params,
    );

    let mut response = Json(page).into_response();
    for (name, value) in paging.headers(&base_link) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    Ok(response)
}

async fn get_resource(
    Path((version, resource_type, id)): Path<(String, String, String)>,
    RawQuery(raw): RawQuery,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    get_resource_impl(&version, &resource_type, &id, raw, state).await
}

async fn get_resource_impl(
    version: &str,
    resource_type: &str,
    id: &str,
    raw: Option<String>,
    state: ApiState,
) -> ApiResult<Response> {
    let version = parse_version(version)?;
    let resource_type = parse_resource_type(resource_type)?;

    let flat_query_params = parse_flat_query(raw.as_deref());
    // only downgrade queries apply to single resources
    let query = ResourceQuery::new(version, "", &flat_query_params)?;

    let resources = state.model.node_resources.read().await;
    let resource = resources
        .find_typed(id, resource_type)
        .filter(|resource| resource.has_data())
        .ok_or_else(ApiError::not_found)?;

    if !crate::query::is_permitted_downgrade(
        resource.version,
        resource_type,
        version,
        query.downgrade_version,
    ) {
        if resource.version > version {
            // the resource exists at a higher version
            return Err(ApiError::downgrade_conflict(format!(
                "/x-nmos/query/{}/{}/{}",
                resource.version,
                resource_type.plural(),
                id
            )));
        }
        return Err(ApiError::not_found());
    }

    Ok(Json(query.downgrade(resource)).into_response())
}

async fn create_subscription(
    Path(version): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let version = parse_version(&version)?;

    // all of these fields are required
    for required in ["max_update_rate_ms", "persist", "resource_path", "params"] {
        if body.get(required).is_none() {
            return Err(ApiError::bad_request(format!("{} is required", required)));
        }
    }
    // and clients are not allowed to choose these
    for forbidden in ["id", "ws_href"] {
        if body.get(forbidden).is_some() {
            return Err(ApiError::bad_request(format!("{} may not be specified", forbidden)));
        }
    }

    let max_update_rate_ms = body["max_update_rate_ms"]
        .as_u64()
        .ok_or_else(|| ApiError::bad_request("max_update_rate_ms must be a number"))?;
    let persist = body["persist"]
        .as_bool()
        .ok_or_else(|| ApiError::bad_request("persist must be a boolean"))?;
    let resource_path = body["resource_path"]
        .as_str()
        .ok_or_else(|| ApiError::bad_request("resource_path must be a string"))?
        .to_string();
    let params = body["params"].clone();
    if !params.is_object() {
        return Err(ApiError::bad_request("params must be an object"));
    }

    let (host, http_port) = {
        let settings = state.model.settings.read().await;
        (settings.host_address.clone(), settings.http_port)
    };

    let mut resources = state.model.node_resources.write().await;

    // an equivalent subscription is returned rather than duplicated
    let existing = resources
        .iter_type(ResourceType::Subscription)
        .filter(|subscription| subscription.has_data() && subscription.version == version)
        .find(|subscription| {
            subscription.data["resource_path"] == body["resource_path"]
                && subscription.data["params"] == params
                && subscription.data["persist"] == body["persist"]
                && subscription.data["max_update_rate_ms"] == body["max_update_rate_ms"]
        })
        .map(|subscription| subscription.data.clone());
    if let Some(existing) = existing {
        debug!("returning equivalent existing subscription");
        return Ok((StatusCode::OK, Json(existing)).into_response());
    }

    let id = make_id();
    let ws_href = format!("ws://{}:{}/x-nmos/query/{}/ws/{}", host, http_port, version, id);
    let subscription = make_subscription(
        &id,
        version,
        &ws_href,
        max_update_rate_ms,
        persist,
        &resource_path,
        params,
    );
    let data = subscription.data.clone();
    resources.insert(subscription).map_err(ApiError::from)?;
    drop(resources);
    state.model.notify();

    info!(%id, %resource_path, "subscription created");
    Ok((StatusCode::CREATED, Json(data)).into_response())
}

async fn delete_subscription(
    Path((_version, id)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    let mut resources = state.model.node_resources.write().await;
    let subscription = resources
        .find_typed(&id, ResourceType::Subscription)
        .filter(|subscription| subscription.has_data())
        .ok_or_else(ApiError::not_found)?;

    // only persistent subscriptions can be deleted on request;
    // non-persistent ones live and die with their connections
    let persist = subscription.data["persist"].as_bool().unwrap_or(false);
    if !persist {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "a non-persistent subscription cannot be deleted",
        ));
    }

    resources.erase(&id, false).map_err(ApiError::from)?;
    drop(resources);
    state.model.notify();

    info!(%id, "subscription deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn subscription_websocket(
    ws: WebSocketUpgrade,
    Path((_version, id)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> Response {
    let model = state.model.clone();
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| serve_connection(socket, model, connections, id))
}
