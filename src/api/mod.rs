// API surface
// Router assembly, shared handler state and bearer token enforcement

pub mod authorization_api;
pub mod channelmapping_api;
pub mod connection_api;
pub mod error;
pub mod query_api;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::authorization::{self, SharedAuthorizationState, SigningKeys, TokenValidation};
use crate::events::ws::QueryWsConnections;
use crate::model::NodeModel;
use crate::AuthorizationErrorKind;

use error::ApiError;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub model: Arc<NodeModel>,
    pub auth_state: SharedAuthorizationState,
    pub connections: Arc<QueryWsConnections>,
    pub keys: Arc<SigningKeys>,
}

/// Assemble the complete router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .nest("/x-nmos/query/:version", query_api::router())
        .nest("/x-nmos/connection/:version", connection_api::router())
        .nest("/x-nmos/channelmapping/:version", channelmapping_api::router())
        .nest("/x-authorization", authorization_api::router())
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(json!(["x-nmos/", "x-authorization/"]))
}

/// Enforce bearer tokens on the NMOS APIs when `server_authorization` is
/// enabled.
///
/// A token from an unknown issuer is rejected with 401 `invalid_token`, and
/// the token-issuer helper is asked to fetch that issuer's keys so the
/// client's retry can succeed.
async fn bearer_auth(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let (enabled, audience) = {
        let settings = state.model.settings.read().await;
        (settings.server_authorization, settings.host_name.clone())
    };
    if !enabled {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    // the authorization endpoints themselves are reachable without a token
    let Some(nmos_path) = path.strip_prefix("/x-nmos/") else {
        return next.run(request).await;
    };

    // "/x-nmos/{api}/{version}/{...}"
    let mut segments = nmos_path.splitn(3, '/');
    let api = segments.next().unwrap_or_default().to_string();
    let _version = segments.next();
    let sub_path = segments.next().unwrap_or_default().to_string();

    let access = match request.method().as_str() {
        "GET" | "HEAD" | "OPTIONS" => authorization::Access::Read,
        _ => authorization::Access::Write,
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let validation = {
        let auth_state = state.auth_state.read().await;
        authorization::validate_access_token(
            &auth_state,
            token.as_deref(),
            &audience,
            &api,
            &sub_path,
            access,
        )
    };

    match validation {
        TokenValidation::Succeeded => next.run(request).await,
        TokenValidation::WithoutAuthentication => {
            ApiError::unauthorized(AuthorizationErrorKind::WithoutAuthentication, &audience)
                .into_response()
        }
        TokenValidation::InsufficientScope => {
            ApiError::unauthorized(AuthorizationErrorKind::InsufficientScope, &audience)
                .into_response()
        }
        TokenValidation::NoMatchingKeys => {
            // recoverable: fetch the issuer's keys in the background
            if let Some(issuer) = token.as_deref().and_then(authorization::validation::token_issuer)
            {
                debug!(%issuer, "requesting keys for unknown token issuer");
                authorization::request_token_issuer_keys(&state.model, &state.auth_state, &issuer)
                    .await;
            }
            ApiError::unauthorized(AuthorizationErrorKind::NoMatchingKeys, &audience)
                .into_response()
        }
        TokenValidation::Failed => {
            ApiError::unauthorized(AuthorizationErrorKind::Failed, &audience).into_response()
        }
    }
}
