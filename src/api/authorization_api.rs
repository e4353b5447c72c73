// Authorization endpoints
// The authorization code callback and this node's published JWKS

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info, warn};

use crate::authorization::client::{AuthorizationClient, TokenEndpointAuth};
use crate::authorization::state::AuthorizationFlowResult;

use super::error::{ApiError, ApiResult};
use super::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/callback", get(authorization_callback))
        .route("/jwks", get(jwks))
}

/// This node's public keys, for `private_key_jwt` verification by the
/// authorization server.
async fn jwks(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.keys.public_jwks())
}

/// The redirect target of the authorization code flow.
///
/// Validates the `state` nonce against the pending flow, exchanges the code
/// for a token, and wakes the waiting behaviour task with the outcome.
async fn authorization_callback(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ApiState>,
) -> ApiResult<Response> {
    // only a callback for a flow this node actually started may decide that
    // flow's outcome
    let known_flow = match params.get("state") {
        Some(nonce) => state.auth_state.read().await.pending_flows.contains_key(nonce),
        None => false,
    };

    let outcome = handle_callback(&state, &params).await;

    if known_flow {
        let result = match &outcome {
            Ok(()) => AuthorizationFlowResult::AccessTokenReceived,
            Err(_) => AuthorizationFlowResult::Failed,
        };
        state.auth_state.write().await.flow_result = result;
        state.model.notify();
    }

    match outcome {
        Ok(()) => {
            info!("authorization code exchanged");
            Ok((StatusCode::OK, "Authorization complete; this page can be closed.").into_response())
        }
        Err(e) => {
            error!("authorization callback failed: {} ({:?})", e.error, e.debug);
            Err(e)
        }
    }
}

async fn handle_callback(state: &ApiState, params: &HashMap<String, String>) -> ApiResult<()> {
    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or_default();
        warn!(%error, description, "authorization server reported an error");
        return Err(ApiError::bad_request(format!(
            "authorization failed: {}",
            error
        )));
    }

    let nonce = params
        .get("state")
        .ok_or_else(|| ApiError::bad_request("state is required"))?;
    let code = params
        .get("code")
        .ok_or_else(|| ApiError::bad_request("code is required"))?;

    let (flow, client_id, auth) = {
        let auth_state = state.auth_state.read().await;
        let flow = auth_state
            .pending_flows
            .get(nonce)
            .cloned()
            .ok_or_else(|| ApiError::bad_request("unknown state nonce"))?;
        let client_metadata = auth_state
            .client_metadata
            .as_ref()
            .ok_or_else(|| ApiError::internal("client is not registered"))?;
        let client_id = client_metadata["client_id"]
            .as_str()
            .ok_or_else(|| ApiError::internal("client metadata has no client_id"))?
            .to_string();
        let auth = TokenEndpointAuth::from_client_metadata(client_metadata, &state.keys);
        (flow, client_id, auth)
    };

    let request_timeout = {
        let settings = state.model.settings.read().await;
        Duration::from_secs(settings.authorization_request_max)
    };
    let client = AuthorizationClient::new(request_timeout).map_err(ApiError::from)?;
    let token = client
        .exchange_authorization_code(
            &flow.token_endpoint,
            &client_id,
            &auth,
            code,
            &flow.code_verifier,
            &flow.redirect_uri,
        )
        .await
        .map_err(ApiError::from)?;

    state.auth_state.write().await.bearer_token = Some(token);
    Ok(())
}
