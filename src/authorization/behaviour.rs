// Authorization behaviour
// The state machine that keeps this node supplied with a valid bearer token
// and current issuer keys, plus the token-issuer helper

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::dnssd::{ServiceDiscovery, AUTHORIZATION_SERVICE};
use crate::model::NodeModel;
use crate::settings::AuthorizationFlow;
use crate::{NmosError, Result};

use super::client::{
    make_authorization_uri, make_client_registration_request, verify_server_capabilities,
    AuthorizationClient, TokenEndpointAuth,
};
use super::keys::SigningKeys;
use super::persistence::{
    client_metadata_path, find_client_metadata, is_client_expired, load_client_metadata,
    save_client_metadata, ClientMetadataRecord,
};
use super::pkce;
use super::state::{
    AuthorizationFlowResult, IssuerInfo, PendingAuthorizationFlow, SharedAuthorizationState,
};

/// Callback used to hand the authorization URI to a user agent during the
/// authorization code flow.
pub type OpenBrowserHandler = Box<dyn Fn(&str) + Send + Sync>;

/// The modes of the authorization behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    InitialDiscovery,
    RequestServerMetadata,
    ClientRegistration,
    TokenGrant,
    AuthorizationOperation,
    Rediscovery,
}

/// Everything the behaviour needs, bundled to keep the task signature sane.
pub struct AuthorizationBehaviour {
    pub model: Arc<NodeModel>,
    pub auth_state: SharedAuthorizationState,
    pub keys: Arc<SigningKeys>,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub open_browser: Option<OpenBrowserHandler>,
}

/// The main authorization state machine.
///
/// Discovers an authorization server, registers this node as a client,
/// obtains a bearer token via the configured grant, then keeps the token
/// fresh and the server's keys current until an error sends it back to
/// rediscovery.
pub async fn authorization_behaviour_task(behaviour: AuthorizationBehaviour) {
    let AuthorizationBehaviour {
        model,
        auth_state,
        keys,
        discovery,
        open_browser,
    } = behaviour;

    let (request_timeout, mut discovery_backoff) = {
        let settings = model.settings.read().await;
        (
            Duration::from_secs(settings.authorization_request_max),
            0f64,
        )
    };
    let client = match AuthorizationClient::new(request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("authorization client construction failed: {}", e);
            return;
        }
    };

    let mut mode = Mode::InitialDiscovery;
    let mut services: Vec<String> = Vec::new();

    info!("starting authorization behaviour");

    while !model.shutdown.is_cancelled() {
        match mode {
            Mode::InitialDiscovery | Mode::Rediscovery => {
                if discovery_backoff > 0.0 {
                    let wait = rand::thread_rng().gen_range(0.0..discovery_backoff);
                    tokio::select! {
                        _ = model.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
                    }
                }

                services = discover_authorization_services(&model, discovery.as_ref()).await;

                let settings = model.settings.read().await;
                discovery_backoff = (discovery_backoff * settings.discovery_backoff_factor)
                    .max(settings.discovery_backoff_min)
                    .min(settings.discovery_backoff_max);
                drop(settings);

                if services.is_empty() {
                    warn!("no authorization servers discovered");
                } else {
                    mode = Mode::RequestServerMetadata;
                }
            }

            Mode::RequestServerMetadata => {
                let Some(server_uri) = services.first().cloned() else {
                    mode = Mode::Rediscovery;
                    continue;
                };
                let selector = model.settings.read().await.authorization_selector.clone();

                match request_server_metadata(&client, &model, &auth_state, &server_uri, selector.as_deref())
                    .await
                {
                    Ok(()) => mode = Mode::ClientRegistration,
                    Err(e) => {
                        error!(%server_uri, "server metadata fetch failed: {}", e);
                        services.remove(0);
                        mode = Mode::Rediscovery;
                    }
                }
            }

            Mode::ClientRegistration => {
                match client_registration(&client, &model, &auth_state).await {
                    Ok(()) => mode = Mode::TokenGrant,
                    Err(e) => {
                        error!("client registration failed: {}", e);
                        if !services.is_empty() {
                            services.remove(0);
                        }
                        mode = Mode::Rediscovery;
                    }
                }
            }

            Mode::TokenGrant => {
                let flow = model.settings.read().await.authorization_flow;
                let granted = match flow {
                    AuthorizationFlow::ClientCredentials => {
                        fetch_token(&client, &model, &auth_state, &keys).await
                    }
                    AuthorizationFlow::AuthorizationCode => {
                        authorization_code_flow(&model, &auth_state, &keys, open_browser.as_ref())
                            .await
                    }
                };
                match granted {
                    Ok(()) => {
                        model.notify();
                        mode = Mode::AuthorizationOperation;
                        discovery_backoff = 0.0;
                    }
                    Err(e) => {
                        error!("token grant failed: {}", e);
                        mode = Mode::Rediscovery;
                    }
                }
            }

            Mode::AuthorizationOperation => {
                authorization_operation(&client, &model, &auth_state, &keys).await;
                // either shutdown, or an error that calls for a fresh start
                // with the same server's metadata
                mode = Mode::RequestServerMetadata;
            }
        }
    }

    info!("stopping authorization behaviour");
}

/// Browse for authorization servers, falling back to the configured address.
async fn discover_authorization_services(
    model: &NodeModel,
    discovery: &dyn ServiceDiscovery,
) -> Vec<String> {
    let mut services = match discovery.browse(AUTHORIZATION_SERVICE).await {
        Ok(found) => {
            let settings = model.settings.read().await;
            let mut found: Vec<_> = found
                .into_iter()
                .filter(|service| {
                    let priority = service.priority();
                    priority >= settings.highest_pri && priority <= settings.lowest_pri
                })
                .collect();
            found.sort_by_key(|service| service.priority());
            found.iter().map(|service| service.base_url()).collect()
        }
        Err(e) => {
            warn!("authorization service browse failed: {}", e);
            Vec::new()
        }
    };

    if services.is_empty() {
        if let Some(address) = &model.settings.read().await.authorization_address {
            services.push(address.clone());
        }
    }
    services
}

/// Fetch and verify the server's metadata, and prime its JWKS cache.
async fn request_server_metadata(
    client: &AuthorizationClient,
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    server_uri: &str,
    selector: Option<&str>,
) -> Result<()> {
    let metadata = client.fetch_server_metadata(server_uri, selector).await?;
    {
        let settings = model.settings.read().await;
        verify_server_capabilities(&metadata, &settings)?;
    }

    let issuer = metadata["issuer"].as_str().unwrap_or(server_uri).to_string();
    let jwks_uri = metadata["jwks_uri"].as_str().unwrap_or_default().to_string();
    let jwks = client.fetch_jwks(&jwks_uri).await?;

    {
        let mut state = auth_state.write().await;
        state.authorization_server_uri = Some(server_uri.to_string());
        state.selected_issuer = Some(issuer.clone());
        state.issuers.insert(issuer, IssuerInfo::new(metadata, jwks));
    }
    model.notify();
    Ok(())
}

/// Ensure this node is registered as a client with the selected server,
/// reusing and refreshing the persisted registration where possible.
async fn client_registration(
    client: &AuthorizationClient,
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
) -> Result<()> {
    let (server_uri, metadata) = selected_server(auth_state).await?;

    let (path, registration_request) = {
        let settings = model.settings.read().await;
        let path = client_metadata_path(&settings.client_metadata_dir, &settings.seed_id);
        let callback_uri = format!(
            "http://{}:{}/x-authorization/callback",
            settings.host_address,
            settings.authorization_redirect_port.unwrap_or(settings.http_port)
        );
        let jwks_uri = format!(
            "http://{}:{}/x-authorization/jwks",
            settings.host_address, settings.http_port
        );
        let request = make_client_registration_request(&settings, &callback_uri, &jwks_uri);
        (path, request)
    };

    let records = load_client_metadata(&path);
    let mut cached = find_client_metadata(&records, &server_uri);

    // when the server supports OpenID Connect, re-read the current client
    // metadata rather than trusting the cache
    if let Some(client_metadata) = &cached {
        let openid = metadata["registration_endpoint"].is_string()
            && client_metadata["registration_client_uri"].is_string()
            && client_metadata["registration_access_token"].is_string();
        if openid {
            match client
                .fetch_client_metadata(
                    client_metadata["registration_client_uri"].as_str().unwrap_or_default(),
                    client_metadata["registration_access_token"].as_str().unwrap_or_default(),
                )
                .await
            {
                Ok(current) => cached = Some(current),
                Err(e) => {
                    warn!("client metadata refresh failed, re-registering: {}", e);
                    cached = None;
                }
            }
        }
    }

    let client_metadata = match cached {
        Some(client_metadata) if !is_client_expired(&client_metadata) => client_metadata,
        _ => {
            let registration_endpoint = metadata["registration_endpoint"]
                .as_str()
                .ok_or_else(|| {
                    NmosError::Validation(
                        "authorization server does not support dynamic registration".to_string(),
                    )
                })?
                .to_string();
            let registered = client
                .register_client(&registration_endpoint, &registration_request, None)
                .await?;
            save_client_metadata(
                &path,
                records,
                ClientMetadataRecord {
                    authorization_server_uri: server_uri.clone(),
                    client_metadata: registered.clone(),
                },
            )?;
            registered
        }
    };

    auth_state.write().await.client_metadata = Some(client_metadata);
    model.notify();
    Ok(())
}

/// Fetch a bearer token with the client credentials grant.
async fn fetch_token(
    client: &AuthorizationClient,
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    keys: &Arc<SigningKeys>,
) -> Result<()> {
    let (_, metadata) = selected_server(auth_state).await?;
    let token_endpoint = metadata["token_endpoint"].as_str().unwrap_or_default().to_string();
    let (client_id, auth) = client_credentials(auth_state, keys).await?;
    let scopes = model.settings.read().await.authorization_scopes.clone();

    let token = client
        .request_token_client_credentials(&token_endpoint, &client_id, &auth, &scopes)
        .await?;
    info!(expires_in = token.expires_in, "bearer token obtained");
    auth_state.write().await.bearer_token = Some(token);
    Ok(())
}

/// Run one authorization code flow: send the user agent to the
/// authorization endpoint and wait for the callback to deliver a token.
async fn authorization_code_flow(
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    keys: &Arc<SigningKeys>,
    open_browser: Option<&OpenBrowserHandler>,
) -> Result<()> {
    let (_, metadata) = selected_server(auth_state).await?;
    let (client_id, _) = client_credentials(auth_state, keys).await?;

    let authorization_endpoint = metadata["authorization_endpoint"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let token_endpoint = metadata["token_endpoint"].as_str().unwrap_or_default().to_string();
    let advertised: Option<Vec<String>> = metadata["code_challenge_methods_supported"]
        .as_array()
        .map(|methods| {
            methods
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        });
    let method = pkce::CodeChallengeMethod::select(advertised.as_ref());

    let (scopes, redirect_uri, flow_max) = {
        let settings = model.settings.read().await;
        (
            settings.authorization_scopes.clone(),
            format!(
                "http://{}:{}/x-authorization/callback",
                settings.host_address,
                settings.authorization_redirect_port.unwrap_or(settings.http_port)
            ),
            settings.authorization_code_flow_max,
        )
    };

    let code_verifier = pkce::make_code_verifier();
    let code_challenge = pkce::make_code_challenge(&code_verifier, method);
    let state_nonce = pkce::make_state_nonce();

    let uri = make_authorization_uri(
        &authorization_endpoint,
        &client_id,
        &redirect_uri,
        &scopes,
        &state_nonce,
        &code_challenge,
        method,
    )?;

    {
        let mut state = auth_state.write().await;
        state.flow_result = AuthorizationFlowResult::Pending;
        state.pending_flows.insert(
            state_nonce.clone(),
            PendingAuthorizationFlow {
                code_verifier,
                redirect_uri,
                token_endpoint,
            },
        );
    }

    match open_browser {
        Some(open_browser) => open_browser(&uri),
        None => info!(%uri, "authorization code flow requires a user agent"),
    }

    // wait for the callback endpoint to report the outcome
    let mut updates = model.watch_updates();
    let deadline = tokio::time::Instant::now()
        + if flow_max > -1 {
            Duration::from_secs(flow_max as u64)
        } else {
            // effectively unbounded
            Duration::from_secs(365 * 24 * 60 * 60)
        };
    let outcome = loop {
        let result = auth_state.read().await.flow_result;
        match result {
            AuthorizationFlowResult::AccessTokenReceived => break Ok(()),
            AuthorizationFlowResult::Failed => {
                break Err(NmosError::Authorization {
                    kind: crate::AuthorizationErrorKind::Failed,
                    message: "authorization code flow failed".to_string(),
                })
            }
            AuthorizationFlowResult::Pending => {}
        }
        tokio::select! {
            _ = model.shutdown.cancelled() => {
                break Err(NmosError::Internal("shutdown".to_string()))
            }
            _ = updates.changed() => {}
            _ = tokio::time::sleep_until(deadline) => {
                break Err(NmosError::Authorization {
                    kind: crate::AuthorizationErrorKind::Failed,
                    message: "authorization code flow timed out".to_string(),
                })
            }
        }
    };

    auth_state.write().await.pending_flows.remove(&state_nonce);
    outcome
}

/// Registered operation: keep the token fresh and the issuer keys current.
///
/// Returns when either concurrent activity errors, sending the behaviour
/// back to the server metadata fetch.
async fn authorization_operation(
    client: &AuthorizationClient,
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    keys: &Arc<SigningKeys>,
) {
    // the two refresh activities run on independent schedules; each deadline
    // is recomputed only when its own timer fires, so neither can starve the
    // other
    let mut token_deadline =
        tokio::time::Instant::now() + token_refresh_interval(model, auth_state).await;
    let mut jwks_deadline = tokio::time::Instant::now() + jwks_fetch_interval(model).await;

    loop {
        tokio::select! {
            _ = model.shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(token_deadline) => {
                if let Err(e) = refresh_bearer_token(client, model, auth_state, keys).await {
                    error!("token refresh failed: {}", e);
                    return;
                }
                model.notify();
                token_deadline =
                    tokio::time::Instant::now() + token_refresh_interval(model, auth_state).await;
            }
            _ = tokio::time::sleep_until(jwks_deadline) => {
                if let Err(e) = refresh_issuer_keys(client, auth_state).await {
                    error!("public key fetch failed: {}", e);
                    return;
                }
                model.notify();
                jwks_deadline = tokio::time::Instant::now() + jwks_fetch_interval(model).await;
            }
        }
    }
}

/// Seconds until the bearer token should be refreshed: the configured
/// interval, or half the token's lifetime when the interval is negative.
async fn token_refresh_interval(
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
) -> Duration {
    let interval = model.settings.read().await.access_token_refresh_interval;
    if interval < 0 {
        let expires_in = auth_state
            .read()
            .await
            .bearer_token
            .as_ref()
            .map(|token| token.expires_in)
            .unwrap_or(0);
        // refresh at half lifetime, so the token in use is always valid
        Duration::from_secs((expires_in / 2).max(1) as u64)
    } else {
        Duration::from_secs(interval as u64)
    }
}

/// A uniformly random delay until the next JWKS fetch.
async fn jwks_fetch_interval(model: &NodeModel) -> Duration {
    let settings = model.settings.read().await;
    Duration::from_secs(rand::thread_rng().gen_range(
        settings.fetch_authorization_public_keys_interval_min
            ..=settings.fetch_authorization_public_keys_interval_max,
    ))
}

async fn refresh_bearer_token(
    client: &AuthorizationClient,
    model: &NodeModel,
    auth_state: &SharedAuthorizationState,
    keys: &Arc<SigningKeys>,
) -> Result<()> {
    let (_, metadata) = selected_server(auth_state).await?;
    let token_endpoint = metadata["token_endpoint"].as_str().unwrap_or_default().to_string();
    let (client_id, auth) = client_credentials(auth_state, keys).await?;

    let refresh_token = auth_state
        .read()
        .await
        .bearer_token
        .as_ref()
        .and_then(|token| token.refresh_token.clone());

    let token = match refresh_token {
        Some(refresh_token) => {
            client
                .refresh_token(&token_endpoint, &client_id, &auth, &refresh_token)
                .await?
        }
        None => {
            let scopes = model.settings.read().await.authorization_scopes.clone();
            client
                .request_token_client_credentials(&token_endpoint, &client_id, &auth, &scopes)
                .await?
        }
    };
    auth_state.write().await.bearer_token = Some(token);
    Ok(())
}

async fn refresh_issuer_keys(
    client: &AuthorizationClient,
    auth_state: &SharedAuthorizationState,
) -> Result<()> {
    let issuers: Vec<(String, String)> = auth_state
        .read()
        .await
        .issuers
        .iter()
        .map(|(issuer, info)| {
            (issuer.clone(), info.metadata["jwks_uri"].as_str().unwrap_or_default().to_string())
        })
        .collect();

    for (issuer, jwks_uri) in issuers {
        let jwks = client.fetch_jwks(&jwks_uri).await?;
        if let Some(info) = auth_state.write().await.issuers.get_mut(&issuer) {
            info.jwks = jwks;
        }
    }
    Ok(())
}

async fn selected_server(
    auth_state: &SharedAuthorizationState,
) -> Result<(String, serde_json::Value)> {
    let state = auth_state.read().await;
    let server_uri = state
        .authorization_server_uri
        .clone()
        .ok_or_else(|| NmosError::Internal("no authorization server selected".to_string()))?;
    let metadata = state
        .selected_issuer
        .as_ref()
        .and_then(|issuer| state.issuers.get(issuer))
        .map(|info| info.metadata.clone())
        .ok_or_else(|| NmosError::Internal("no authorization server metadata".to_string()))?;
    Ok((server_uri, metadata))
}

async fn client_credentials(
    auth_state: &SharedAuthorizationState,
    keys: &Arc<SigningKeys>,
) -> Result<(String, TokenEndpointAuth)> {
    let state = auth_state.read().await;
    let client_metadata = state
        .client_metadata
        .as_ref()
        .ok_or_else(|| NmosError::Internal("client is not registered".to_string()))?;
    let client_id = client_metadata["client_id"]
        .as_str()
        .ok_or_else(|| NmosError::Internal("client metadata has no client_id".to_string()))?
        .to_string();
    let auth = TokenEndpointAuth::from_client_metadata(client_metadata, keys);
    Ok((client_id, auth))
}

/// The token-issuer helper.
///
/// Waits for token validation to flag an unknown issuer, then fetches that
/// issuer's metadata and keys so the client's retry can succeed.
pub async fn token_issuer_helper_task(
    model: Arc<NodeModel>,
    auth_state: SharedAuthorizationState,
) {
    let request_timeout = {
        let settings = model.settings.read().await;
        Duration::from_secs(settings.authorization_request_max)
    };
    let client = match AuthorizationClient::new(request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("token issuer helper construction failed: {}", e);
            return;
        }
    };

    let mut updates = model.watch_updates();

    info!("starting token issuer helper");

    while !model.shutdown.is_cancelled() {
        let pending = auth_state.read().await.fetch_token_issuer_pubkeys.clone();

        let Some(issuer) = pending else {
            tokio::select! {
                _ = model.shutdown.cancelled() => break,
                _ = updates.changed() => continue,
            }
        };

        info!(%issuer, "fetching keys for unknown token issuer");
        match fetch_issuer(&client, &issuer).await {
            Ok(info) => {
                let mut state = auth_state.write().await;
                state.issuers.insert(issuer.clone(), info);
                state.fetch_token_issuer_pubkeys = None;
            }
            Err(e) => {
                error!(%issuer, "issuer fetch failed: {}", e);
                auth_state.write().await.fetch_token_issuer_pubkeys = None;
            }
        }
        model.notify();
    }

    info!("stopping token issuer helper");
}

async fn fetch_issuer(client: &AuthorizationClient, issuer: &str) -> Result<IssuerInfo> {
    let metadata = client
        .fetch_server_metadata(issuer.trim_end_matches('/'), None)
        .await?;
    let jwks_uri = metadata["jwks_uri"].as_str().unwrap_or_default().to_string();
    let jwks = client.fetch_jwks(&jwks_uri).await?;
    Ok(IssuerInfo::new(metadata, jwks))
}
