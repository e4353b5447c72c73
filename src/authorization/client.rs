// Authorization server client
// RFC 8414 metadata, RFC 7591 dynamic registration, RFC 6749 token grants
// and JWKS fetching

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::settings::{AuthorizationFlow, Settings};
use crate::{NmosError, Result};

use super::keys::SigningKeys;
use super::pkce::CodeChallengeMethod;
use super::state::{now_seconds, BearerToken};

/// How this client authenticates to the token endpoint.
pub enum TokenEndpointAuth {
    ClientSecretBasic { client_secret: String },
    ClientSecretPost { client_secret: String },
    PrivateKeyJwt { keys: Arc<SigningKeys> },
    None,
}

impl TokenEndpointAuth {
    pub fn method_name(&self) -> &'static str {
        match self {
            TokenEndpointAuth::ClientSecretBasic { .. } => "client_secret_basic",
            TokenEndpointAuth::ClientSecretPost { .. } => "client_secret_post",
            TokenEndpointAuth::PrivateKeyJwt { .. } => "private_key_jwt",
            TokenEndpointAuth::None => "none",
        }
    }

    /// Build the credentials for a registered client from its metadata.
    pub fn from_client_metadata(
        client_metadata: &Value,
        keys: &Arc<SigningKeys>,
    ) -> TokenEndpointAuth {
        let method = client_metadata["token_endpoint_auth_method"]
            .as_str()
            .unwrap_or("client_secret_basic");
        let secret = client_metadata["client_secret"].as_str().map(str::to_string);
        match (method, secret) {
            ("private_key_jwt", _) => TokenEndpointAuth::PrivateKeyJwt { keys: keys.clone() },
            ("none", _) => TokenEndpointAuth::None,
            ("client_secret_post", Some(client_secret)) => {
                TokenEndpointAuth::ClientSecretPost { client_secret }
            }
            (_, Some(client_secret)) => TokenEndpointAuth::ClientSecretBasic { client_secret },
            (_, None) => TokenEndpointAuth::None,
        }
    }
}

/// HTTP client for one authorization server.
pub struct AuthorizationClient {
    http: reqwest::Client,
}

impl AuthorizationClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NmosError::Internal(e.to_string()))?;
        Ok(AuthorizationClient { http })
    }

    /// GET `/.well-known/oauth-authorization-server[/{selector}]`.
    pub async fn fetch_server_metadata(
        &self,
        server_uri: &str,
        selector: Option<&str>,
    ) -> Result<Value> {
        let mut url = format!(
            "{}/.well-known/oauth-authorization-server",
            server_uri.trim_end_matches('/')
        );
        if let Some(selector) = selector {
            url = format!("{}/{}", url, selector);
        }
        debug!(%url, "fetching authorization server metadata");

        let metadata: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for required in ["issuer", "authorization_endpoint", "token_endpoint", "jwks_uri"] {
            if !metadata[required].is_string() {
                return Err(NmosError::Validation(format!(
                    "authorization server metadata is missing {}",
                    required
                )));
            }
        }
        Ok(metadata)
    }

    /// POST `/register` (RFC 7591).
    pub async fn register_client(
        &self,
        registration_endpoint: &str,
        client_metadata: &Value,
        initial_access_token: Option<&str>,
    ) -> Result<Value> {
        info!(registration_endpoint, "registering client");
        let mut request = self.http.post(registration_endpoint).json(client_metadata);
        if let Some(token) = initial_access_token {
            request = request.bearer_auth(token);
        }
        let registered = request
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        if !registered["client_id"].is_string() {
            return Err(NmosError::Validation(
                "client registration response is missing client_id".to_string(),
            ));
        }
        Ok(registered)
    }

    /// GET the current client metadata from the registration client URI
    /// (RFC 7592, used when the server supports OpenID Connect).
    pub async fn fetch_client_metadata(
        &self,
        registration_client_uri: &str,
        registration_access_token: &str,
    ) -> Result<Value> {
        Ok(self
            .http
            .get(registration_client_uri)
            .bearer_auth(registration_access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// POST the token endpoint with a `client_credentials` grant.
    pub async fn request_token_client_credentials(
        &self,
        token_endpoint: &str,
        client_id: &str,
        auth: &TokenEndpointAuth,
        scopes: &[String],
    ) -> Result<BearerToken> {
        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("scope".to_string(), scopes.join(" ")),
        ];
        self.token_request(token_endpoint, client_id, auth, &mut form).await
    }

    /// POST the token endpoint with an `authorization_code` grant.
    pub async fn exchange_authorization_code(
        &self,
        token_endpoint: &str,
        client_id: &str,
        auth: &TokenEndpointAuth,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<BearerToken> {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("code_verifier".to_string(), code_verifier.to_string()),
        ];
        self.token_request(token_endpoint, client_id, auth, &mut form).await
    }

    /// POST the token endpoint with a `refresh_token` grant.
    pub async fn refresh_token(
        &self,
        token_endpoint: &str,
        client_id: &str,
        auth: &TokenEndpointAuth,
        refresh_token: &str,
    ) -> Result<BearerToken> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        self.token_request(token_endpoint, client_id, auth, &mut form).await
    }

    async fn token_request(
        &self,
        token_endpoint: &str,
        client_id: &str,
        auth: &TokenEndpointAuth,
        form: &mut Vec<(String, String)>,
    ) -> Result<BearerToken> {
        let mut request = self.http.post(token_endpoint);
        match auth {
            TokenEndpointAuth::ClientSecretBasic { client_secret } => {
                request = request.basic_auth(client_id, Some(client_secret));
            }
            TokenEndpointAuth::ClientSecretPost { client_secret } => {
                form.push(("client_id".to_string(), client_id.to_string()));
                form.push(("client_secret".to_string(), client_secret.clone()));
            }
            TokenEndpointAuth::PrivateKeyJwt { keys } => {
                form.push(("client_id".to_string(), client_id.to_string()));
                form.push((
                    "client_assertion_type".to_string(),
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                ));
                form.push((
                    "client_assertion".to_string(),
                    keys.make_client_assertion(client_id, token_endpoint)?,
                ));
            }
            TokenEndpointAuth::None => {
                form.push(("client_id".to_string(), client_id.to_string()));
            }
        }

        let mut token: BearerToken = request
            .form(&*form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        token.received_at = now_seconds();
        if token.access_token.is_empty() {
            return Err(NmosError::Validation("token response has no access_token".to_string()));
        }
        Ok(token)
    }

    /// GET an issuer's JWKS.
    pub async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet> {
        debug!(jwks_uri, "fetching public keys");
        Ok(self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Check that the server's advertised capabilities cover what the settings
/// ask for.
///
/// Per RFC 8414 an absent `token_endpoint_auth_methods_supported` means
/// `client_secret_basic` only; the other lists are checked only when
/// advertised.
pub fn verify_server_capabilities(metadata: &Value, settings: &Settings) -> Result<()> {
    let advertised = |field: &str| -> Option<Vec<&str>> {
        metadata[field]
            .as_array()
            .map(|values| values.iter().filter_map(Value::as_str).collect())
    };

    let grant_type = match settings.authorization_flow {
        AuthorizationFlow::ClientCredentials => "client_credentials",
        AuthorizationFlow::AuthorizationCode => "authorization_code",
    };
    if let Some(grant_types) = advertised("grant_types_supported") {
        if !grant_types.contains(&grant_type) {
            return Err(NmosError::Validation(format!(
                "authorization server does not support the {} grant",
                grant_type
            )));
        }
    }

    if settings.authorization_flow == AuthorizationFlow::AuthorizationCode {
        if let Some(response_types) = advertised("response_types_supported") {
            if !response_types.contains(&"code") {
                return Err(NmosError::Validation(
                    "authorization server does not support the code response type".to_string(),
                ));
            }
        }
    }

    if let Some(scopes) = advertised("scopes_supported") {
        for scope in &settings.authorization_scopes {
            if !scopes.contains(&scope.as_str()) {
                return Err(NmosError::Validation(format!(
                    "authorization server does not support the {} scope",
                    scope
                )));
            }
        }
    }

    let auth_methods = advertised("token_endpoint_auth_methods_supported")
        .unwrap_or_else(|| vec!["client_secret_basic"]);
    if !auth_methods.contains(&settings.token_endpoint_auth_method.as_str()) {
        return Err(NmosError::Validation(format!(
            "authorization server does not support the {} token endpoint auth method",
            settings.token_endpoint_auth_method
        )));
    }

    Ok(())
}

/// The RFC 7591 registration request body for this node.
pub fn make_client_registration_request(
    settings: &Settings,
    redirect_uri: &str,
    jwks_uri: &str,
) -> Value {
    let grant_types = match settings.authorization_flow {
        AuthorizationFlow::ClientCredentials => vec!["client_credentials"],
        AuthorizationFlow::AuthorizationCode => vec!["authorization_code", "refresh_token"],
    };
    let response_types = match settings.authorization_flow {
        AuthorizationFlow::ClientCredentials => Vec::new(),
        AuthorizationFlow::AuthorizationCode => vec!["code"],
    };

    let mut request = json!({
        "client_name": if settings.label.is_empty() { "nmos_node" } else { &settings.label },
        "grant_types": grant_types,
        "response_types": response_types,
        "scope": settings.authorization_scopes.join(" "),
        "token_endpoint_auth_method": settings.token_endpoint_auth_method,
    });
    if settings.authorization_flow == AuthorizationFlow::AuthorizationCode {
        request["redirect_uris"] = json!([redirect_uri]);
    }
    if settings.token_endpoint_auth_method == "private_key_jwt" {
        request["jwks_uri"] = json!(jwks_uri);
    }
    request
}

/// The URI a user agent is sent to for the authorization code flow.
pub fn make_authorization_uri(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    code_challenge: &str,
    code_challenge_method: CodeChallengeMethod,
) -> Result<String> {
    let mut url = Url::parse(authorization_endpoint)
        .map_err(|e| NmosError::Validation(format!("invalid authorization endpoint: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &scopes.join(" "))
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", code_challenge_method.as_str());
    Ok(url.to_string())
}
