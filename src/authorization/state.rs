// Authorization state
// The bearer token, issuer metadata and JWKS caches shared between the
// behaviour tasks and the token validation path

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A bearer token as issued by the authorization server, with the time it
/// was received so its remaining lifetime can be computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default = "now_seconds")]
    pub received_at: u64,
}

pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl BearerToken {
    /// Seconds of validity remaining.
    pub fn remaining(&self) -> i64 {
        self.expires_in - (now_seconds().saturating_sub(self.received_at)) as i64
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() <= 0
    }
}

/// Everything known about one token issuer.
#[derive(Debug, Clone)]
pub struct IssuerInfo {
    /// RFC 8414 authorization server metadata
    pub metadata: serde_json::Value,
    /// The issuer's current public keys
    pub jwks: JwkSet,
}

impl IssuerInfo {
    pub fn new(metadata: serde_json::Value, jwks: JwkSet) -> Self {
        IssuerInfo { metadata, jwks }
    }
}

/// An authorization code flow waiting for its redirect callback.
#[derive(Debug, Clone)]
pub struct PendingAuthorizationFlow {
    pub code_verifier: String,
    pub redirect_uri: String,
    pub token_endpoint: String,
}

/// The outcome of an authorization code flow, reported by the callback
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationFlowResult {
    Pending,
    AccessTokenReceived,
    Failed,
}

/// Shared authorization state.
///
/// Guarded by a reader-writer lock like the resource stores; writers call
/// `NodeModel::notify` after releasing it so that waiting tasks (the
/// token-issuer helper, a handler waiting for the code flow) re-check their
/// predicates.
#[derive(Default)]
pub struct AuthorizationState {
    /// The most recent token from the selected authorization server
    pub bearer_token: Option<BearerToken>,

    /// Metadata and keys by issuer
    pub issuers: HashMap<String, IssuerInfo>,

    /// The authorization server currently in use
    pub authorization_server_uri: Option<String>,

    /// The issuer identifier of the selected server, keying into `issuers`
    pub selected_issuer: Option<String>,

    /// Registered client metadata for the selected server
    pub client_metadata: Option<serde_json::Value>,

    /// Set by token validation when a token's issuer has no cached keys;
    /// cleared by the token-issuer helper once it has fetched them
    pub fetch_token_issuer_pubkeys: Option<String>,

    /// In-flight authorization code flows by state nonce
    pub pending_flows: HashMap<String, PendingAuthorizationFlow>,

    /// Outcome of the most recent authorization code flow
    pub flow_result: AuthorizationFlowResult,
}

impl Default for AuthorizationFlowResult {
    fn default() -> Self {
        AuthorizationFlowResult::Pending
    }
}

pub type SharedAuthorizationState = Arc<RwLock<AuthorizationState>>;

impl AuthorizationState {
    pub fn new() -> SharedAuthorizationState {
        Arc::new(RwLock::new(AuthorizationState::default()))
    }

    /// Keys for an issuer, if cached.
    pub fn issuer_keys(&self, issuer: &str) -> Option<&JwkSet> {
        self.issuers.get(issuer).map(|info| &info.jwks)
    }
}
