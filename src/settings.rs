// Node settings
// Configuration loaded from an optional JSON file with NMOS_-prefixed environment overrides

use serde::{Deserialize, Serialize};

use crate::model::api_version::ApiVersion;
use crate::model::resource::make_id;

/// Every tunable of the node behaviour core.
///
/// Defaults follow the NMOS specifications' recommended values; any field can
/// be overridden from the settings file or from the environment, e.g.
/// `NMOS_REGISTRATION_HEARTBEAT_INTERVAL=10`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stable identifier for this configuration; names the persisted
    /// authorization client metadata file
    pub seed_id: String,

    /// The id of the self node resource
    pub node_id: String,

    pub label: String,
    pub host_name: String,
    pub host_address: String,
    pub http_port: u16,

    // per-API ports, defaulting to http_port
    pub node_port: Option<u16>,
    pub connection_port: Option<u16>,
    pub events_port: Option<u16>,
    pub channelmapping_port: Option<u16>,

    /// Fallback registry when DNS-SD browsing yields nothing, e.g.
    /// "http://registry.example.com:8080"
    pub registry_address: Option<String>,
    pub registry_version: ApiVersion,

    /// Registration services outside [highest_pri, lowest_pri] are ignored
    pub highest_pri: u32,
    pub lowest_pri: u32,

    // discovery backoff, in seconds
    pub discovery_backoff_min: f64,
    pub discovery_backoff_max: f64,
    pub discovery_backoff_factor: f64,

    // registration, in seconds
    pub registration_heartbeat_interval: u64,
    pub registration_heartbeat_max: u64,
    pub registration_request_max: u64,
    pub registration_expiry_interval: u64,

    /// Registration API versions this node is willing to use, preferred first
    pub registration_versions: Vec<ApiVersion>,

    // query paging
    pub query_paging_default: usize,
    pub query_paging_limit: usize,

    // subscription websockets, in seconds
    pub events_expiry_interval: u64,
    pub events_heartbeat_interval: u64,

    /// Port substituted for "auto" RTP transport ports
    pub auto_rtp_port: u16,

    /// Bound on the wait for an in-flight immediate activation, in seconds
    pub immediate_activation_max: u64,

    // authorization (IS-10)
    pub client_authorization: bool,
    pub server_authorization: bool,
    pub authorization_address: Option<String>,
    pub authorization_version: ApiVersion,
    pub authorization_selector: Option<String>,
    pub authorization_request_max: u64,
    /// Seconds between token refreshes; negative means half the token lifetime
    pub access_token_refresh_interval: i64,
    pub authorization_code_flow_max: i64,
    pub fetch_authorization_public_keys_interval_min: u64,
    pub fetch_authorization_public_keys_interval_max: u64,
    pub authorization_scopes: Vec<String>,
    pub authorization_flow: AuthorizationFlow,
    pub token_endpoint_auth_method: String,
    pub authorization_redirect_port: Option<u16>,
    /// Directory for the persisted client metadata file, {seed_id}.json
    pub client_metadata_dir: String,
}

/// Which OAuth 2.0 grant obtains the node's bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationFlow {
    ClientCredentials,
    AuthorizationCode,
}

impl Settings {
    pub fn node_port(&self) -> u16 {
        self.node_port.unwrap_or(self.http_port)
    }

    pub fn connection_port(&self) -> u16 {
        self.connection_port.unwrap_or(self.http_port)
    }

    pub fn events_port(&self) -> u16 {
        self.events_port.unwrap_or(self.http_port)
    }

    pub fn channelmapping_port(&self) -> u16 {
        self.channelmapping_port.unwrap_or(self.http_port)
    }

    /// Load settings from an optional file, then the environment.
    pub fn load(file: Option<&str>) -> anyhow::Result<Settings> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("NMOS"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            seed_id: make_id(),
            node_id: make_id(),
            label: String::new(),
            host_name: "localhost".to_string(),
            host_address: "127.0.0.1".to_string(),
            http_port: 3212,
            node_port: None,
            connection_port: None,
            events_port: None,
            channelmapping_port: None,
            registry_address: None,
            registry_version: ApiVersion::new(1, 3),
            highest_pri: 0,
            lowest_pri: 254,
            discovery_backoff_min: 1.0,
            discovery_backoff_max: 30.0,
            discovery_backoff_factor: 1.5,
            registration_heartbeat_interval: 5,
            registration_heartbeat_max: 5,
            registration_request_max: 30,
            registration_expiry_interval: 12,
            registration_versions: vec![
                ApiVersion::new(1, 3),
                ApiVersion::new(1, 2),
                ApiVersion::new(1, 1),
                ApiVersion::new(1, 0),
            ],
            query_paging_default: 10,
            query_paging_limit: 100,
            events_expiry_interval: 12,
            events_heartbeat_interval: 5,
            auto_rtp_port: 5004,
            immediate_activation_max: 30,
            client_authorization: false,
            server_authorization: false,
            authorization_address: None,
            authorization_version: ApiVersion::new(1, 0),
            authorization_selector: None,
            authorization_request_max: 30,
            access_token_refresh_interval: -1,
            authorization_code_flow_max: 30,
            fetch_authorization_public_keys_interval_min: 3600,
            fetch_authorization_public_keys_interval_max: 3720,
            authorization_scopes: vec!["registration".to_string()],
            authorization_flow: AuthorizationFlow::ClientCredentials,
            token_endpoint_auth_method: "client_secret_basic".to_string(),
            authorization_redirect_port: None,
            client_metadata_dir: ".".to_string(),
        }
    }
}
