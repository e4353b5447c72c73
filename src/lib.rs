// NMOS node behaviour core
// Discovery, registration, connection management and authorization state machines
// for a media node participating in an NMOS ecosystem

//! # NMOS Node Library
//!
//! This crate implements the behaviour core of an NMOS media node:
//!
//! - **IS-04** discovery and registration: the node advertises itself,
//!   discovers registries via DNS-SD, registers its resources and keeps them
//!   alive with heartbeats, falling back to peer-to-peer operation when no
//!   registry is available ([`registration`]).
//! - **IS-05 / IS-08** connection and channel mapping management: staged
//!   parameters transition to active parameters at a scheduled or immediate
//!   activation time ([`activation`]).
//! - **IS-10** authorization: authorization server discovery, dynamic client
//!   registration, token grants and refresh, and JWKS-based access token
//!   validation ([`authorization`]).
//! - A Query API engine with basic queries, RQL and cursor paging
//!   ([`query`]), and WebSocket subscription fan-out ([`events`]).
//!
//! All state lives in the shared [`NodeModel`]; long-lived tasks communicate
//! through its stores and notification channel, never through globals.

pub mod activation;
pub mod api;
pub mod authorization;
pub mod dnssd;
pub mod events;
pub mod model;
pub mod query;
pub mod registration;
pub mod settings;

// Re-export the core domain types for easy access
pub use model::{
    make_id, ApiVersion, Health, NodeModel, Resource, ResourceStore, ResourceType, Tai,
};
pub use settings::{AuthorizationFlow, Settings};

use thiserror::Error;

/// How an access token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationErrorKind {
    /// No token, or a malformed / unverifiable one
    WithoutAuthentication,
    /// A valid token whose claims do not permit the operation
    InsufficientScope,
    /// A well-formed token from an issuer whose keys are not yet cached
    NoMatchingKeys,
    /// Any other validation failure
    Failed,
}

impl std::fmt::Display for AuthorizationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationErrorKind::WithoutAuthentication => write!(f, "without authentication"),
            AuthorizationErrorKind::InsufficientScope => write!(f, "insufficient scope"),
            AuthorizationErrorKind::NoMatchingKeys => write!(f, "no matching keys"),
            AuthorizationErrorKind::Failed => write!(f, "failed"),
        }
    }
}

/// Error type for all node behaviour operations.
///
/// The kinds mirror how errors are handled: transient network failures feed
/// the retry/failover states, peer protocol errors are logged and dropped,
/// validation failures surface as HTTP 400, and so on.
#[derive(Error, Debug)]
pub enum NmosError {
    /// Insert of an id the store already holds
    #[error("duplicate resource: {id}")]
    DuplicateResource { id: String },

    /// Lookup of an id the store does not hold
    #[error("resource not found: {id}")]
    ResourceNotFound { id: String },

    /// Timeout, connection failure or 5xx from a peer; retried via the
    /// nearest rediscovery/backoff state
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// 4xx from a registry or authorization server on a well-formed request
    #[error("peer protocol error ({status}): {message}")]
    PeerProtocol { status: u16, message: String },

    /// Schema mismatch or constraint violation on inbound data
    #[error("validation failure: {0}")]
    Validation(String),

    /// Operation attempted while a scheduled activation is pending
    #[error("resource locked: {0}")]
    LockedConflict(String),

    /// A resource's API version exceeds the requested one
    #[error("downgrade conflict, canonical location {location}")]
    DowngradeConflict { location: String },

    /// Access token validation failure
    #[error("authorization error: {kind}: {message}")]
    Authorization {
        kind: AuthorizationErrorKind,
        message: String,
    },

    /// Logic violation; the core remains operational
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for NmosError {
    fn from(err: std::io::Error) -> Self {
        NmosError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for NmosError {
    fn from(err: reqwest::Error) -> Self {
        // status() is only set for errors generated by error_for_status; all
        // request failures (connect, timeout, body) count as transient
        match err.status() {
            Some(status) if status.is_client_error() => NmosError::PeerProtocol {
                status: status.as_u16(),
                message: err.to_string(),
            },
            _ => NmosError::TransientNetwork(err.to_string()),
        }
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, NmosError>;
